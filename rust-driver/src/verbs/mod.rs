/// Driver context implementing the verbs
mod ctx;

pub use ctx::HcaContext;

use crate::{
    device::SpecialQpKind,
    error::{PostError, Result},
    qp::{QpAttr, QpAttrMask, QpCap, QpInitAttr},
    types::{
        CompletionHandler, CqAttr, CqHandle, NotifyKind, Polled, QpHandle, RecvWr, SendWr,
        SrqAttr, SrqHandle, SrqInitAttr,
    },
};

/// Verbs accepted by the transport core.
///
/// Every call may run concurrently with any other call on the same
/// context. Calls made outside of `device_start`/`device_stop` fail with
/// [`crate::HcaError::DeviceStopped`].
pub trait VerbsOps {
    /// Configures the special QP ranges and starts accepting verbs.
    ///
    /// # Errors
    ///
    /// Returns an error if firmware rejects CONF_SPECIAL_QP.
    fn device_start(&self) -> Result<()>;

    /// Stops accepting verbs. Objects stay alive until `release_resources`.
    fn device_stop(&self);

    /// Destroys every remaining QP, SRQ and CQ.
    fn release_resources(&self);

    /// Creates a CQ holding at least `entries` completions.
    ///
    /// # Errors
    ///
    /// Fails if `entries` exceeds the device limit, no CQ number or doorbell
    /// record is free, ring memory cannot be mapped, or SW2HW_CQ fails.
    fn create_cq(&self, entries: u32, handler: Option<CompletionHandler>) -> Result<CqHandle>;

    /// Consumes up to `max_entries` completions.
    ///
    /// # Errors
    ///
    /// Fails if the handle is stale.
    fn poll_cq(&self, cq: CqHandle, max_entries: usize) -> Result<Polled>;

    /// Arms the CQ for a completion event.
    ///
    /// # Errors
    ///
    /// Fails if the handle is stale.
    fn request_notification(&self, cq: CqHandle, kind: NotifyKind) -> Result<()>;

    /// Reports the capacity of a CQ.
    ///
    /// # Errors
    ///
    /// Fails if the handle is stale.
    fn query_cq(&self, cq: CqHandle) -> Result<CqAttr>;

    /// Destroys a CQ no QP completes to.
    ///
    /// # Errors
    ///
    /// Fails with `Busy` while QPs are attached.
    fn destroy_cq(&self, cq: CqHandle) -> Result<()>;

    /// Creates a shared receive queue.
    ///
    /// # Errors
    ///
    /// Fails on out of range sizes, exhaustion, or a failed SW2HW_SRQ.
    fn create_srq(&self, attr: &SrqInitAttr) -> Result<SrqHandle>;

    /// Posts receives to an SRQ.
    ///
    /// # Errors
    ///
    /// Reports the index of the first request that was not posted.
    fn post_srq_recv(&self, srq: SrqHandle, wrs: &[RecvWr]) -> std::result::Result<(), PostError>;

    /// Reports the sizes and fill level of an SRQ.
    ///
    /// # Errors
    ///
    /// Fails if the handle is stale.
    fn query_srq(&self, srq: SrqHandle) -> Result<SrqAttr>;

    /// Destroys an SRQ no QP receives from.
    ///
    /// # Errors
    ///
    /// Fails with `Busy` while QPs are attached.
    fn destroy_srq(&self, srq: SrqHandle) -> Result<()>;

    /// Creates an RC, UC or UD queue pair in RESET and returns the granted
    /// capabilities.
    ///
    /// # Errors
    ///
    /// Fails on stale CQ or SRQ handles, out of range capabilities or
    /// exhaustion.
    fn create_qp(&self, attr: QpInitAttr) -> Result<(QpHandle, QpCap)>;

    /// Creates QP0 or QP1 of `port`.
    ///
    /// # Errors
    ///
    /// Fails if the port is out of range or the special QP already exists.
    fn create_special_qp(
        &self,
        kind: SpecialQpKind,
        port: u8,
        attr: QpInitAttr,
    ) -> Result<(QpHandle, QpCap)>;

    /// Moves a QP through the state machine.
    ///
    /// # Errors
    ///
    /// Fails on illegal transitions, wrong attribute masks, out of range
    /// attributes or a failed MODIFY_QP. The QP is unchanged on failure.
    fn modify_qp(&self, qp: QpHandle, attr: &QpAttr, mask: QpAttrMask) -> Result<()>;

    /// Reads back the QP attributes.
    ///
    /// # Errors
    ///
    /// Fails if the handle is stale or QUERY_QP fails.
    fn query_qp(&self, qp: QpHandle) -> Result<QpAttr>;

    /// Destroys a QP, moving it to RESET first.
    ///
    /// # Errors
    ///
    /// Fails if the handle is stale.
    fn destroy_qp(&self, qp: QpHandle) -> Result<()>;

    /// Posts send requests.
    ///
    /// # Errors
    ///
    /// Reports the index of the first request that was not posted.
    fn post_send(&self, qp: QpHandle, wrs: &[SendWr]) -> std::result::Result<(), PostError>;

    /// Posts receive requests.
    ///
    /// # Errors
    ///
    /// Reports the index of the first request that was not posted.
    fn post_recv(&self, qp: QpHandle, wrs: &[RecvWr]) -> std::result::Result<(), PostError>;
}
