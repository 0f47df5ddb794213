//! Error types for the HCA transport core.

use std::io;

use thiserror::Error;

use crate::{
    config::ConfigError,
    device::CommandStatus,
    qp::{QpAttrMask, QpState, Transport},
};

/// Result type for HCA operations.
pub type Result<T> = std::result::Result<T, HcaError>;

/// Status codes reported to verbs consumers.
///
/// Every [`HcaError`] maps onto exactly one of these codes, see [`HcaError::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Status {
    /// The operation completed
    Success,
    /// A parameter was out of range or malformed
    InvalidParameter,
    /// The object is in a state that does not permit the operation
    InvalidState,
    /// The attribute mask does not match the requested transition
    InvalidSetting,
    /// A hardware resource (ring slot, table entry, doorbell record) ran out
    InsufficientResources,
    /// Host memory for rings could not be mapped
    InsufficientMemory,
    /// A handle did not resolve to a live object
    InvalidHandle,
    /// The object is still referenced by other objects
    ResourceBusy,
    /// The work queue has no free slot
    Overflow,
    /// The shared receive queue has no free slot
    Full,
    /// The device is not started
    NotDone,
    /// Firmware or transport failure
    Error,
}

/// Errors that can occur in HCA operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HcaError {
    /// The legality table has no entry for the requested transition
    #[error("invalid transition {from:?} -> {to:?} on {transport:?} QP")]
    InvalidTransition {
        /// Current state
        from: QpState,
        /// Requested state
        to: QpState,
        /// Transport of the QP
        transport: Transport,
    },

    /// Required attributes were not supplied
    #[error("missing required attributes {0:?}")]
    MissingAttributes(QpAttrMask),

    /// Attributes outside of the required and optional sets were supplied
    #[error("unexpected attributes {0:?}")]
    ExtraAttributes(QpAttrMask),

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidParameter(String),

    /// The QP state does not allow the operation
    #[error("operation not allowed in QP state {0:?}")]
    InvalidQpState(QpState),

    /// The handle does not name a live object
    #[error("invalid handle {0:#08x}")]
    InvalidHandle(u32),

    /// Resource exhausted
    #[error("Resource exhausted: {0}")]
    InsufficientResources(String),

    /// The work queue is full
    #[error("work queue overflow")]
    Overflow,

    /// The request carries more scatter/gather entries than a slot holds
    #[error("too many scatter/gather entries: {requested} > {max}")]
    TooManySge {
        /// Entries in the request
        requested: usize,
        /// Entries a slot holds
        max: usize,
    },

    /// Inline payload is larger than the QP allows
    #[error("inline data too long: {len} > {max}")]
    InlineTooLong {
        /// Payload length
        len: usize,
        /// Maximum inline length of the QP
        max: usize,
    },

    /// The shared receive queue has no free slot
    #[error("SRQ {0:#08x} full")]
    SrqFull(u32),

    /// The object is still in use
    #[error("Resource busy: {0}")]
    Busy(String),

    /// A firmware command returned a non-zero status
    #[error("{cmd} failed with status {status}")]
    Command {
        /// Command name
        cmd: &'static str,
        /// Status byte returned by firmware
        status: CommandStatus,
    },

    /// Verbs are called outside of the start/stop window
    #[error("device not started")]
    DeviceStopped,

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl HcaError {
    /// Maps the error onto the verbs status enumeration.
    #[inline]
    #[must_use]
    pub fn status(&self) -> Status {
        match *self {
            HcaError::InvalidTransition { .. } | HcaError::InvalidQpState(_) => {
                Status::InvalidState
            }
            HcaError::MissingAttributes(_) | HcaError::ExtraAttributes(_) => Status::InvalidSetting,
            HcaError::InvalidParameter(_)
            | HcaError::TooManySge { .. }
            | HcaError::InlineTooLong { .. }
            | HcaError::Config(_) => Status::InvalidParameter,
            HcaError::InvalidHandle(_) => Status::InvalidHandle,
            HcaError::InsufficientResources(_) => Status::InsufficientResources,
            HcaError::Overflow => Status::Overflow,
            HcaError::SrqFull(_) => Status::Full,
            HcaError::Busy(_) => Status::ResourceBusy,
            HcaError::DeviceStopped => Status::NotDone,
            HcaError::IoError(ref e) if e.kind() == io::ErrorKind::OutOfMemory => {
                Status::InsufficientMemory
            }
            HcaError::Command { .. } | HcaError::IoError(_) => Status::Error,
        }
    }
}

/// Error returned by a multi-request post.
///
/// Requests before `index` were committed to the ring and complete on their
/// own; the request at `index` and everything after it were not posted.
#[derive(Debug, Error)]
#[error("work request {index} rejected: {source}")]
pub struct PostError {
    /// Position of the first rejected request in the caller's list
    pub index: usize,
    /// Why the request was rejected
    #[source]
    pub source: HcaError,
}

impl PostError {
    pub(crate) fn new(index: usize, source: HcaError) -> Self {
        Self { index, source }
    }

    /// Status code of the underlying error.
    #[inline]
    #[must_use]
    pub fn status(&self) -> Status {
        self.source.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_covers_taxonomy() {
        assert_eq!(HcaError::Overflow.status(), Status::Overflow);
        assert_eq!(HcaError::SrqFull(3).status(), Status::Full);
        assert_eq!(
            HcaError::MissingAttributes(QpAttrMask::DEST_QPN).status(),
            Status::InvalidSetting
        );
        assert_eq!(
            HcaError::Command {
                cmd: "MODIFY_QP",
                status: CommandStatus::BAD_PARAM
            }
            .status(),
            Status::Error
        );
        let oom = HcaError::from(io::Error::from(io::ErrorKind::OutOfMemory));
        assert_eq!(oom.status(), Status::InsufficientMemory);
    }

    #[test]
    fn post_error_reports_index() {
        let err = PostError::new(3, HcaError::Overflow);
        assert_eq!(err.index, 3);
        assert_eq!(err.status(), Status::Overflow);
        assert_eq!(
            err.to_string(),
            "work request 3 rejected: work queue overflow"
        );
    }
}
