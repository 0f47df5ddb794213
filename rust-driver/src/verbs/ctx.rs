use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use log::{debug, info, warn};

use crate::{
    config::{special_qp_base, HcaConfig},
    cq::{CompletionQueue, CqContextParams, CqDoorbell},
    device::{check_status, Firmware, SpecialQpKind, UarAdaptor},
    doorbell::{DbRecordType, DoorbellMode, DoorbellTable},
    error::{HcaError, PostError, Result},
    qp::{QpAttr, QpAttrMask, QpCap, QpCreate, QpEnv, QpEvent, QpInitAttr, QueuePair, Transport},
    srq::{self, Srq},
    table::ObjectTable,
    types::{
        CompletionHandler, CqAttr, CqHandle, NotifyKind, Polled, QpHandle, RecvWr, SendWr,
        SrqAttr, SrqHandle, SrqInitAttr,
    },
};

use super::VerbsOps;

/// Protection domain of driver owned contexts
const DRIVER_PD: u32 = 0;

/// One driver instance: object tables plus the firmware and doorbell page
/// they are programmed through.
pub struct HcaContext {
    config: HcaConfig,
    fw: Arc<dyn Firmware>,
    uar: Arc<dyn UarAdaptor>,
    qps: ObjectTable<QueuePair>,
    cqs: ObjectTable<CompletionQueue>,
    srqs: ObjectTable<Srq>,
    /// Present in memory-free mode
    db_table: Option<DoorbellTable>,
    started: AtomicBool,
}

impl std::fmt::Debug for HcaContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HcaContext")
            .field("config", &self.config)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl HcaContext {
    /// Creates the object tables described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the doorbell
    /// record page cannot be mapped.
    pub fn new(
        config: HcaConfig,
        fw: Arc<dyn Firmware>,
        uar: Arc<dyn UarAdaptor>,
    ) -> Result<Self> {
        config.validate()?;
        let limits = &config.limits;
        let db_table = if config.is_memfree() {
            Some(DoorbellTable::new(limits.num_db_records)?)
        } else {
            None
        };
        let qps = ObjectTable::new(
            limits.num_qps,
            special_qp_base(limits.reserved_qps) + 4,
        );
        let cqs = ObjectTable::new(limits.num_cqs, limits.reserved_cqs);
        let srqs = ObjectTable::new(limits.num_srqs, limits.reserved_srqs);
        Ok(Self {
            config,
            fw,
            uar,
            qps,
            cqs,
            srqs,
            db_table,
            started: AtomicBool::new(false),
        })
    }

    /// Configuration the context was created with.
    #[must_use]
    pub fn config(&self) -> &HcaConfig {
        &self.config
    }

    fn ensure_started(&self) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(HcaError::DeviceStopped)
        }
    }

    fn env(&self) -> QpEnv<'_> {
        QpEnv {
            fw: self.fw.as_ref(),
            config: &self.config,
            cqs: &self.cqs,
            srqs: &self.srqs,
        }
    }

    fn qp(&self, handle: QpHandle) -> Result<Arc<QueuePair>> {
        self.qps
            .get(handle.number())
            .ok_or(HcaError::InvalidHandle(handle.number()))
    }

    fn cq(&self, handle: CqHandle) -> Result<Arc<CompletionQueue>> {
        self.cqs
            .get(handle.number())
            .ok_or(HcaError::InvalidHandle(handle.number()))
    }

    fn srq(&self, handle: SrqHandle) -> Result<Arc<Srq>> {
        self.srqs
            .get(handle.number())
            .ok_or(HcaError::InvalidHandle(handle.number()))
    }

    fn alloc_record(&self, ty: DbRecordType, qn: u32) -> Result<DoorbellMode> {
        match self.db_table {
            Some(ref table) => Ok(DoorbellMode::MemoryFree(table.alloc(ty, qn)?)),
            None => Ok(DoorbellMode::Legacy),
        }
    }

    /// Dispatches a completion event from the event queue.
    pub fn completion_event(&self, cqn: u32) {
        match self.cqs.get(cqn) {
            Some(cq) => cq.completion_event(),
            None => warn!("completion event for bogus CQ {cqn:#08x}"),
        }
    }

    /// Dispatches an asynchronous QP event from the event queue.
    pub fn qp_event(&self, qpn: u32, event: QpEvent) {
        match self.qps.get(qpn) {
            Some(qp) => qp.handle_event(event),
            None => warn!("{event:?} for bogus QP {qpn:#08x}"),
        }
    }

    #[cfg(test)]
    pub(crate) fn cq_for_test(&self, handle: CqHandle) -> Option<Arc<CompletionQueue>> {
        self.cqs.get(handle.number())
    }

    #[cfg(test)]
    pub(crate) fn qp_for_test(&self, handle: QpHandle) -> Option<Arc<QueuePair>> {
        self.qps.get(handle.number())
    }

    #[cfg(test)]
    pub(crate) fn db_table_for_test(&self) -> Option<&DoorbellTable> {
        self.db_table.as_ref()
    }

    /// Attaches a new QP to its CQs and SRQ and publishes it.
    fn create_qp_inner(
        &self,
        attr: QpInitAttr,
        special: Option<(SpecialQpKind, u8)>,
    ) -> Result<(QpHandle, QpCap)> {
        self.ensure_started()?;
        let send_cq = self.cq(attr.send_cq)?;
        let recv_cq = self.cq(attr.recv_cq)?;
        let srq = attr.srq.map(|h| self.srq(h)).transpose()?;

        Self::attach(&send_cq, &recv_cq, srq.as_deref())?;
        let created = self.publish_qp(attr, special);
        if created.is_err() {
            send_cq.unbind();
            recv_cq.unbind();
            if let Some(ref srq) = srq {
                srq.unbind();
            }
        }
        created
    }

    /// Binds a new QP to its CQs and SRQ, failing if any of them is being
    /// destroyed.
    fn attach(
        send_cq: &CompletionQueue,
        recv_cq: &CompletionQueue,
        srq: Option<&Srq>,
    ) -> Result<()> {
        if !send_cq.bind() {
            return Err(HcaError::InvalidHandle(send_cq.number()));
        }
        if !recv_cq.bind() {
            send_cq.unbind();
            return Err(HcaError::InvalidHandle(recv_cq.number()));
        }
        if let Some(srq) = srq {
            if !srq.bind() {
                send_cq.unbind();
                recv_cq.unbind();
                return Err(HcaError::InvalidHandle(srq.number()));
            }
        }
        Ok(())
    }

    /// Allocates the QP number, builds the QP and publishes it.
    fn publish_qp(
        &self,
        attr: QpInitAttr,
        special: Option<(SpecialQpKind, u8)>,
    ) -> Result<(QpHandle, QpCap)> {
        let qpn = match special {
            Some((kind, port)) => {
                if !(1..=self.config.limits.num_ports).contains(&port) {
                    return Err(HcaError::InvalidParameter(format!(
                        "port {port} outside of 1..={}",
                        self.config.limits.num_ports
                    )));
                }
                special_qp_base(self.config.limits.reserved_qps)
                    + kind.offset()
                    + u32::from(port)
                    - 1
            }
            None => self.qps.reserve_number().ok_or_else(|| {
                HcaError::InsufficientResources("no QP numbers available".into())
            })?,
        };
        let created = QueuePair::new(QpCreate {
            qpn,
            init: attr,
            special,
            config: &self.config,
            db_table: self.db_table.as_ref(),
            uar: Arc::clone(&self.uar),
        });
        let qp = match created {
            Ok(qp) => Arc::new(qp),
            Err(err) => {
                self.qps.release_number(qpn);
                return Err(err);
            }
        };
        let cap = qp.cap();
        if special.is_some() {
            if !self.qps.insert_reserved(qpn, qp) {
                return Err(HcaError::Busy(format!("special QP {qpn:#x} exists")));
            }
        } else {
            self.qps.insert(qpn, qp);
        }
        Ok((QpHandle(qpn), cap))
    }
}

impl VerbsOps for HcaContext {
    fn device_start(&self) -> Result<()> {
        let base = special_qp_base(self.config.limits.reserved_qps);
        for kind in [SpecialQpKind::Qp0, SpecialQpKind::Qp1] {
            check_status(
                "CONF_SPECIAL_QP",
                self.fw.conf_special_qp(kind, base + kind.offset()),
            )?;
        }
        self.started.store(true, Ordering::Release);
        info!("device started, special QPs at {base:#x}");
        Ok(())
    }

    fn device_stop(&self) {
        self.started.store(false, Ordering::Release);
        info!("device stopped");
    }

    fn release_resources(&self) {
        let env = self.env();
        for qpn in self.qps.numbers() {
            if let Some(qp) = self.qps.remove(qpn) {
                qp.shutdown(&env);
                self.qps.release_number(qpn);
            }
        }
        for srqn in self.srqs.numbers() {
            if self.srqs.remove(srqn).is_some() {
                let _ignore = check_status("HW2SW_SRQ", self.fw.hw2sw_srq(srqn));
                self.srqs.release_number(srqn);
            }
        }
        for cqn in self.cqs.numbers() {
            if self.cqs.remove(cqn).is_some() {
                let _ignore = check_status("HW2SW_CQ", self.fw.hw2sw_cq(cqn));
                self.cqs.release_number(cqn);
            }
        }
        debug!("all objects released");
    }

    fn create_cq(&self, entries: u32, handler: Option<CompletionHandler>) -> Result<CqHandle> {
        self.ensure_started()?;
        if entries == 0 || entries > self.config.limits.max_cqes {
            return Err(HcaError::InvalidParameter(format!(
                "CQ of {entries} entries outside of 1..={}",
                self.config.limits.max_cqes
            )));
        }
        let cqn = self
            .cqs
            .reserve_number()
            .ok_or_else(|| HcaError::InsufficientResources("no CQ numbers available".into()))?;
        let created = (|| -> Result<CompletionQueue> {
            let db = match self.db_table {
                Some(ref table) => CqDoorbell::MemoryFree {
                    set_ci: table.alloc(DbRecordType::CqSetCi, cqn)?,
                    arm: table.alloc(DbRecordType::CqArm, cqn)?,
                },
                None => CqDoorbell::Legacy,
            };
            let nent = CompletionQueue::entries_for(entries);
            let cq = CompletionQueue::new(cqn, nent, db, Arc::clone(&self.uar), handler)?;
            let context = cq.context(&CqContextParams {
                uar_index: self.config.uar_index,
                async_eqn: self.config.async_eqn,
                comp_eqn: self.config.comp_eqn,
                pd: DRIVER_PD,
                lkey: self.config.reserved_lkey,
            });
            check_status("SW2HW_CQ", self.fw.sw2hw_cq(cqn, &context))?;
            Ok(cq)
        })();
        match created {
            Ok(cq) => {
                debug!("CQ {cqn:#x} created with {} entries", cq.capacity());
                self.cqs.insert(cqn, Arc::new(cq));
                Ok(CqHandle(cqn))
            }
            Err(err) => {
                self.cqs.release_number(cqn);
                Err(err)
            }
        }
    }

    fn poll_cq(&self, cq: CqHandle, max_entries: usize) -> Result<Polled> {
        self.ensure_started()?;
        Ok(self.cq(cq)?.poll(max_entries, &self.qps, &self.srqs))
    }

    fn request_notification(&self, cq: CqHandle, kind: NotifyKind) -> Result<()> {
        self.ensure_started()?;
        self.cq(cq)?.arm(kind);
        Ok(())
    }

    fn query_cq(&self, cq: CqHandle) -> Result<CqAttr> {
        self.ensure_started()?;
        Ok(CqAttr {
            cqe: self.cq(cq)?.capacity(),
        })
    }

    fn destroy_cq(&self, cq: CqHandle) -> Result<()> {
        self.ensure_started()?;
        let cqn = cq.number();
        match self.cq(cq)?.close() {
            Ok(()) => {}
            Err(Some(bound)) => {
                return Err(HcaError::Busy(format!("CQ {cqn:#x} has {bound} QPs attached")));
            }
            Err(None) => return Err(HcaError::InvalidHandle(cqn)),
        }
        let _ignore = check_status("HW2SW_CQ", self.fw.hw2sw_cq(cqn));
        if self.cqs.remove(cqn).is_none() {
            return Err(HcaError::InvalidHandle(cqn));
        }
        self.cqs.release_number(cqn);
        debug!("CQ {cqn:#x} destroyed");
        Ok(())
    }

    fn create_srq(&self, attr: &SrqInitAttr) -> Result<SrqHandle> {
        self.ensure_started()?;
        let geo = srq::geometry(attr, &self.config.limits, self.config.is_memfree())?;
        let srqn = self
            .srqs
            .reserve_number()
            .ok_or_else(|| HcaError::InsufficientResources("no SRQ numbers available".into()))?;
        let created = (|| -> Result<Srq> {
            let db = self.alloc_record(DbRecordType::Srq, srqn)?;
            let srq = Srq::new(srqn, attr, geo, db, Arc::clone(&self.uar))?;
            let context = srq.context(self.config.uar_index, self.config.reserved_lkey);
            check_status("SW2HW_SRQ", self.fw.sw2hw_srq(srqn, &context))?;
            Ok(srq)
        })();
        match created {
            Ok(srq) => {
                debug!("SRQ {srqn:#x} created for {} receives", attr.max_wr);
                self.srqs.insert(srqn, Arc::new(srq));
                Ok(SrqHandle(srqn))
            }
            Err(err) => {
                self.srqs.release_number(srqn);
                Err(err)
            }
        }
    }

    fn post_srq_recv(&self, srq: SrqHandle, wrs: &[RecvWr]) -> std::result::Result<(), PostError> {
        self.ensure_started()
            .and_then(|()| self.srq(srq))
            .map_err(|err| PostError::new(0, err))?
            .post_recv(wrs)
    }

    fn query_srq(&self, srq: SrqHandle) -> Result<SrqAttr> {
        self.ensure_started()?;
        Ok(self.srq(srq)?.attr())
    }

    fn destroy_srq(&self, srq: SrqHandle) -> Result<()> {
        self.ensure_started()?;
        let srqn = srq.number();
        match self.srq(srq)?.close() {
            Ok(()) => {}
            Err(Some(bound)) => {
                return Err(HcaError::Busy(format!(
                    "SRQ {srqn:#x} has {bound} QPs attached"
                )));
            }
            Err(None) => return Err(HcaError::InvalidHandle(srqn)),
        }
        let _ignore = check_status("HW2SW_SRQ", self.fw.hw2sw_srq(srqn));
        if self.srqs.remove(srqn).is_none() {
            return Err(HcaError::InvalidHandle(srqn));
        }
        self.srqs.release_number(srqn);
        debug!("SRQ {srqn:#x} destroyed");
        Ok(())
    }

    fn create_qp(&self, attr: QpInitAttr) -> Result<(QpHandle, QpCap)> {
        if attr.transport == Transport::Mlx {
            return Err(HcaError::InvalidParameter(
                "MLX QPs are created with create_special_qp".into(),
            ));
        }
        self.create_qp_inner(attr, None)
    }

    fn create_special_qp(
        &self,
        kind: SpecialQpKind,
        port: u8,
        attr: QpInitAttr,
    ) -> Result<(QpHandle, QpCap)> {
        self.create_qp_inner(attr, Some((kind, port)))
    }

    fn modify_qp(&self, qp: QpHandle, attr: &QpAttr, mask: QpAttrMask) -> Result<()> {
        self.ensure_started()?;
        self.qp(qp)?.modify(attr, mask, &self.env())
    }

    fn query_qp(&self, qp: QpHandle) -> Result<QpAttr> {
        self.ensure_started()?;
        self.qp(qp)?.query(&self.env())
    }

    fn destroy_qp(&self, qp: QpHandle) -> Result<()> {
        self.ensure_started()?;
        let qpn = qp.number();
        let target = self.qp(qp)?;
        let (send_cqn, recv_cqn) = (target.send_cqn(), target.recv_cqn());
        let send_cq = self.cqs.get(send_cqn);
        let recv_cq = self.cqs.get(recv_cqn);
        let removed = {
            // CQ locks are taken in CQ number order
            let (first, second) = if send_cqn <= recv_cqn {
                (&send_cq, &recv_cq)
            } else {
                (&recv_cq, &send_cq)
            };
            let _first = first.as_ref().map(|cq| cq.lock());
            let _second = (send_cqn != recv_cqn)
                .then(|| second.as_ref().map(|cq| cq.lock()))
                .flatten();
            self.qps.remove(qpn)
        };
        if removed.is_none() {
            return Err(HcaError::InvalidHandle(qpn));
        }
        target.shutdown(&self.env());

        if let Some(cq) = send_cq {
            cq.unbind();
        }
        if let Some(cq) = recv_cq {
            cq.unbind();
        }
        if let Some(srq) = target.srqn().and_then(|n| self.srqs.get(n)) {
            srq.unbind();
        }
        self.qps.release_number(qpn);
        debug!(
            "QP {qpn:#x} destroyed{}",
            if target.special_kind().is_some() { " (special)" } else { "" }
        );
        Ok(())
    }

    fn post_send(&self, qp: QpHandle, wrs: &[SendWr]) -> std::result::Result<(), PostError> {
        self.ensure_started()
            .and_then(|()| self.qp(qp))
            .map_err(|err| PostError::new(0, err))?
            .post_send(wrs, &self.cqs)
    }

    fn post_recv(&self, qp: QpHandle, wrs: &[RecvWr]) -> std::result::Result<(), PostError> {
        self.ensure_started()
            .and_then(|()| self.qp(qp))
            .map_err(|err| PostError::new(0, err))?
            .post_recv(wrs, &self.cqs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{DeviceLimits, DoorbellKind},
        device::{
            emulated::{EmulatedFirmware, FirmwareCall, RecordingUar},
            CommandStatus,
        },
        error::Status,
        test_utils::{cap, init_attr, TestHca},
    };

    #[test]
    fn start_configures_special_qps() {
        let fw = Arc::new(EmulatedFirmware::new());
        let ctx = HcaContext::new(
            HcaConfig::default(),
            fw.clone(),
            Arc::new(RecordingUar::new()),
        )
        .unwrap();
        assert!(matches!(
            ctx.create_cq(4, None),
            Err(HcaError::DeviceStopped)
        ));
        ctx.device_start().unwrap();
        assert_eq!(
            fw.calls(),
            vec![
                FirmwareCall::ConfSpecialQp {
                    kind: SpecialQpKind::Qp0,
                    base_qpn: 8
                },
                FirmwareCall::ConfSpecialQp {
                    kind: SpecialQpKind::Qp1,
                    base_qpn: 10
                },
            ]
        );
    }

    #[test]
    fn invalid_config_is_refused() {
        let config = HcaConfig {
            limits: DeviceLimits {
                num_qps: 1000,
                ..DeviceLimits::default()
            },
            ..HcaConfig::default()
        };
        let err = HcaContext::new(
            config,
            Arc::new(EmulatedFirmware::new()),
            Arc::new(RecordingUar::new()),
        )
        .unwrap_err();
        assert_eq!(err.status(), Status::InvalidParameter);
    }

    #[test]
    fn cq_size_is_bounded_and_reported() {
        let hca = TestHca::new(DoorbellKind::Legacy);
        assert!(hca.ctx.create_cq(0, None).is_err());
        let max = hca.ctx.config().limits.max_cqes;
        assert!(hca.ctx.create_cq(max + 1, None).is_err());

        let cq = hca.create_cq(100);
        assert_eq!(hca.ctx.query_cq(cq).unwrap().cqe, 127);
    }

    #[test]
    fn failed_sw2hw_returns_the_number() {
        let hca = TestHca::new(DoorbellKind::MemoryFree);
        hca.fw.fail_next("SW2HW_CQ", CommandStatus::BAD_RESOURCE);
        let err = hca.ctx.create_cq(8, None).unwrap_err();
        assert!(matches!(err, HcaError::Command { cmd: "SW2HW_CQ", .. }));
        // the doorbell records went back with the number
        assert_eq!(hca.ctx.db_table_for_test().unwrap().in_use(), 0);

        let cq = hca.create_cq(8);
        assert_eq!(hca.ctx.db_table_for_test().unwrap().in_use(), 2);
        assert!(hca.ctx.query_cq(cq).is_ok());
    }

    #[test]
    fn stale_handles_are_rejected() {
        let hca = TestHca::new(DoorbellKind::Legacy);
        let cq = hca.create_cq(8);
        hca.ctx.destroy_cq(cq).unwrap();
        let err = hca.ctx.query_cq(cq).unwrap_err();
        assert_eq!(err.status(), Status::InvalidHandle);
        // the slot is reused under a new generation
        let again = hca.create_cq(8);
        assert_ne!(again, cq);
        assert!(hca.ctx.poll_cq(cq, 1).is_err());
    }

    #[test]
    fn create_qp_validates_its_inputs() {
        let hca = TestHca::new(DoorbellKind::Legacy);
        let cq = hca.create_cq(8);
        let err = hca
            .ctx
            .create_qp(init_attr(Transport::Mlx, cq, cap(4, 1)))
            .unwrap_err();
        assert_eq!(err.status(), Status::InvalidParameter);

        let err = hca
            .ctx
            .create_special_qp(SpecialQpKind::Qp1, 3, init_attr(Transport::Ud, cq, cap(4, 1)))
            .unwrap_err();
        assert_eq!(err.status(), Status::InvalidParameter);

        let bogus = CqHandle(cq.number() ^ 0x0100_0000);
        let err = hca
            .ctx
            .create_qp(init_attr(Transport::Rc, bogus, cap(4, 1)))
            .unwrap_err();
        assert_eq!(err.status(), Status::InvalidHandle);
        assert_eq!(hca.cq(cq).bound(), 0);
    }

    #[test]
    fn failed_create_releases_its_attachments() {
        let hca = TestHca::new(DoorbellKind::Legacy);
        let cq = hca.create_cq(8);
        let attr = || init_attr(Transport::Ud, cq, cap(4, 1));
        assert!(hca.ctx.create_special_qp(SpecialQpKind::Qp1, 3, attr()).is_err());
        assert_eq!(hca.cq(cq).bound(), 0);

        let (qp1, _) = hca
            .ctx
            .create_special_qp(SpecialQpKind::Qp1, 1, attr())
            .unwrap();
        let err = hca
            .ctx
            .create_special_qp(SpecialQpKind::Qp1, 1, attr())
            .unwrap_err();
        assert_eq!(err.status(), Status::ResourceBusy);
        // one QP, bound as send and receive CQ
        assert_eq!(hca.cq(cq).bound(), 2);

        hca.ctx.destroy_qp(qp1).unwrap();
        hca.ctx.destroy_cq(cq).unwrap();
    }

    #[test]
    fn destroyed_cq_refuses_late_attach() {
        let hca = TestHca::new(DoorbellKind::Legacy);
        let cq = hca.create_cq(8);
        // resolved before destroy, as a concurrent create_qp would have
        let held = hca.cq(cq);
        hca.ctx.destroy_cq(cq).unwrap();
        let err = HcaContext::attach(&held, &held, None).unwrap_err();
        assert_eq!(err.status(), Status::InvalidHandle);
        assert_eq!(held.bound(), 0);
    }

    #[test]
    fn create_qp_races_destroy_cq() {
        let hca = TestHca::new(DoorbellKind::Legacy);
        for _ in 0..64 {
            let cq = hca.create_cq(8);
            let (created, destroyed) = std::thread::scope(|s| {
                let create = s.spawn(|| {
                    hca.ctx
                        .create_qp(init_attr(Transport::Rc, cq, cap(4, 1)))
                });
                let destroy = s.spawn(|| hca.ctx.destroy_cq(cq));
                (create.join().unwrap(), destroy.join().unwrap())
            });
            match (created, destroyed) {
                (Ok((qp, _)), Err(err)) => {
                    assert_eq!(err.status(), Status::ResourceBusy);
                    hca.ctx.destroy_qp(qp).unwrap();
                    hca.ctx.destroy_cq(cq).unwrap();
                }
                (Err(err), Ok(())) => assert_eq!(err.status(), Status::InvalidHandle),
                (created, destroyed) => {
                    panic!("create {created:?} and destroy {destroyed:?} both decided")
                }
            }
        }
    }

    #[test]
    fn completion_event_reaches_handler() {
        let hca = TestHca::new(DoorbellKind::Legacy);
        let hits = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let seen = Arc::clone(&hits);
        let cq = hca
            .ctx
            .create_cq(
                8,
                Some(Box::new(move |_: CqHandle| {
                    seen.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        hca.ctx
            .request_notification(cq, NotifyKind::NextCompletion)
            .unwrap();
        hca.ctx.completion_event(cq.number());
        hca.ctx.completion_event(0xdead);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_resources_tears_everything_down() {
        let hca = TestHca::new(DoorbellKind::MemoryFree);
        let cq = hca.create_cq(8);
        let qp = hca.create_qp(Transport::Rc, cq, cap(4, 1));
        hca.to_rts(qp, Transport::Rc);
        hca.ctx
            .create_srq(&SrqInitAttr {
                pd: 1,
                max_wr: 4,
                max_sge: 1,
            })
            .unwrap();

        hca.fw.clear_calls();
        hca.ctx.release_resources();
        let names: Vec<&str> = hca.fw.calls().iter().map(FirmwareCall::name).collect();
        assert_eq!(names, vec!["2RST_QPEE", "HW2SW_SRQ", "HW2SW_CQ"]);
        assert_eq!(hca.ctx.db_table_for_test().unwrap().in_use(), 0);
        assert!(hca.ctx.query_qp(qp).is_err());
    }
}
