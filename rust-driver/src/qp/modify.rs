use std::sync::atomic::Ordering;

use log::{debug, warn};

use crate::{
    config::HcaConfig,
    device::{check_status, SpecialQpKind},
    error::{HcaError, Result},
};

use super::{
    context::{self, Mailbox},
    state, PathMtu, QpAttr, QpAttrMask as M, QpEnv, QpState, QueuePair, Transition, Transport,
};

impl QueuePair {
    /// Moves the QP to `attr.qp_state`, or applies attributes in place when
    /// `STATE` is absent.
    ///
    /// Nothing is changed unless firmware accepts the transition.
    pub(crate) fn modify(&self, attr: &QpAttr, mask: M, env: &QpEnv<'_>) -> Result<()> {
        let mut cached = self.cached.lock();
        let cur = if mask.contains(M::CUR_STATE) {
            attr.cur_qp_state
        } else {
            self.state()
        };
        let new = if mask.contains(M::STATE) {
            attr.qp_state
        } else {
            cur
        };
        if cur == QpState::Reset && new == QpState::Reset {
            return Ok(());
        }

        let invalid = || HcaError::InvalidTransition {
            from: cur,
            to: new,
            transport: self.transport,
        };
        let rule = state::rule_for(cur, new, self.transport).ok_or_else(invalid)?;
        let missing = rule.required.difference(mask);
        if !missing.is_empty() {
            debug!("QP {:#x} {cur:?} -> {new:?}: missing {missing:?}", self.qpn);
            return Err(HcaError::MissingAttributes(missing));
        }
        let extra = mask.difference(rule.required | rule.optional | M::STATE);
        if !extra.is_empty() {
            debug!("QP {:#x} {cur:?} -> {new:?}: unexpected {extra:?}", self.qpn);
            return Err(HcaError::ExtraAttributes(extra));
        }
        self.check_bounds(attr, mask, env.config)?;

        let transition = Transition::between(cur, new).ok_or_else(invalid)?;
        let mailbox = context::build(self, &cached, cur, new, attr, mask, env.config)?;
        let sqd_event = cur == QpState::Rts
            && new == QpState::Sqd
            && mask.contains(M::EN_SQD_ASYNC_NOTIFY)
            && attr.en_sqd_async_notify;
        check_status(
            transition.command_name(),
            env.fw
                .modify_qp(transition, self.qpn, sqd_event, mailbox.as_bytes()),
        )?;
        debug!("QP {:#x}: {cur:?} -> {new:?}", self.qpn);

        self.set_state(new);
        let draining = match new {
            QpState::Sqd => cur == QpState::Rts || self.is_draining(),
            _ => false,
        };
        self.draining.store(draining, Ordering::Release);
        if mask.contains(M::ACCESS_FLAGS) {
            cached.access = attr.qp_access_flags;
        }
        if mask.contains(M::MAX_DEST_RD_ATOMIC) {
            cached.resp_depth = attr.max_dest_rd_atomic;
        }
        if mask.contains(M::PORT) {
            cached.port = attr.port_num;
        }
        if mask.contains(M::ALT_PATH) {
            cached.alt_port = attr.alt_port_num;
        }

        if let Some(ref sp) = self.special {
            sp.store_attrs(attr, mask);
            if sp.kind == SpecialQpKind::Qp0 {
                if cur != QpState::Rtr && new == QpState::Rtr {
                    // a failed INIT_IB leaves the port down but the QP moved
                    let _ignore = check_status("INIT_IB", env.fw.init_ib(sp.port));
                }
                let was_active = !matches!(cur, QpState::Reset | QpState::Err);
                if was_active && matches!(new, QpState::Reset | QpState::Err) {
                    let _ignore = check_status("CLOSE_IB", env.fw.close_ib(sp.port));
                }
            }
        }

        if new == QpState::Reset {
            self.clean_cqs(env.cqs, env.srqs);
            self.reset_rings();
        }
        Ok(())
    }

    fn check_bounds(&self, attr: &QpAttr, mask: M, config: &HcaConfig) -> Result<()> {
        let limits = &config.limits;
        let port_ok = |port: u8| (1..=limits.num_ports).contains(&port);
        if mask.contains(M::PKEY_INDEX) && attr.pkey_index >= limits.pkey_table_len {
            return Err(HcaError::InvalidParameter(format!(
                "P_Key index {} outside of table of {}",
                attr.pkey_index, limits.pkey_table_len
            )));
        }
        if mask.contains(M::PORT) && !port_ok(attr.port_num) {
            return Err(HcaError::InvalidParameter(format!(
                "port {} outside of 1..={}",
                attr.port_num, limits.num_ports
            )));
        }
        if mask.contains(M::MAX_QP_RD_ATOMIC) && attr.max_rd_atomic > limits.max_qp_init_rdma {
            return Err(HcaError::InvalidParameter(format!(
                "initiator depth {} above {}",
                attr.max_rd_atomic, limits.max_qp_init_rdma
            )));
        }
        if mask.contains(M::MAX_DEST_RD_ATOMIC)
            && u32::from(attr.max_dest_rd_atomic) > 1 << limits.rdb_shift
        {
            return Err(HcaError::InvalidParameter(format!(
                "responder depth {} above {}",
                attr.max_dest_rd_atomic,
                1u32 << limits.rdb_shift
            )));
        }
        if mask.contains(M::PATH_MTU)
            && matches!(self.transport, Transport::Rc | Transport::Uc)
            && !(PathMtu::Mtu256..=PathMtu::Mtu2048).contains(&attr.path_mtu)
        {
            return Err(HcaError::InvalidParameter(format!(
                "path MTU {:?} not supported",
                attr.path_mtu
            )));
        }
        if mask.contains(M::ALT_PATH)
            && (attr.alt_pkey_index >= limits.pkey_table_len || !port_ok(attr.alt_port_num))
        {
            return Err(HcaError::InvalidParameter(format!(
                "alternate path P_Key index {} / port {} out of range",
                attr.alt_pkey_index, attr.alt_port_num
            )));
        }
        Ok(())
    }

    /// Reads the QP context back from firmware.
    pub(crate) fn query(&self, env: &QpEnv<'_>) -> Result<QpAttr> {
        let _cached = self.cached.lock();
        let mut attr = if self.state() == QpState::Reset {
            QpAttr::default()
        } else {
            let mut mailbox = Mailbox::new();
            check_status(
                "QUERY_QP",
                env.fw.query_qp(self.qpn, mailbox.as_bytes_mut()),
            )?;
            let (attr, draining) = context::decode(&mailbox, self.transport);
            self.set_state(attr.qp_state);
            self.draining.store(draining, Ordering::Release);
            attr
        };
        attr.cur_qp_state = attr.qp_state;
        attr.cap = self.cap();
        Ok(attr)
    }

    /// Brings the QP to RESET ahead of destroy and drops its CQEs.
    ///
    /// The QP is already unreachable through the table; a failed 2RST is
    /// logged and otherwise ignored.
    pub(crate) fn shutdown(&self, env: &QpEnv<'_>) {
        {
            let _cached = self.cached.lock();
            if self.state() != QpState::Reset {
                let mailbox = Mailbox::new();
                let status = env.fw.modify_qp(
                    Transition::ToRst,
                    self.qpn,
                    false,
                    mailbox.as_bytes(),
                );
                if check_status(Transition::ToRst.command_name(), status).is_err() {
                    warn!("QP {:#x}: 2RST on destroy failed", self.qpn);
                }
                self.set_state(QpState::Reset);
                self.draining.store(false, Ordering::Release);
            }
        }
        self.clean_cqs(env.cqs, env.srqs);
    }
}
