//! In-memory firmware and doorbell page.
//!
//! [`EmulatedFirmware`] accepts every command, records it, and keeps the
//! last QP context written by MODIFY_QP so that QUERY_QP can return it.
//! Failures can be injected per command. [`RecordingUar`] keeps every
//! doorbell write.

use std::{collections::HashMap, io};

use parking_lot::Mutex;

use crate::{constants::QP_MAILBOX_SIZE, qp::Transition};

use super::{CommandStatus, Firmware, SpecialQpKind, UarAdaptor};

/// A command received by [`EmulatedFirmware`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum FirmwareCall {
    Sw2HwCq {
        cqn: u32,
        context: Vec<u8>,
    },
    Hw2SwCq {
        cqn: u32,
    },
    Sw2HwSrq {
        srqn: u32,
        context: Vec<u8>,
    },
    Hw2SwSrq {
        srqn: u32,
    },
    ModifyQp {
        transition: Transition,
        qpn: u32,
        sqd_event: bool,
        mailbox: Vec<u8>,
    },
    QueryQp {
        qpn: u32,
    },
    ConfSpecialQp {
        kind: SpecialQpKind,
        base_qpn: u32,
    },
    InitIb {
        port: u8,
    },
    CloseIb {
        port: u8,
    },
}

impl FirmwareCall {
    /// Command name, as used by [`EmulatedFirmware::fail_next`].
    #[must_use]
    pub fn name(&self) -> &'static str {
        match *self {
            FirmwareCall::Sw2HwCq { .. } => "SW2HW_CQ",
            FirmwareCall::Hw2SwCq { .. } => "HW2SW_CQ",
            FirmwareCall::Sw2HwSrq { .. } => "SW2HW_SRQ",
            FirmwareCall::Hw2SwSrq { .. } => "HW2SW_SRQ",
            FirmwareCall::ModifyQp { transition, .. } => transition.command_name(),
            FirmwareCall::QueryQp { .. } => "QUERY_QP",
            FirmwareCall::ConfSpecialQp { .. } => "CONF_SPECIAL_QP",
            FirmwareCall::InitIb { .. } => "INIT_IB",
            FirmwareCall::CloseIb { .. } => "CLOSE_IB",
        }
    }
}

#[derive(Debug, Default)]
struct FirmwareState {
    calls: Vec<FirmwareCall>,
    failures: HashMap<&'static str, CommandStatus>,
    qp_mailboxes: HashMap<u32, Vec<u8>>,
}

/// Firmware that runs every command in memory.
#[derive(Debug, Default)]
pub struct EmulatedFirmware {
    state: Mutex<FirmwareState>,
}

impl EmulatedFirmware {
    /// Creates a firmware with no recorded calls.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next command named `cmd` return `status`.
    pub fn fail_next(&self, cmd: &'static str, status: CommandStatus) {
        let _ignore = self.state.lock().failures.insert(cmd, status);
    }

    /// All commands received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<FirmwareCall> {
        self.state.lock().calls.clone()
    }

    /// Forgets the recorded commands.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Number of MODIFY_QP commands received so far.
    #[must_use]
    pub fn modify_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, FirmwareCall::ModifyQp { .. }))
            .count()
    }

    fn run(&self, call: FirmwareCall) -> CommandStatus {
        let mut state = self.state.lock();
        let status = state
            .failures
            .remove(call.name())
            .unwrap_or(CommandStatus::OK);
        if status.is_ok() {
            if let FirmwareCall::ModifyQp {
                qpn, ref mailbox, ..
            } = call
            {
                let _ignore = state.qp_mailboxes.insert(qpn, mailbox.clone());
            }
        }
        state.calls.push(call);
        status
    }
}

impl Firmware for EmulatedFirmware {
    fn sw2hw_cq(&self, cqn: u32, context: &[u8]) -> io::Result<CommandStatus> {
        Ok(self.run(FirmwareCall::Sw2HwCq {
            cqn,
            context: context.to_vec(),
        }))
    }

    fn hw2sw_cq(&self, cqn: u32) -> io::Result<CommandStatus> {
        Ok(self.run(FirmwareCall::Hw2SwCq { cqn }))
    }

    fn sw2hw_srq(&self, srqn: u32, context: &[u8]) -> io::Result<CommandStatus> {
        Ok(self.run(FirmwareCall::Sw2HwSrq {
            srqn,
            context: context.to_vec(),
        }))
    }

    fn hw2sw_srq(&self, srqn: u32) -> io::Result<CommandStatus> {
        Ok(self.run(FirmwareCall::Hw2SwSrq { srqn }))
    }

    fn modify_qp(
        &self,
        transition: Transition,
        qpn: u32,
        sqd_event: bool,
        mailbox: &[u8],
    ) -> io::Result<CommandStatus> {
        Ok(self.run(FirmwareCall::ModifyQp {
            transition,
            qpn,
            sqd_event,
            mailbox: mailbox.to_vec(),
        }))
    }

    fn query_qp(&self, qpn: u32, mailbox: &mut [u8]) -> io::Result<CommandStatus> {
        let status = self.run(FirmwareCall::QueryQp { qpn });
        if !status.is_ok() {
            return Ok(status);
        }
        let state = self.state.lock();
        let Some(stored) = state.qp_mailboxes.get(&qpn) else {
            return Ok(CommandStatus::BAD_INDEX);
        };
        let len = stored.len().min(mailbox.len()).min(QP_MAILBOX_SIZE);
        mailbox[..len].copy_from_slice(&stored[..len]);
        Ok(status)
    }

    fn conf_special_qp(&self, kind: SpecialQpKind, base_qpn: u32) -> io::Result<CommandStatus> {
        Ok(self.run(FirmwareCall::ConfSpecialQp { kind, base_qpn }))
    }

    fn init_ib(&self, port: u8) -> io::Result<CommandStatus> {
        Ok(self.run(FirmwareCall::InitIb { port }))
    }

    fn close_ib(&self, port: u8) -> io::Result<CommandStatus> {
        Ok(self.run(FirmwareCall::CloseIb { port }))
    }
}

/// A doorbell write seen by [`RecordingUar`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoorbellWrite {
    /// Offset inside the UAR page
    pub offset: usize,
    /// The two words written
    pub words: [u32; 2],
}

/// Doorbell page that records writes.
#[derive(Debug, Default)]
pub struct RecordingUar {
    writes: Mutex<Vec<DoorbellWrite>>,
}

impl RecordingUar {
    /// Creates a page with no recorded writes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All writes so far, oldest first.
    #[must_use]
    pub fn writes(&self) -> Vec<DoorbellWrite> {
        self.writes.lock().clone()
    }

    /// Removes and returns all recorded writes.
    pub fn take(&self) -> Vec<DoorbellWrite> {
        std::mem::take(&mut *self.writes.lock())
    }
}

impl UarAdaptor for RecordingUar {
    fn write64(&self, offset: usize, words: [u32; 2]) {
        self.writes.lock().push(DoorbellWrite { offset, words });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_failure_applies_once() {
        let fw = EmulatedFirmware::new();
        fw.fail_next("HW2SW_CQ", CommandStatus::BAD_RES_STATE);
        assert_eq!(fw.hw2sw_cq(1).unwrap(), CommandStatus::BAD_RES_STATE);
        assert_eq!(fw.hw2sw_cq(1).unwrap(), CommandStatus::OK);
        assert_eq!(fw.calls().len(), 2);
    }

    #[test]
    fn query_returns_last_modify_mailbox() {
        let fw = EmulatedFirmware::new();
        let mut mailbox = vec![0u8; QP_MAILBOX_SIZE];
        assert_eq!(
            fw.query_qp(9, &mut mailbox).unwrap(),
            CommandStatus::BAD_INDEX
        );
        let mut written = vec![0u8; QP_MAILBOX_SIZE];
        written[8] = 0x10;
        fw.modify_qp(Transition::Rst2Init, 9, false, &written)
            .unwrap();
        fw.query_qp(9, &mut mailbox).unwrap();
        assert_eq!(mailbox[8], 0x10);
        assert_eq!(fw.modify_count(), 1);
    }

    #[test]
    fn uar_records_in_order() {
        let uar = RecordingUar::new();
        uar.write64(0x10, [1, 2]);
        uar.write64(0x18, [3, 4]);
        assert_eq!(uar.writes()[1].offset, 0x18);
        assert_eq!(uar.take().len(), 2);
        assert!(uar.writes().is_empty());
    }
}
