//! Interfaces to the firmware command channel and the doorbell page.
//!
//! The transport core never talks to PCI resources itself. Firmware
//! mailbox commands go through [`Firmware`], MMIO doorbells through
//! [`UarAdaptor`]. [`emulated`] implements both in memory.

use std::{fmt, io};

use log::warn;

use crate::{
    error::{HcaError, Result},
    qp::Transition,
};

/// In-memory firmware and doorbell page
pub mod emulated;

/// Status byte returned by a firmware command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandStatus(pub u8);

#[allow(missing_docs)]
impl CommandStatus {
    pub const OK: Self = Self(0x00);
    pub const INTERNAL_ERR: Self = Self(0x01);
    pub const BAD_OP: Self = Self(0x02);
    pub const BAD_PARAM: Self = Self(0x03);
    pub const BAD_SYS_STATE: Self = Self(0x04);
    pub const BAD_RESOURCE: Self = Self(0x05);
    pub const RESOURCE_BUSY: Self = Self(0x06);
    pub const DDR_MEM_ERR: Self = Self(0x07);
    pub const EXCEED_LIM: Self = Self(0x08);
    pub const BAD_RES_STATE: Self = Self(0x09);
    pub const BAD_INDEX: Self = Self(0x0a);
    pub const BAD_NVMEM: Self = Self(0x0b);
    pub const BAD_QPEE_STATE: Self = Self(0x10);
    pub const BAD_SEG_PARAM: Self = Self(0x20);
    pub const REG_BOUND: Self = Self(0x21);
    pub const LAM_NOT_PRE: Self = Self(0x22);
    pub const BAD_PKT: Self = Self(0x30);
    pub const BAD_SIZE: Self = Self(0x40);

    /// Returns `true` if the command succeeded.
    #[must_use]
    pub fn is_ok(self) -> bool {
        self == Self::OK
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::OK => "OK",
            Self::INTERNAL_ERR => "INTERNAL_ERR",
            Self::BAD_OP => "BAD_OP",
            Self::BAD_PARAM => "BAD_PARAM",
            Self::BAD_SYS_STATE => "BAD_SYS_STATE",
            Self::BAD_RESOURCE => "BAD_RESOURCE",
            Self::RESOURCE_BUSY => "RESOURCE_BUSY",
            Self::DDR_MEM_ERR => "DDR_MEM_ERR",
            Self::EXCEED_LIM => "EXCEED_LIM",
            Self::BAD_RES_STATE => "BAD_RES_STATE",
            Self::BAD_INDEX => "BAD_INDEX",
            Self::BAD_NVMEM => "BAD_NVMEM",
            Self::BAD_QPEE_STATE => "BAD_QPEE_STATE",
            Self::BAD_SEG_PARAM => "BAD_SEG_PARAM",
            Self::REG_BOUND => "REG_BOUND",
            Self::LAM_NOT_PRE => "LAM_NOT_PRE",
            Self::BAD_PKT => "BAD_PKT",
            Self::BAD_SIZE => "BAD_SIZE",
            _ => return None,
        })
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({:#04x})", self.0),
            None => write!(f, "unknown ({:#04x})", self.0),
        }
    }
}

/// Which special QP a CONF_SPECIAL_QP command or a special QP refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialQpKind {
    /// Subnet management QP
    Qp0,
    /// General services QP
    Qp1,
}

impl SpecialQpKind {
    /// Position of the kind inside the special QP range.
    pub(crate) fn offset(self) -> u32 {
        match self {
            Self::Qp0 => 0,
            Self::Qp1 => 2,
        }
    }
}

/// Firmware mailbox commands used by the transport core.
///
/// Every command returns the firmware status byte; `Err` is reserved for
/// failures of the command channel itself.
pub trait Firmware: Send + Sync {
    /// Hands a CQ context to hardware.
    fn sw2hw_cq(&self, cqn: u32, context: &[u8]) -> io::Result<CommandStatus>;

    /// Takes a CQ back from hardware.
    fn hw2sw_cq(&self, cqn: u32) -> io::Result<CommandStatus>;

    /// Hands an SRQ context to hardware.
    fn sw2hw_srq(&self, srqn: u32, context: &[u8]) -> io::Result<CommandStatus>;

    /// Takes an SRQ back from hardware.
    fn hw2sw_srq(&self, srqn: u32) -> io::Result<CommandStatus>;

    /// Runs a QP state transition with the given mailbox (optparam mask at
    /// offset 0, QP context at offset 8).
    fn modify_qp(
        &self,
        transition: Transition,
        qpn: u32,
        sqd_event: bool,
        mailbox: &[u8],
    ) -> io::Result<CommandStatus>;

    /// Reads the QP context into `mailbox`, laid out as for `modify_qp`.
    fn query_qp(&self, qpn: u32, mailbox: &mut [u8]) -> io::Result<CommandStatus>;

    /// Tells firmware which QP numbers serve as special QPs.
    fn conf_special_qp(&self, kind: SpecialQpKind, base_qpn: u32) -> io::Result<CommandStatus>;

    /// Brings a physical port up.
    fn init_ib(&self, port: u8) -> io::Result<CommandStatus>;

    /// Brings a physical port down.
    fn close_ib(&self, port: u8) -> io::Result<CommandStatus>;
}

/// The doorbell page of the driver's UAR.
pub trait UarAdaptor: Send + Sync {
    /// Writes two big-endian words to `offset` as one 64-bit store.
    fn write64(&self, offset: usize, words: [u32; 2]);
}

/// Turns a command result into an `HcaError`, logging failures.
pub(crate) fn check_status(cmd: &'static str, result: io::Result<CommandStatus>) -> Result<()> {
    match result {
        Ok(status) if status.is_ok() => Ok(()),
        Ok(status) => {
            warn!("{cmd} returned status {status}");
            Err(HcaError::Command { cmd, status })
        }
        Err(err) => {
            warn!("{cmd} failed: {err}");
            Err(HcaError::IoError(err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_names_known_codes() {
        assert_eq!(CommandStatus::BAD_PARAM.to_string(), "BAD_PARAM (0x03)");
        assert_eq!(CommandStatus(0x7f).to_string(), "unknown (0x7f)");
        assert!(CommandStatus::OK.is_ok());
    }

    #[test]
    fn check_status_maps_failures() {
        assert!(check_status("HW2SW_CQ", Ok(CommandStatus::OK)).is_ok());
        let err = check_status("HW2SW_CQ", Ok(CommandStatus::BAD_RES_STATE)).unwrap_err();
        assert!(matches!(
            err,
            HcaError::Command {
                cmd: "HW2SW_CQ",
                status: CommandStatus::BAD_RES_STATE
            }
        ));
        let err = check_status("HW2SW_CQ", Err(io::ErrorKind::BrokenPipe.into())).unwrap_err();
        assert!(matches!(err, HcaError::IoError(_)));
    }
}
