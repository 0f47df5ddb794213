//! Transport core of an InfiniBand host channel adapter driver.
//!
//! The crate manages queue pairs, completion queues and shared receive queues
//! for two hardware generations: the legacy doorbell protocol, where every
//! batch of work is announced with an MMIO write, and the memory-free
//! protocol, where a doorbell record in host memory carries the producer and
//! consumer counters.
//!
//! Firmware mailbox commands and the doorbell page are consumed through the
//! [`Firmware`] and [`UarAdaptor`] traits. [`device::emulated`] provides
//! in-memory implementations of both.

#![allow(clippy::module_name_repetitions)]

/// Memory barriers for device visible memory
mod barrier;

/// Driver configuration
pub mod config;

/// Driver wide constants
mod constants;

/// Completion queues and the CQE decoder
mod cq;

/// Firmware and doorbell page interfaces
pub mod device;

/// Doorbell protocols and doorbell records
mod doorbell;

/// Error types
pub mod error;

/// Host memory shared with the device
mod mem;

/// Queue pairs: state machine, context image and posting engine
mod qp;

/// Work queue ring primitive
mod ring;

/// Shared receive queues
mod srq;

/// Generation checked object tables
mod table;

/// Public work request and completion types
pub mod types;

/// Verbs entry points
pub mod verbs;

/// Work queue entry codec
mod wqe;

#[cfg(test)]
mod test_utils;

pub use config::{ConfigLoader, DeviceLimits, DoorbellKind, HcaConfig};
pub use device::{CommandStatus, Firmware, SpecialQpKind, UarAdaptor};
pub use error::{HcaError, PostError, Result, Status};
pub use qp::{
    AccessFlags, MigState, PathMtu, QpAttr, QpAttrMask, QpCap, QpEvent, QpInitAttr, QpState,
    Transition, Transport,
};
pub use types::*;
pub use verbs::{HcaContext, VerbsOps};
