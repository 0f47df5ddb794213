/// Width of QP, CQ and SRQ numbers.
pub(crate) const OBJ_NUM_WIDTH: u32 = 24;
/// Mask of a 24-bit object number.
pub(crate) const OBJ_NUM_MASK: u32 = (1 << OBJ_NUM_WIDTH) - 1;

/// Number of lock shards per object table.
pub(crate) const TABLE_SHARDS: usize = 16;

/// Size of a CQE in bytes.
pub(crate) const CQE_SIZE: usize = 32;

/// Smallest WQE size shift (64 bytes).
pub(crate) const MIN_WQE_SHIFT: u8 = 6;

/// Size of a doorbell record in bytes.
pub(crate) const DB_REC_SIZE: usize = 8;

/// Size of the QP modify mailbox.
pub(crate) const QP_MAILBOX_SIZE: usize = 512;

/// Size of the CQ context image.
pub(crate) const CQ_CONTEXT_SIZE: usize = 64;

/// Size of the SRQ context image.
pub(crate) const SRQ_CONTEXT_SIZE: usize = 48;

/// Bytes reserved per send slot for an MLX transport header.
pub(crate) const UD_HEADER_SIZE: usize = 72;

/// Byte length reported for atomic completions.
pub(crate) const ATOMIC_BYTE_LEN: u32 = 8;

/// Size of one RDMA read responder entry.
pub(crate) const RDB_ENTRY_SIZE: u32 = 32;

/// Ack request frequency placed in the QP context.
pub(crate) const ACK_REQ_FREQ: u8 = 10;

/// Flight limit placed in the QP context.
pub(crate) const FLIGHT_LIMIT: u8 = 9;

/// Receive WQEs covered by one legacy receive doorbell.
pub(crate) const TAVOR_MAX_WQES_PER_RECV_DB: u32 = 256;

/// Send WQEs covered by one memory-free send doorbell.
pub(crate) const ARBEL_MAX_WQES_PER_SEND_DB: u32 = 255;

/// Permissive LID.
pub(crate) const PERMISSIVE_LID: u16 = 0xffff;

/// Page size used for minimum ring allocations.
pub(crate) const PAGE_SIZE: usize = 4096;
