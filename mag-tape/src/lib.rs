//! Magnetar on-media data format
//!
//! Everything written to a volume is a sequence of *blocks*, each
//! carrying a small header and one or more *records*. Records may
//! span block boundaries. The first record on every volume is the
//! volume label, and each job brackets its data with a pair of
//! session labels. All header fields are written in network byte
//! order so media can move between architectures.

mod ser;
pub use ser::*;

mod block;
pub use block::*;

mod record;
pub use record::*;

mod label;
pub use label::*;

/// Magic id of the current (v2) block format.
pub const BLOCK_MAGIC_V2: [u8; 4] = *b"BB02";
/// Magic id of the legacy (v1) block format. Read-only support.
pub const BLOCK_MAGIC_V1: [u8; 4] = *b"BB01";

/// Size of the serialized v2 block header.
pub const BLOCK_HEADER_V2_SIZE: usize = 24;
/// Size of the serialized v1 block header (no session fields).
pub const BLOCK_HEADER_V1_SIZE: usize = 16;

/// Size of the serialized v2 record header.
pub const RECORD_HEADER_V2_SIZE: usize = 12;
/// Size of the serialized v1 record header (repeats the session ids).
pub const RECORD_HEADER_V1_SIZE: usize = 20;

/// Default block size (63k, a common tape block size).
pub const DEFAULT_BLOCK_SIZE: usize = 64512;
/// Smallest block size a device may be configured with.
pub const MIN_BLOCK_SIZE: usize = BLOCK_HEADER_V2_SIZE + RECORD_HEADER_V2_SIZE;
/// Largest block size a device may be configured with (4M).
pub const MAX_BLOCK_SIZE: usize = 4 * 1024 * 1024;
