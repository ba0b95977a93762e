//! Record (de)serialization
//!
//! Records are the logical units inside a block. A record larger than
//! the free space of the current block is split: the first fragment
//! carries the regular header, every follow-up fragment carries a
//! continuation header (negative stream) with the still-missing byte
//! count. `DeviceRecord::remainder` tracks the unconsumed tail across
//! `write_record_to_block` / `read_record_from_block` calls.

use crate::{DeviceBlock, RECORD_HEADER_V1_SIZE, RECORD_HEADER_V2_SIZE};

/// FileIndex written before a volume is labeled for real use.
pub const PRE_LABEL: i32 = -1;
/// FileIndex of a volume label record.
pub const VOL_LABEL: i32 = -2;
/// FileIndex of an end-of-media label.
pub const EOM_LABEL: i32 = -3;
/// FileIndex of a start-of-session label.
pub const SOS_LABEL: i32 = -4;
/// FileIndex of an end-of-session label.
pub const EOS_LABEL: i32 = -5;
/// FileIndex of an end-of-tape label.
pub const EOT_LABEL: i32 = -6;

/// Human readable name for a special FileIndex marker.
pub fn file_index_name(file_index: i32) -> Option<&'static str> {
    match file_index {
        PRE_LABEL => Some("PRE_LABEL"),
        VOL_LABEL => Some("VOL_LABEL"),
        EOM_LABEL => Some("EOM_LABEL"),
        SOS_LABEL => Some("SOS_LABEL"),
        EOS_LABEL => Some("EOS_LABEL"),
        EOT_LABEL => Some("EOT_LABEL"),
        _ => None,
    }
}

/// One logical record, reused across many codec calls.
#[derive(Default)]
pub struct DeviceRecord {
    pub file_index: i32,
    pub stream: i32,
    pub vol_session_id: u32,
    pub vol_session_time: u32,
    /// Payload on the write side; reassembly buffer on the read side.
    pub data: Vec<u8>,
    /// Payload bytes not yet consumed by the codec.
    pub remainder: usize,
    /// The initial fragment header has been written/seen.
    started: bool,
}

impl DeviceRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set up the record for writing the given payload.
    pub fn prepare(&mut self, file_index: i32, stream: i32, data: &[u8]) {
        assert!(stream >= 0, "negative streams are reserved for continuations");
        self.file_index = file_index;
        self.stream = stream;
        self.data.clear();
        self.data.extend_from_slice(data);
        self.remainder = 0;
        self.started = false;
    }

    /// True for label/session marker records.
    pub fn is_marker(&self) -> bool {
        self.file_index < 0
    }
}

/// Serialize (a fragment of) `rec` into `block`.
///
/// Returns `true` when the record is now fully contained in blocks
/// written so far. Returns `false` when the block ran out of space;
/// the caller must write the block out, empty it and call again to
/// emit the remainder.
pub fn write_record_to_block(block: &mut DeviceBlock, rec: &mut DeviceRecord) -> bool {
    let rhl = RECORD_HEADER_V2_SIZE;

    if !rec.started {
        // fragment one needs the full header and at least one payload
        // byte (unless the record is empty) to make progress
        let need = rhl + if rec.data.is_empty() { 0 } else { 1 };
        if block.free_space() < need {
            return false;
        }
        // stream 0 has no distinct negation, so its fragments could
        // not be marked as continuations; never split such a record
        if rec.stream == 0 && block.free_space() < rhl + rec.data.len() {
            return false;
        }

        let mut header = [0u8; RECORD_HEADER_V2_SIZE];
        header[0..4].copy_from_slice(&rec.file_index.to_be_bytes());
        header[4..8].copy_from_slice(&rec.stream.to_be_bytes());
        header[8..12].copy_from_slice(&(rec.data.len() as u32).to_be_bytes());
        block.append(&header);

        rec.started = true;
        rec.remainder = rec.data.len();

        if block.first_index == 0 {
            block.first_index = rec.file_index;
        }
        block.last_index = rec.file_index;
    } else if rec.remainder > 0 {
        if block.free_space() < rhl + 1 {
            return false;
        }

        let mut header = [0u8; RECORD_HEADER_V2_SIZE];
        header[0..4].copy_from_slice(&rec.file_index.to_be_bytes());
        header[4..8].copy_from_slice(&(-rec.stream).to_be_bytes());
        header[8..12].copy_from_slice(&(rec.remainder as u32).to_be_bytes());
        block.append(&header);

        if block.first_index == 0 {
            block.first_index = rec.file_index;
        }
        block.last_index = rec.file_index;
    }

    if rec.remainder > 0 {
        let offset = rec.data.len() - rec.remainder;
        let count = rec.remainder.min(block.free_space());
        block.append(&rec.data[offset..offset + count]);
        rec.remainder -= count;
    }

    if rec.remainder == 0 {
        rec.started = false;
        true
    } else {
        false
    }
}

/// Extract the next record (fragment) from `block` into `rec`.
///
/// Returns `true` when a complete logical record is available in
/// `rec`. Returns `false` when the block is exhausted and the caller
/// must load the next block to get the missing tail.
pub fn read_record_from_block(block: &mut DeviceBlock, rec: &mut DeviceRecord) -> bool {
    loop {
        let rhl = if block.block_ver == 1 {
            RECORD_HEADER_V1_SIZE
        } else {
            RECORD_HEADER_V2_SIZE
        };

        if block.remaining() < rhl {
            // trailing slack smaller than a header, skip it
            let tail = block.remaining();
            if tail > 0 {
                block.consume(tail);
            }
            return false;
        }

        let (vol_session_id, vol_session_time) = if block.block_ver == 1 {
            let raw = block.consume(8);
            (
                u32::from_be_bytes(raw[0..4].try_into().unwrap()),
                u32::from_be_bytes(raw[4..8].try_into().unwrap()),
            )
        } else {
            (block.vol_session_id, block.vol_session_time)
        };
        let raw = block.consume(RECORD_HEADER_V2_SIZE);
        let file_index = i32::from_be_bytes(raw[0..4].try_into().unwrap());
        let stream = i32::from_be_bytes(raw[4..8].try_into().unwrap());
        let data_len = u32::from_be_bytes(raw[8..12].try_into().unwrap()) as usize;

        if stream < 0 {
            // continuation fragment
            if !rec.started || rec.file_index != file_index {
                // continuation without a first fragment: happens when
                // reading starts mid-volume, skip it
                log::debug!(
                    "skipping orphaned continuation (FileIndex={}, len={})",
                    file_index,
                    data_len
                );
                let skip = data_len.min(block.remaining());
                block.consume(skip);
                continue;
            }
        } else {
            if rec.started {
                log::warn!(
                    "new record (FileIndex={}) while record (FileIndex={}) is incomplete - dropping partial data",
                    file_index,
                    rec.file_index
                );
            }
            rec.file_index = file_index;
            rec.stream = stream;
            rec.vol_session_id = vol_session_id;
            rec.vol_session_time = vol_session_time;
            rec.data.clear();
            rec.started = true;
        }

        let count = data_len.min(block.remaining());
        rec.data.extend_from_slice(block.consume(count));
        rec.remainder = data_len - count;

        if rec.remainder == 0 {
            rec.started = false;
            return true;
        }
        return false;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ChecksumPolicy;

    fn transfer(block: &mut DeviceBlock) -> Vec<u8> {
        let raw = block.finalize().to_vec();
        block.empty_block();
        raw
    }

    #[test]
    fn small_record_fits() {
        let mut block = DeviceBlock::new(256);
        let mut rec = DeviceRecord::new();
        rec.prepare(1, 5, b"hello");
        assert!(write_record_to_block(&mut block, &mut rec));
        assert_eq!(rec.remainder, 0);

        let raw = transfer(&mut block);
        block.load(&raw, ChecksumPolicy::Enforce).unwrap();

        let mut out = DeviceRecord::new();
        assert!(read_record_from_block(&mut block, &mut out));
        assert_eq!(out.file_index, 1);
        assert_eq!(out.stream, 5);
        assert_eq!(out.data, b"hello");
    }

    #[test]
    fn record_spans_blocks() {
        let mut block = DeviceBlock::new(64); // 40 payload bytes per block
        let payload: Vec<u8> = (0..100u8).collect();
        let mut rec = DeviceRecord::new();
        rec.prepare(3, 2, &payload);

        // 64 - 24 header - 12 record header = 28 bytes fit
        assert!(!write_record_to_block(&mut block, &mut rec));
        assert_eq!(rec.remainder, 100 - 28);
        let raw1 = transfer(&mut block);

        assert!(!write_record_to_block(&mut block, &mut rec));
        assert_eq!(rec.remainder, 100 - 28 - 28);
        let raw2 = transfer(&mut block);

        assert!(!write_record_to_block(&mut block, &mut rec));
        let raw3 = transfer(&mut block);
        assert!(write_record_to_block(&mut block, &mut rec));
        assert_eq!(rec.remainder, 0);
        let raw4 = transfer(&mut block);

        let mut out = DeviceRecord::new();
        for (i, raw) in [&raw1, &raw2, &raw3].iter().enumerate() {
            block.load(raw, ChecksumPolicy::Enforce).unwrap();
            assert!(!read_record_from_block(&mut block, &mut out), "block {}", i);
            assert!(out.remainder > 0 || out.data.len() < 100);
        }
        block.load(&raw4, ChecksumPolicy::Enforce).unwrap();
        assert!(read_record_from_block(&mut block, &mut out));
        assert_eq!(out.data, payload);
        assert_eq!(out.remainder, 0);
        assert_eq!(out.file_index, 3);
        assert_eq!(out.stream, 2);
    }

    #[test]
    fn multiple_records_per_block() {
        let mut block = DeviceBlock::new(1024);
        let mut rec = DeviceRecord::new();
        for i in 1..=5 {
            rec.prepare(i, 1, format!("payload {}", i).as_bytes());
            assert!(write_record_to_block(&mut block, &mut rec));
        }
        assert_eq!(block.first_index, 1);
        assert_eq!(block.last_index, 5);

        let raw = transfer(&mut block);
        block.load(&raw, ChecksumPolicy::Enforce).unwrap();

        let mut out = DeviceRecord::new();
        for i in 1..=5 {
            assert!(read_record_from_block(&mut block, &mut out));
            assert_eq!(out.file_index, i);
            assert_eq!(out.data, format!("payload {}", i).as_bytes());
        }
        assert_eq!(block.remaining(), 0);
    }

    #[test]
    fn header_never_split() {
        // leave less than a record header of free space
        let mut block = DeviceBlock::new(64);
        let mut rec = DeviceRecord::new();
        rec.prepare(1, 1, &[0u8; 22]); // 12 + 22 = 34 of 40 used
        assert!(write_record_to_block(&mut block, &mut rec));

        rec.prepare(2, 1, b"xy");
        assert!(!write_record_to_block(&mut block, &mut rec));
        assert!(!block.is_empty());
        // nothing of record 2 landed in the full block
        assert_eq!(block.last_index, 1);

        let _ = transfer(&mut block);
        assert!(write_record_to_block(&mut block, &mut rec));
        assert_eq!(block.first_index, 2);
    }

    #[test]
    fn stream_zero_never_splits() {
        let mut block = DeviceBlock::new(64); // 40 payload bytes per block
        let mut rec = DeviceRecord::new();
        rec.prepare(1, 1, &[7u8; 10]);
        assert!(write_record_to_block(&mut block, &mut rec));

        // 18 free bytes left; a split would negate stream 0 into
        // itself and the tail would read as a fresh record
        let payload: Vec<u8> = (0..20u8).collect();
        rec.prepare(-4, 0, &payload);
        assert!(!write_record_to_block(&mut block, &mut rec));
        assert_eq!(rec.remainder, 0);
        assert_eq!(block.last_index, 1);
        let raw1 = transfer(&mut block);

        assert!(write_record_to_block(&mut block, &mut rec));
        let raw2 = transfer(&mut block);

        let mut out = DeviceRecord::new();
        block.load(&raw1, ChecksumPolicy::Enforce).unwrap();
        assert!(read_record_from_block(&mut block, &mut out));
        assert_eq!(out.data, &[7u8; 10]);
        block.load(&raw2, ChecksumPolicy::Enforce).unwrap();
        assert!(read_record_from_block(&mut block, &mut out));
        assert_eq!(out.file_index, -4);
        assert_eq!(out.stream, 0);
        assert_eq!(out.data, payload);

        // bigger than any block: refused even on an empty block
        rec.prepare(-4, 0, &[0u8; 100]);
        assert!(!write_record_to_block(&mut block, &mut rec));
        assert!(block.is_empty());
    }

    #[test]
    fn orphan_continuation_skipped() {
        let mut block = DeviceBlock::new(64);
        let payload: Vec<u8> = (0..50u8).collect();
        let mut rec = DeviceRecord::new();
        rec.prepare(9, 4, &payload);

        assert!(!write_record_to_block(&mut block, &mut rec));
        let _first = transfer(&mut block);
        assert!(write_record_to_block(&mut block, &mut rec));
        let second = transfer(&mut block);

        // start reading at the second block; its fragment has no head
        let mut out = DeviceRecord::new();
        block.load(&second, ChecksumPolicy::Enforce).unwrap();
        assert!(!read_record_from_block(&mut block, &mut out));
        assert_eq!(block.remaining(), 0);
        assert!(out.data.is_empty());
    }
}
