//! On-media block handling
//!
//! A block is the unit of physical I/O. It starts with a fixed header
//! (see [`BlockHeaderV2`]) followed by serialized records. Blocks are
//! written atomically; a partially written block is never exposed to
//! readers.

use endian_trait::Endian;

use crate::{
    BLOCK_HEADER_V1_SIZE, BLOCK_HEADER_V2_SIZE, BLOCK_MAGIC_V1, BLOCK_MAGIC_V2, MAX_BLOCK_SIZE,
};

#[derive(Endian, Clone, Copy, Debug)]
#[repr(C, packed)]
/// Serialized v2 block header, written in network byte order.
pub struct BlockHeaderV2 {
    /// CRC32 over the block content after this field
    pub checksum: u32,
    /// Total block length including this header
    pub block_len: u32,
    /// Block sequence number within the current file
    pub block_num: u32,
    /// fixed value `BLOCK_MAGIC_V2`
    pub id: [u8; 4],
    /// Session id of the job that wrote the block
    pub vol_session_id: u32,
    /// Session time of the job that wrote the block
    pub vol_session_time: u32,
}

#[derive(thiserror::Error, Debug)]
pub enum BlockError {
    #[error("bad block magic {0:?}")]
    BadMagic([u8; 4]),
    #[error("block too short ({0} bytes)")]
    TooShort(usize),
    #[error("block length {len} out of range (buffer {max})")]
    LenOutOfRange { len: usize, max: usize },
    #[error("block {block_num} checksum mismatch (got {got:08x}, expected {expected:08x})")]
    Checksum {
        block_num: u32,
        got: u32,
        expected: u32,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
/// What to do when a block checksum does not match.
pub enum ChecksumPolicy {
    /// Treat a mismatch as a hard I/O error
    Enforce,
    /// Log a warning and deliver the block anyway
    Warn,
    /// Skip verification entirely
    Ignore,
}

/// In-memory staging buffer for one on-media block.
///
/// On the write side records are appended behind the (reserved)
/// header area until the block is full, then the header is serialized
/// and the whole thing handed to the device. On the read side a raw
/// block from the device is loaded and records are consumed from it.
pub struct DeviceBlock {
    buf: Vec<u8>,
    /// bytes occupied, including the header area
    binbuf: usize,
    /// read cursor while consuming records
    read_pos: usize,
    /// length of the block read from media (0 if none)
    read_len: usize,
    /// block format version of the loaded block (1 or 2)
    pub block_ver: u32,
    pub block_num: u32,
    pub vol_session_id: u32,
    pub vol_session_time: u32,
    /// FileIndex of the first record (fragment) in this block
    pub first_index: i32,
    /// FileIndex of the last record in this block
    pub last_index: i32,
}

impl DeviceBlock {
    /// Create a staging buffer for blocks of `block_size` bytes.
    pub fn new(block_size: usize) -> Self {
        assert!(block_size >= BLOCK_HEADER_V2_SIZE && block_size <= MAX_BLOCK_SIZE);
        let mut buf = proxmox_io::vec::undefined(block_size);
        buf[..BLOCK_HEADER_V2_SIZE].fill(0);
        Self {
            buf,
            binbuf: BLOCK_HEADER_V2_SIZE,
            read_pos: BLOCK_HEADER_V2_SIZE,
            read_len: 0,
            block_ver: 2,
            block_num: 0,
            vol_session_id: 0,
            vol_session_time: 0,
            first_index: 0,
            last_index: 0,
        }
    }

    /// Configured block size.
    pub fn block_size(&self) -> usize {
        self.buf.len()
    }

    /// Reset the buffer for assembling a new block.
    pub fn empty_block(&mut self) {
        self.binbuf = BLOCK_HEADER_V2_SIZE;
        self.read_pos = BLOCK_HEADER_V2_SIZE;
        self.read_len = 0;
        self.block_ver = 2;
        self.first_index = 0;
        self.last_index = 0;
    }

    /// True if no record data has been assembled or loaded.
    pub fn is_empty(&self) -> bool {
        if self.read_len != 0 {
            return false;
        }
        self.binbuf <= BLOCK_HEADER_V2_SIZE
    }

    /// Free payload space left on the write side.
    pub fn free_space(&self) -> usize {
        self.buf.len() - self.binbuf
    }

    /// Occupied bytes including the header area.
    pub fn binbuf(&self) -> usize {
        self.binbuf
    }

    pub(crate) fn append(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= self.free_space());
        self.buf[self.binbuf..self.binbuf + data.len()].copy_from_slice(data);
        self.binbuf += data.len();
    }

    /// Serialize the header and return the bytes to hand to the device.
    ///
    /// The caller owns block numbering; `block_num` must already be set.
    pub fn finalize(&mut self) -> &[u8] {
        let header = BlockHeaderV2 {
            checksum: 0,
            block_len: self.binbuf as u32,
            block_num: self.block_num,
            id: BLOCK_MAGIC_V2,
            vol_session_id: self.vol_session_id,
            vol_session_time: self.vol_session_time,
        }
        .to_be();
        let raw = unsafe {
            std::slice::from_raw_parts(
                (&header as *const BlockHeaderV2) as *const u8,
                BLOCK_HEADER_V2_SIZE,
            )
        };
        self.buf[..BLOCK_HEADER_V2_SIZE].copy_from_slice(raw);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.buf[4..self.binbuf]);
        let checksum: u32 = hasher.finalize();
        self.buf[..4].copy_from_slice(&checksum.to_be_bytes());

        &self.buf[..self.binbuf]
    }

    /// Load a raw block read from the device and parse its header.
    pub fn load(&mut self, data: &[u8], policy: ChecksumPolicy) -> Result<(), BlockError> {
        if data.len() < BLOCK_HEADER_V1_SIZE {
            return Err(BlockError::TooShort(data.len()));
        }
        if data.len() > self.buf.len() {
            return Err(BlockError::LenOutOfRange {
                len: data.len(),
                max: self.buf.len(),
            });
        }

        let magic: [u8; 4] = data[12..16].try_into().unwrap();
        let (header_len, ver) = match magic {
            BLOCK_MAGIC_V2 => (BLOCK_HEADER_V2_SIZE, 2),
            BLOCK_MAGIC_V1 => (BLOCK_HEADER_V1_SIZE, 1),
            other => return Err(BlockError::BadMagic(other)),
        };
        if data.len() < header_len {
            return Err(BlockError::TooShort(data.len()));
        }

        let checksum = u32::from_be_bytes(data[0..4].try_into().unwrap());
        let block_len = u32::from_be_bytes(data[4..8].try_into().unwrap()) as usize;
        let block_num = u32::from_be_bytes(data[8..12].try_into().unwrap());

        if block_len < header_len || block_len > data.len() {
            return Err(BlockError::LenOutOfRange {
                len: block_len,
                max: data.len(),
            });
        }

        if policy != ChecksumPolicy::Ignore {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&data[4..block_len]);
            let got = hasher.finalize();
            if got != checksum {
                if policy == ChecksumPolicy::Enforce {
                    return Err(BlockError::Checksum {
                        block_num,
                        got,
                        expected: checksum,
                    });
                }
                log::warn!(
                    "block {} checksum mismatch (got {:08x}, expected {:08x}) - ignored",
                    block_num,
                    got,
                    checksum
                );
            }
        }

        if ver == 2 {
            self.vol_session_id = u32::from_be_bytes(data[16..20].try_into().unwrap());
            self.vol_session_time = u32::from_be_bytes(data[20..24].try_into().unwrap());
        } else {
            // v1 blocks repeat the session ids in every record header
            self.vol_session_id = 0;
            self.vol_session_time = 0;
        }

        self.buf[..data.len()].copy_from_slice(data);
        self.block_ver = ver;
        self.block_num = block_num;
        self.read_len = block_len;
        self.read_pos = header_len;
        self.binbuf = block_len;
        Ok(())
    }

    /// Bytes not yet consumed on the read side.
    pub fn remaining(&self) -> usize {
        self.read_len.saturating_sub(self.read_pos)
    }

    pub(crate) fn consume(&mut self, len: usize) -> &[u8] {
        debug_assert!(len <= self.remaining());
        let slice = &self.buf[self.read_pos..self.read_pos + len];
        self.read_pos += len;
        slice
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let mut block = DeviceBlock::new(4096);
        block.block_num = 7;
        block.vol_session_id = 1;
        block.vol_session_time = 1700000000;
        block.append(b"some record data");
        let raw = block.finalize().to_vec();

        let mut copy = DeviceBlock::new(4096);
        copy.load(&raw, ChecksumPolicy::Enforce).unwrap();
        assert_eq!(copy.block_num, 7);
        assert_eq!(copy.block_ver, 2);
        assert_eq!(copy.vol_session_id, 1);
        assert_eq!(copy.vol_session_time, 1700000000);
        assert_eq!(copy.remaining(), 16);
    }

    #[test]
    fn checksum_policies() {
        let mut block = DeviceBlock::new(1024);
        block.append(b"payload");
        let mut raw = block.finalize().to_vec();
        raw[30] ^= 0xff; // corrupt payload

        let mut copy = DeviceBlock::new(1024);
        assert!(matches!(
            copy.load(&raw, ChecksumPolicy::Enforce),
            Err(BlockError::Checksum { .. })
        ));
        copy.load(&raw, ChecksumPolicy::Warn).unwrap();
        copy.load(&raw, ChecksumPolicy::Ignore).unwrap();
    }

    #[test]
    fn rejects_foreign_blocks() {
        let mut copy = DeviceBlock::new(1024);
        assert!(matches!(
            copy.load(&[0u8; 64], ChecksumPolicy::Enforce),
            Err(BlockError::BadMagic(_))
        ));
        assert!(matches!(
            copy.load(&[0u8; 4], ChecksumPolicy::Enforce),
            Err(BlockError::TooShort(4))
        ));
    }
}
