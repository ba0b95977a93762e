//! Portable field (de)serialization
//!
//! Label records are not written as raw structs. Fields are appended
//! one by one in a fixed order, integers as fixed-width big-endian
//! values and strings length-prefixed, so the reader consumes them in
//! the identical order regardless of host architecture.

#[derive(thiserror::Error, Debug)]
pub enum FormatError {
    #[error("serialized data exceeds the {0} byte limit")]
    OverLimit(usize),
    #[error("truncated field data (need {need} bytes, have {have})")]
    Truncated { need: usize, have: usize },
    #[error("string field is not valid utf-8")]
    BadUtf8(#[from] std::string::FromUtf8Error),
}

/// Append-only serialization buffer with a hard length limit.
pub struct SerBuf {
    buf: Vec<u8>,
    limit: usize,
}

impl SerBuf {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit),
            limit,
        }
    }

    fn put_bytes(&mut self, data: &[u8]) -> Result<(), FormatError> {
        if self.buf.len() + data.len() > self.limit {
            return Err(FormatError::OverLimit(self.limit));
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    pub fn put_u32(&mut self, v: u32) -> Result<(), FormatError> {
        self.put_bytes(&v.to_be_bytes())
    }

    pub fn put_i32(&mut self, v: i32) -> Result<(), FormatError> {
        self.put_bytes(&v.to_be_bytes())
    }

    pub fn put_u64(&mut self, v: u64) -> Result<(), FormatError> {
        self.put_bytes(&v.to_be_bytes())
    }

    pub fn put_i64(&mut self, v: i64) -> Result<(), FormatError> {
        self.put_bytes(&v.to_be_bytes())
    }

    /// Strings are stored as u32 byte length followed by the raw bytes.
    pub fn put_string(&mut self, s: &str) -> Result<(), FormatError> {
        self.put_u32(s.len() as u32)?;
        self.put_bytes(s.as_bytes())
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over serialized field data.
pub struct DeserBuf<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DeserBuf<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn get_bytes(&mut self, len: usize) -> Result<&'a [u8], FormatError> {
        let have = self.data.len() - self.pos;
        if len > have {
            return Err(FormatError::Truncated { need: len, have });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn get_u32(&mut self) -> Result<u32, FormatError> {
        Ok(u32::from_be_bytes(self.get_bytes(4)?.try_into().unwrap()))
    }

    pub fn get_i32(&mut self) -> Result<i32, FormatError> {
        Ok(i32::from_be_bytes(self.get_bytes(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64, FormatError> {
        Ok(u64::from_be_bytes(self.get_bytes(8)?.try_into().unwrap()))
    }

    pub fn get_i64(&mut self) -> Result<i64, FormatError> {
        Ok(i64::from_be_bytes(self.get_bytes(8)?.try_into().unwrap()))
    }

    pub fn get_string(&mut self) -> Result<String, FormatError> {
        let len = self.get_u32()? as usize;
        let bytes = self.get_bytes(len)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }
}
