//! Fixed binary layout for cache files: a magic word, the entry metadata,
//! then the raw body until end of file. All integers are little-endian;
//! strings carry a 64-bit length prefix and header lists a 32-bit count.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::cache::CacheEntry;
use crate::response::Header;

pub(crate) const CACHE_MAGIC: u32 = 0x2015_0306;

#[derive(Debug, Error)]
pub(crate) enum CodecError {
    #[error("truncated cache header")]
    Truncated,
    #[error("bad magic {0:#010x}")]
    BadMagic(u32),
    #[error("string length {declared} exceeds {remaining} remaining bytes")]
    StringOverrun { declared: u64, remaining: usize },
    #[error("negative header count {0}")]
    NegativeHeaderCount(i32),
    #[error("cache header is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// The persisted metadata of one entry. The body is not part of the header;
/// it is whatever follows in the file.
#[derive(Debug, Clone)]
pub(crate) struct EntryHeader {
    pub key: String,
    pub etag: Option<String>,
    pub server_date: i64,
    pub last_modified: i64,
    pub ttl: i64,
    pub soft_ttl: i64,
    pub headers: Vec<Header>,
}

impl EntryHeader {
    pub(crate) fn from_entry(key: &str, entry: &CacheEntry) -> Self {
        Self {
            key: key.to_string(),
            etag: entry.etag.clone(),
            server_date: entry.server_date,
            last_modified: entry.last_modified,
            ttl: entry.ttl,
            soft_ttl: entry.soft_ttl,
            headers: entry.headers.clone(),
        }
    }

    pub(crate) fn into_entry(self, data: Bytes) -> CacheEntry {
        CacheEntry {
            data,
            etag: self.etag,
            server_date: self.server_date,
            last_modified: self.last_modified,
            ttl: self.ttl,
            soft_ttl: self.soft_ttl,
            headers: self.headers,
        }
    }

    pub(crate) fn write(&self, buf: &mut BytesMut) {
        buf.put_u32_le(CACHE_MAGIC);
        write_string(buf, &self.key);
        write_string(buf, self.etag.as_deref().unwrap_or(""));
        buf.put_i64_le(self.server_date);
        buf.put_i64_le(self.last_modified);
        buf.put_i64_le(self.ttl);
        buf.put_i64_le(self.soft_ttl);
        buf.put_u32_le(self.headers.len() as u32);
        for header in &self.headers {
            write_string(buf, header.name());
            write_string(buf, header.value());
        }
    }

    pub(crate) fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let magic = reader.read_u32()?;
        if magic != CACHE_MAGIC {
            return Err(CodecError::BadMagic(magic));
        }
        let key = reader.read_string()?;
        let etag = reader.read_string()?;
        let server_date = reader.read_i64()?;
        let last_modified = reader.read_i64()?;
        let ttl = reader.read_i64()?;
        let soft_ttl = reader.read_i64()?;
        let headers = reader.read_headers()?;
        Ok(Self {
            key,
            etag: (!etag.is_empty()).then_some(etag),
            server_date,
            last_modified,
            ttl,
            soft_ttl,
            headers,
        })
    }
}

fn write_string(buf: &mut BytesMut, value: &str) {
    buf.put_u64_le(value.len() as u64);
    buf.put_slice(value.as_bytes());
}

/// Bounds-checked cursor over a cache file's bytes.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < n {
            return Err(CodecError::Truncated);
        }
        let (taken, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(taken)
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(self.read_u32()? as i32)
    }

    pub(crate) fn read_i64(&mut self) -> Result<i64, CodecError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(raw))
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64, CodecError> {
        Ok(self.read_i64()? as u64)
    }

    pub(crate) fn read_string(&mut self) -> Result<String, CodecError> {
        let declared = self.read_u64()?;
        if declared > self.remaining() as u64 {
            return Err(CodecError::StringOverrun {
                declared,
                remaining: self.remaining(),
            });
        }
        let bytes = self.take(declared as usize)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    pub(crate) fn read_headers(&mut self) -> Result<Vec<Header>, CodecError> {
        let count = self.read_i32()?;
        if count < 0 {
            return Err(CodecError::NegativeHeaderCount(count));
        }
        let mut headers = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            let name = self.read_string()?;
            let value = self.read_string()?;
            headers.push(Header::new(name, value));
        }
        Ok(headers)
    }

    /// Everything past the header, i.e. the entry body.
    pub(crate) fn read_remaining(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }
}
