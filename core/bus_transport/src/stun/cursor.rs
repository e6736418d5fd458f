//! Bounds-checked cursors for attribute parsing and rendering

use std::ops::Range;

use super::StunError;

// ============================================================================
// Reader
// ============================================================================

/// Read cursor over an immutable input slice.
///
/// Every read checks the remaining length first, so a failed read leaves the
/// cursor where it was.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    /// Start reading at `offset`; an offset past the end leaves nothing to read.
    pub fn at(buf: &'a [u8], offset: usize) -> Self {
        Reader {
            buf,
            pos: offset.min(buf.len()),
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Fail with `BufferTooSmall` unless `len` bytes remain.
    pub fn require(&self, len: usize) -> Result<(), StunError> {
        if self.remaining() < len {
            return Err(StunError::BufferTooSmall {
                needed: len,
                available: self.remaining(),
            });
        }
        Ok(())
    }

    pub fn skip(&mut self, len: usize) -> Result<(), StunError> {
        self.require(len)?;
        self.pos += len;
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, StunError> {
        self.require(1)?;
        let value = self.buf[self.pos];
        self.pos += 1;
        Ok(value)
    }

    pub fn read_u16_be(&mut self) -> Result<u16, StunError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], StunError> {
        self.require(len)?;
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }
}

// ============================================================================
// OutputBuffer
// ============================================================================

/// Growable output buffer for rendering a message.
///
/// `append` reports the byte range it wrote so callers can build a
/// zero-copy descriptor list over the finished buffer.
#[derive(Debug, Default, Clone)]
pub struct OutputBuffer {
    bytes: Vec<u8>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        OutputBuffer { bytes: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        OutputBuffer {
            bytes: Vec::with_capacity(capacity),
        }
    }

    /// Append `data` and return the range it now occupies.
    pub fn append(&mut self, data: &[u8]) -> Range<usize> {
        let start = self.bytes.len();
        self.bytes.extend_from_slice(data);
        start..self.bytes.len()
    }

    pub fn push_u8(&mut self, value: u8) -> Range<usize> {
        self.append(&[value])
    }

    pub fn push_u16_be(&mut self, value: u16) -> Range<usize> {
        self.append(&value.to_be_bytes())
    }

    /// Copy the prefix of `range` into `out`, returning how many bytes were copied.
    pub fn copy_prefix(&self, range: Range<usize>, out: &mut [u8]) -> usize {
        let end = range.end.min(self.bytes.len());
        let start = range.start.min(end);
        let len = (end - start).min(out.len());
        out[..len].copy_from_slice(&self.bytes[start..start + len]);
        len
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }
}
