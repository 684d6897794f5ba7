//! Owned byte buffer with separate capacity and valid-length fields.

use crate::error::{Result, TcmError};

#[derive(Debug, Default, Clone)]
pub struct TransportBuffer {
    buf: Vec<u8>,
    data_length: usize,
}

impl TransportBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(size: usize) -> Self {
        Self {
            buf: vec![0; size],
            data_length: 0,
        }
    }

    /// Allocated size.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn data_length(&self) -> usize {
        self.data_length
    }

    pub fn set_data_length(&mut self, len: usize) {
        self.data_length = len.min(self.buf.len());
    }

    /// Ensure at least `size` bytes and zero the buffer; contents are discarded.
    pub fn alloc(&mut self, size: usize) {
        if self.buf.len() < size {
            self.buf.resize(size, 0);
        }
        self.buf.fill(0);
        self.data_length = 0;
    }

    /// Ensure at least `size` bytes, keeping existing contents.
    pub fn realloc(&mut self, size: usize) {
        if self.buf.len() < size {
            self.buf.resize(size, 0);
        }
    }

    /// Copy `len` bytes of `src` to `offset`, checking both sides.
    pub fn copy_in(&mut self, offset: usize, src: &[u8], len: usize) -> Result<()> {
        let available = self.buf.len().saturating_sub(offset);
        if len > available || len > src.len() {
            return Err(TcmError::CopyFault {
                needed: len,
                available: available.min(src.len()),
            });
        }
        self.buf[offset..offset + len].copy_from_slice(&src[..len]);
        Ok(())
    }

    /// Valid bytes.
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.data_length]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_zeroes_and_grows() {
        let mut buf = TransportBuffer::with_capacity(4);
        buf.as_mut_slice().copy_from_slice(&[1, 2, 3, 4]);
        buf.set_data_length(4);
        buf.alloc(8);
        assert_eq!(buf.capacity(), 8);
        assert_eq!(buf.data_length(), 0);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_realloc_keeps_contents() {
        let mut buf = TransportBuffer::with_capacity(2);
        buf.as_mut_slice().copy_from_slice(&[0xA5, 0x10]);
        buf.realloc(16);
        assert_eq!(&buf.as_slice()[..2], &[0xA5, 0x10]);
        assert_eq!(buf.capacity(), 16);
    }

    #[test]
    fn test_copy_fault() {
        let mut buf = TransportBuffer::with_capacity(4);
        assert!(buf.copy_in(2, &[1, 2], 2).is_ok());
        assert!(matches!(
            buf.copy_in(2, &[1, 2, 3], 3),
            Err(TcmError::CopyFault { needed: 3, .. })
        ));
        // Source shorter than the requested length.
        assert!(buf.copy_in(0, &[1], 2).is_err());
    }
}
