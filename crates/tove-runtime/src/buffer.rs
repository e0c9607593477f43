//! In-memory byte buffer: the snapshot sink/source.
//!
//! Little-endian fixed-width primitives, a read cursor, and the one
//! random-access operation the encoder needs (`patch_u32`).

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("unexpected end of stream")]
    UnexpectedEof,
}

/// Growable byte sink/source.
#[derive(Debug, Default)]
pub struct ByteBuffer {
    data: Vec<u8>,
    pos: usize,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current read cursor.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    // --- write side ---

    pub fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_f32(&mut self, v: f32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_f64(&mut self, v: f64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bytes(&mut self, b: &[u8]) {
        self.data.extend_from_slice(b);
    }

    /// NUL-terminated byte string. The caller must ensure `b` itself has no
    /// NUL bytes.
    pub fn put_cstr(&mut self, b: &[u8]) {
        self.data.extend_from_slice(b);
        self.data.push(0);
    }

    /// Overwrite 4 bytes at `at`, which must already be written.
    pub fn patch_u32(&mut self, at: usize, v: u32) -> Result<(), BufferError> {
        let end = at.checked_add(4).ok_or(BufferError::UnexpectedEof)?;
        if end > self.data.len() {
            return Err(BufferError::UnexpectedEof);
        }
        self.data[at..end].copy_from_slice(&v.to_le_bytes());
        Ok(())
    }

    // --- read side ---

    fn take(&mut self, n: usize) -> Result<&[u8], BufferError> {
        let end = self.pos.checked_add(n).ok_or(BufferError::UnexpectedEof)?;
        if end > self.data.len() {
            return Err(BufferError::UnexpectedEof);
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, BufferError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32, BufferError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64, BufferError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_i32(&mut self) -> Result<i32, BufferError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_i64(&mut self) -> Result<i64, BufferError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_f32(&mut self) -> Result<f32, BufferError> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_f64(&mut self) -> Result<f64, BufferError> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<Vec<u8>, BufferError> {
        Ok(self.take(n)?.to_vec())
    }

    /// Read up to (and consume) the next NUL byte.
    pub fn get_cstr(&mut self) -> Result<Vec<u8>, BufferError> {
        let rest = &self.data[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(BufferError::UnexpectedEof)?;
        let out = rest[..nul].to_vec();
        self.pos += nul + 1;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_round_trip() {
        let mut buf = ByteBuffer::new();
        buf.put_u8(7);
        buf.put_u32(0xdead_beef);
        buf.put_i64(-42);
        buf.put_f64(1.5);
        buf.put_cstr(b"print");

        assert_eq!(buf.get_u8(), Ok(7));
        assert_eq!(buf.get_u32(), Ok(0xdead_beef));
        assert_eq!(buf.get_i64(), Ok(-42));
        assert_eq!(buf.get_f64(), Ok(1.5));
        assert_eq!(buf.get_cstr(), Ok(b"print".to_vec()));
        assert_eq!(buf.get_u8(), Err(BufferError::UnexpectedEof));
    }

    #[test]
    fn patch_rewrites_in_place() {
        let mut buf = ByteBuffer::new();
        buf.put_u32(1);
        buf.put_u32(2);
        buf.patch_u32(0, 9).unwrap();
        assert_eq!(buf.get_u32(), Ok(9));
        assert_eq!(buf.get_u32(), Ok(2));
        assert!(buf.patch_u32(6, 0).is_err());
    }

    #[test]
    fn truncated_reads_fail() {
        let mut buf = ByteBuffer::from_vec(vec![1, 2, 3]);
        assert_eq!(buf.get_u32(), Err(BufferError::UnexpectedEof));
        // A failed read must not consume anything.
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.get_u8(), Ok(1));
    }

    #[test]
    fn cstr_requires_terminator() {
        let mut buf = ByteBuffer::from_vec(b"abc".to_vec());
        assert_eq!(buf.get_cstr(), Err(BufferError::UnexpectedEof));
    }
}
