//! Shared scratch buffer for kernels.
//!
//! One workspace is owned by the session and lent to each kernel during its
//! `run`. It is sized once to the largest requirement across kernels and
//! never shrinks. Storage is word-backed so typed views are always aligned.

use ember_core::{EmberError, Result};

const WORD: usize = std::mem::size_of::<u64>();

/// Growable, 8-byte aligned scratch memory.
#[derive(Debug, Default, Clone)]
pub struct Workspace {
    buf: Vec<u64>,
    size: usize,
}

impl Workspace {
    /// Create a workspace holding at least `bytes` bytes.
    pub fn new(bytes: usize) -> Self {
        Self {
            buf: vec![0u64; bytes.div_ceil(WORD)],
            size: bytes,
        }
    }

    /// Requested size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Grow to at least `bytes`. Never shrinks; returns true if it grew.
    pub fn grow(&mut self, bytes: usize) -> bool {
        if bytes <= self.size {
            return false;
        }
        self.buf.resize(bytes.div_ceil(WORD), 0);
        self.size = bytes;
        true
    }

    /// Raw byte view of the requested region.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let size = self.size;
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.buf)[..size]
    }

    /// The first `n` f32 slots of the workspace.
    pub fn f32_mut(&mut self, n: usize) -> Result<&mut [f32]> {
        self.check(n * 4)?;
        Ok(&mut bytemuck::cast_slice_mut::<u64, f32>(&mut self.buf)[..n])
    }

    /// The first `n` i32 slots of the workspace.
    pub fn i32_mut(&mut self, n: usize) -> Result<&mut [i32]> {
        self.check(n * 4)?;
        Ok(&mut bytemuck::cast_slice_mut::<u64, i32>(&mut self.buf)[..n])
    }

    fn check(&self, bytes: usize) -> Result<()> {
        if bytes > self.size {
            return Err(EmberError::param(format!(
                "workspace holds {} bytes, kernel needs {}",
                self.size, bytes
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_views_are_aligned() {
        let mut ws = Workspace::new(100);
        let f = ws.f32_mut(25).unwrap();
        assert_eq!(f.len(), 25);
        assert_eq!(f.as_ptr() as usize % 4, 0);
    }

    #[test]
    fn test_too_small() {
        let mut ws = Workspace::new(8);
        assert!(ws.f32_mut(3).is_err());
        assert!(ws.i32_mut(2).is_ok());
    }

    #[test]
    fn test_grow_never_shrinks() {
        let mut ws = Workspace::new(64);
        assert!(!ws.grow(32));
        assert_eq!(ws.size(), 64);
        assert!(ws.grow(200));
        assert_eq!(ws.size(), 200);
        assert_eq!(ws.bytes_mut().len(), 200);
    }

    #[test]
    fn test_empty() {
        let mut ws = Workspace::default();
        assert_eq!(ws.size(), 0);
        assert!(ws.f32_mut(0).unwrap().is_empty());
    }
}
