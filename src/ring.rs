//! Index-based byte ring.
//!
//! All wraparound arithmetic for audio buffers lives in [`RingIndex`]. Callers work in byte
//! counts and get back at most two contiguous spans; they never compute positions
//! themselves.

use crate::error::{Error, Result};
use std::ops::Range;

/// Read/write positions over a ring of `size` bytes.
///
/// `avail` is stored; `free` is derived, so `avail + free == size` holds by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingIndex {
    size: usize,
    read: usize,
    write: usize,
    avail: usize,
}

impl RingIndex {
    /// Empty ring of `size` bytes.
    pub const fn new(size: usize) -> Self {
        Self {
            size,
            read: 0,
            write: 0,
            avail: 0,
        }
    }

    /// Capacity in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Bytes ready to read.
    pub const fn avail(&self) -> usize {
        self.avail
    }

    /// Bytes ready to write.
    pub const fn free(&self) -> usize {
        self.size - self.avail
    }

    /// Read offset.
    pub const fn read_pos(&self) -> usize {
        self.read
    }

    /// Write offset.
    pub const fn write_pos(&self) -> usize {
        self.write
    }

    fn wrap(&self, pos: usize, n: usize) -> usize {
        let p = pos + n;
        if p >= self.size {
            p - self.size
        } else {
            p
        }
    }

    fn spans(&self, pos: usize, n: usize) -> (Range<usize>, Range<usize>) {
        let first = n.min(self.size - pos);
        (pos..pos + first, 0..n - first)
    }

    /// Spans covering the next `n` readable bytes.
    pub fn read_spans(&self, n: usize) -> Result<(Range<usize>, Range<usize>)> {
        if n > self.avail {
            return Err(Error::Invalid("read beyond available data"));
        }
        Ok(self.spans(self.read, n))
    }

    /// Spans covering the next `n` writable bytes.
    pub fn write_spans(&self, n: usize) -> Result<(Range<usize>, Range<usize>)> {
        if n > self.free() {
            return Err(Error::Invalid("write beyond free space"));
        }
        Ok(self.spans(self.write, n))
    }

    /// Mark `n` bytes as read.
    pub fn consume(&mut self, n: usize) -> Result<()> {
        if n > self.avail {
            return Err(Error::Invalid("consume exceeds available data"));
        }
        if n == 0 {
            return Ok(());
        }
        self.read = self.wrap(self.read, n);
        self.avail -= n;
        Ok(())
    }

    /// Mark `n` bytes as written.
    pub fn produce(&mut self, n: usize) -> Result<()> {
        if n > self.free() {
            return Err(Error::Invalid("produce exceeds free space"));
        }
        if n == 0 {
            return Ok(());
        }
        self.write = self.wrap(self.write, n);
        self.avail += n;
        Ok(())
    }

    /// Empty the ring and rewind both positions.
    pub fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
        self.avail = 0;
    }
}

/// A byte ring with owned storage.
#[derive(Debug, Clone)]
pub struct RingBuf {
    idx: RingIndex,
    data: Vec<u8>,
}

impl RingBuf {
    /// Zero-filled ring of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            idx: RingIndex::new(size),
            data: vec![0; size],
        }
    }

    /// Position bookkeeping.
    pub fn index(&self) -> &RingIndex {
        &self.idx
    }

    /// Capacity in bytes.
    pub fn size(&self) -> usize {
        self.idx.size()
    }

    /// Bytes ready to read.
    pub fn avail(&self) -> usize {
        self.idx.avail()
    }

    /// Bytes ready to write.
    pub fn free(&self) -> usize {
        self.idx.free()
    }

    /// Next `n` readable bytes as up to two slices, without consuming.
    pub fn read_slices(&self, n: usize) -> Result<(&[u8], &[u8])> {
        let (a, b) = self.idx.read_spans(n)?;
        Ok((&self.data[a], &self.data[b]))
    }

    /// Next `n` writable bytes as up to two slices, without producing.
    pub fn write_slices(&mut self, n: usize) -> Result<(&mut [u8], &mut [u8])> {
        let (a, b) = self.idx.write_spans(n)?;
        // `b` always starts at 0 and ends before `a` starts when it is non-empty.
        let (head, tail) = self.data.split_at_mut(a.start);
        Ok((&mut tail[..a.len()], &mut head[b]))
    }

    /// Advance the read position.
    pub fn consume(&mut self, n: usize) -> Result<()> {
        self.idx.consume(n)
    }

    /// Advance the write position.
    pub fn produce(&mut self, n: usize) -> Result<()> {
        self.idx.produce(n)
    }

    /// Copy `src` in and produce it. Fails without writing if it does not fit.
    pub fn write_from(&mut self, src: &[u8]) -> Result<()> {
        let (a, b) = self.write_slices(src.len())?;
        let split = a.len();
        a.copy_from_slice(&src[..split]);
        b.copy_from_slice(&src[split..]);
        self.produce(src.len())
    }

    /// Copy `dst.len()` bytes out and consume them.
    pub fn read_into(&mut self, dst: &mut [u8]) -> Result<()> {
        self.peek_into(dst)?;
        self.consume(dst.len())
    }

    /// Copy `dst.len()` bytes out without consuming.
    pub fn peek_into(&self, dst: &mut [u8]) -> Result<()> {
        let (a, b) = self.read_slices(dst.len())?;
        dst[..a.len()].copy_from_slice(a);
        dst[a.len()..].copy_from_slice(b);
        Ok(())
    }

    /// Produce `n` zero bytes.
    pub fn write_zeros(&mut self, n: usize) -> Result<()> {
        let (a, b) = self.write_slices(n)?;
        a.fill(0);
        b.fill(0);
        self.produce(n)
    }

    /// Move `n` bytes from `self` into `dst`.
    pub fn transfer_to(&mut self, dst: &mut RingBuf, n: usize) -> Result<()> {
        if n > self.avail() || n > dst.free() {
            return Err(Error::Invalid("transfer exceeds ring limits"));
        }
        let (a, b) = self.idx.read_spans(n)?;
        for span in [a, b] {
            let (x, y) = dst.write_slices(span.len())?;
            let split = x.len();
            x.copy_from_slice(&self.data[span.start..span.start + split]);
            y.copy_from_slice(&self.data[span.start + split..span.end]);
            dst.produce(span.len())?;
        }
        self.consume(n)
    }

    /// Empty the ring and zero its storage.
    pub fn reset(&mut self) {
        self.idx.reset();
        self.data.fill(0);
    }
}
