//! Large configuration transfers.
//!
//! A blob larger than one IPC message arrives as fragments tagged
//! `pos = (last << 1) | first`. The first fragment carries the total size in
//! `data_offset_size`, every later one its offset into the blob.

use crate::error::{Error, Result};
use crate::heap::{Heap, Zone, ZoneVec};
use std::sync::Arc;

/// Position of a fragment in its blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FragmentPosition {
    Middle = 0,
    First = 1,
    Last = 2,
    Single = 3,
}

impl FragmentPosition {
    pub fn from_flags(first: bool, last: bool) -> Self {
        match ((last as u8) << 1) | first as u8 {
            0 => FragmentPosition::Middle,
            1 => FragmentPosition::First,
            2 => FragmentPosition::Last,
            _ => FragmentPosition::Single,
        }
    }

    pub fn is_first(self) -> bool {
        matches!(self, FragmentPosition::First | FragmentPosition::Single)
    }

    pub fn is_last(self) -> bool {
        matches!(self, FragmentPosition::Last | FragmentPosition::Single)
    }
}

#[derive(Debug)]
struct Pending {
    config_id: u32,
    data: ZoneVec,
    offset: usize,
}

/// Reassembles fragmented configuration blobs, one at a time.
#[derive(Debug)]
pub struct ConfigAssembler {
    heap: Arc<Heap>,
    max_blob: usize,
    pending: Option<Pending>,
}

impl ConfigAssembler {
    pub fn new(heap: Arc<Heap>, max_blob: usize) -> Self {
        Self {
            heap,
            max_blob,
            pending: None,
        }
    }

    /// Whether a blob is partially assembled.
    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    /// Drop any partial blob.
    pub fn abort(&mut self) {
        if let Some(p) = self.pending.take() {
            tracing::debug!(config_id = p.config_id, received = p.offset, "partial config discarded");
        }
    }

    fn fail(&mut self, reason: &'static str) -> Error {
        self.abort();
        tracing::warn!(reason, "config fragment rejected");
        Error::Invalid(reason)
    }

    /// Add one fragment. Returns the whole blob once its last fragment arrived.
    ///
    /// A first fragment while assembling is EBUSY and keeps the partial blob. Any other
    /// protocol violation is EINVAL and discards it.
    pub fn push(
        &mut self,
        config_id: u32,
        pos: FragmentPosition,
        data_offset_size: usize,
        fragment: &[u8],
    ) -> Result<Option<ZoneVec>> {
        if pos.is_first() {
            if self.pending.is_some() {
                return Err(Error::Busy);
            }
            let total = data_offset_size;
            if total == 0 {
                return Ok(None);
            }
            if total > self.max_blob {
                return Err(Error::Invalid("config blob too large"));
            }
            if fragment.len() > total || (pos == FragmentPosition::Single && fragment.len() != total) {
                return Err(Error::Invalid("fragment does not match blob size"));
            }
            let mut data = self.heap.alloc_bytes(Zone::Runtime, total)?;
            data[..fragment.len()].copy_from_slice(fragment);
            if pos == FragmentPosition::Single {
                return Ok(Some(data));
            }
            self.pending = Some(Pending {
                config_id,
                data,
                offset: fragment.len(),
            });
            return Ok(None);
        }

        let Some(p) = self.pending.as_mut() else {
            tracing::warn!(config_id, "fragment without a first fragment");
            return Err(Error::Invalid("orphan config fragment"));
        };
        if p.config_id != config_id {
            return Err(self.fail("fragment for a different config id"));
        }
        if p.offset != data_offset_size {
            return Err(self.fail("fragment offset mismatch"));
        }
        let end = p.offset + fragment.len();
        if end > p.data.len() {
            return Err(self.fail("fragment overruns blob"));
        }
        p.data[p.offset..end].copy_from_slice(fragment);
        p.offset = end;
        if !pos.is_last() {
            return Ok(None);
        }
        if end != p.data.len() {
            return Err(self.fail("blob incomplete at last fragment"));
        }
        Ok(self.pending.take().map(|p| p.data))
    }
}

/// Serves a module's configuration blob in fragments.
#[derive(Debug, Default)]
pub struct ConfigReader {
    cached: Option<(u32, Vec<u8>)>,
}

impl ConfigReader {
    /// Copy the next fragment into `out` and return its length.
    ///
    /// On `first`, `fetch` fills the blob and `data_offset_size` receives its total size;
    /// otherwise `data_offset_size` is the offset to read from. The blob is dropped after
    /// its final byte has been read.
    pub fn read(
        &mut self,
        config_id: u32,
        first: bool,
        data_offset_size: &mut u32,
        out: &mut [u8],
        fetch: impl FnOnce(&mut Vec<u8>) -> Result<()>,
    ) -> Result<usize> {
        let offset = if first {
            let mut blob = Vec::new();
            fetch(&mut blob)?;
            *data_offset_size =
                u32::try_from(blob.len()).map_err(|_| Error::Invalid("config blob too large"))?;
            self.cached = Some((config_id, blob));
            0
        } else {
            *data_offset_size as usize
        };
        let Some((id, blob)) = self.cached.as_ref() else {
            return Err(Error::Invalid("no config read in progress"));
        };
        if *id != config_id || offset > blob.len() {
            self.cached = None;
            return Err(Error::Invalid("config read offset mismatch"));
        }
        let n = out.len().min(blob.len() - offset);
        out[..n].copy_from_slice(&blob[offset..offset + n]);
        if offset + n == blob.len() {
            self.cached = None;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn assembler() -> ConfigAssembler {
        ConfigAssembler::new(Heap::unbounded(), 4096)
    }

    #[test]
    fn position_encoding() {
        assert_eq!(FragmentPosition::from_flags(true, false), FragmentPosition::First);
        assert_eq!(FragmentPosition::from_flags(false, true), FragmentPosition::Last);
        assert_eq!(FragmentPosition::from_flags(true, true), FragmentPosition::Single);
        assert_eq!(FragmentPosition::from_flags(false, false) as u8, 0);
    }

    #[test]
    fn orphan_fragments_are_rejected() {
        let mut a = assembler();
        assert_eq!(
            a.push(1, FragmentPosition::Middle, 0, &[1, 2]).unwrap_err(),
            Error::Invalid("orphan config fragment")
        );
        assert!(a.push(1, FragmentPosition::Last, 0, &[1, 2]).is_err());
    }

    #[test]
    fn second_first_is_busy_and_keeps_progress() {
        let mut a = assembler();
        assert!(a.push(7, FragmentPosition::First, 4, &[1, 2]).unwrap().is_none());
        assert_eq!(a.push(7, FragmentPosition::First, 4, &[9]).unwrap_err(), Error::Busy);
        let blob = a.push(7, FragmentPosition::Last, 2, &[3, 4]).unwrap().unwrap();
        assert_eq!(&blob[..], &[1, 2, 3, 4]);
        assert!(!a.is_busy());
    }

    #[test]
    fn offset_mismatch_discards() {
        let mut a = assembler();
        a.push(2, FragmentPosition::First, 6, &[1, 2]).unwrap();
        assert!(a.push(2, FragmentPosition::Middle, 3, &[3]).is_err());
        assert!(!a.is_busy());
    }

    #[test]
    fn oversized_blob_is_rejected() {
        let mut a = ConfigAssembler::new(Heap::unbounded(), 8);
        assert_eq!(
            a.push(0, FragmentPosition::First, 9, &[0; 4]).unwrap_err(),
            Error::Invalid("config blob too large")
        );
    }

    #[test]
    fn assembly_is_charged_to_runtime_zone() {
        let heap = Heap::new(0, 4, 0);
        let mut a = ConfigAssembler::new(heap.clone(), 4096);
        assert!(matches!(
            a.push(0, FragmentPosition::First, 8, &[0; 2]).unwrap_err(),
            Error::NoMemory { .. }
        ));
        let blob = a.push(0, FragmentPosition::Single, 4, &[1; 4]).unwrap().unwrap();
        assert_eq!(heap.used(Zone::Runtime), 4);
        drop(blob);
        assert_eq!(heap.used(Zone::Runtime), 0);
    }

    #[test]
    fn reader_serves_fragments() {
        let mut r = ConfigReader::default();
        let mut size = 0u32;
        let mut out = [0u8; 3];
        let n = r
            .read(5, true, &mut size, &mut out, |b| {
                b.extend_from_slice(&[1, 2, 3, 4, 5]);
                Ok(())
            })
            .unwrap();
        assert_eq!((n, size), (3, 5));
        let mut off = 3u32;
        let n = r.read(5, false, &mut off, &mut out, |_| Ok(())).unwrap();
        assert_eq!(&out[..n], &[4, 5]);
        assert!(r.read(5, false, &mut off, &mut out, |_| Ok(())).is_err());
    }

    proptest! {
        #[test]
        fn fragmented_equals_single(
            blob in proptest::collection::vec(any::<u8>(), 3..512),
            a in 1usize..1000,
            b in 1usize..1000,
        ) {
            let cut1 = 1 + a % (blob.len() - 2);
            let cut2 = cut1 + 1 + b % (blob.len() - cut1 - 1);
            let mut asm = assembler();
            prop_assert!(asm.push(3, FragmentPosition::First, blob.len(), &blob[..cut1]).unwrap().is_none());
            prop_assert!(asm.push(3, FragmentPosition::Middle, cut1, &blob[cut1..cut2]).unwrap().is_none());
            let split = asm.push(3, FragmentPosition::Last, cut2, &blob[cut2..]).unwrap().unwrap();
            let single = asm.push(3, FragmentPosition::Single, blob.len(), &blob).unwrap().unwrap();
            prop_assert_eq!(&split[..], &single[..]);
            prop_assert_eq!(&split[..], &blob[..]);
        }
    }
}
