//! Fixed-stride PC-to-bucket hashing shared by the histogram, call-graph,
//! variable-chain, and shadow-chain arenas.
//!
//! All four arenas are indexed the same way: a program counter that falls
//! inside `[lowpc, highpc)` maps to a bucket by dividing its offset from
//! `lowpc` by a stride. The stride is `hash_fraction * size_of::<usize>()`.
//! When `hash_fraction` is a power of two (the common case, matching the
//! classic gprof tuning constants) the division becomes a shift.

pub const HISTFRACTION: usize = 2;
pub const HASHFRACTION: usize = 2;
pub const MINARCS: usize = 50;
pub const MAXARCS: usize = 1 << 20;
pub const ARCDENSITY: usize = 2;

/// Returned by `bucket()` for a PC outside `[lowpc, highpc)`.
pub const NO_BUCKET: isize = -1;

/// Text-segment bounds plus the derived hashing geometry, computed once in
/// `monstartup` and consulted by every arena lookup thereafter.
#[derive(Debug, Clone, Copy)]
pub struct TextWindow {
    pub lowpc: usize,
    pub highpc: usize,
    pub hash_fraction: usize,
    log2_stride: Option<u32>,
}

impl TextWindow {
    pub fn new(lowpc: usize, highpc: usize, hash_fraction: usize) -> Self {
        let stride = hash_fraction * std::mem::size_of::<usize>();
        let log2_stride = if stride.is_power_of_two() {
            Some(stride.trailing_zeros())
        } else {
            None
        };
        TextWindow {
            lowpc,
            highpc,
            hash_fraction,
            log2_stride,
        }
    }

    #[inline]
    pub fn textsize(&self) -> usize {
        self.highpc.saturating_sub(self.lowpc)
    }

    /// Fast-path bucket computation. Returns `NO_BUCKET` for any PC outside
    /// the window, which short-circuits every caller in §4.D/§4.E.
    #[inline]
    pub fn bucket(&self, pc: usize) -> isize {
        if pc < self.lowpc || pc >= self.highpc {
            return NO_BUCKET;
        }
        let offset = pc - self.lowpc;
        let b = match self.log2_stride {
            Some(shift) => offset >> shift,
            None => offset / (self.hash_fraction * std::mem::size_of::<usize>()),
        };
        b as isize
    }

    pub fn kcount_size(&self) -> usize {
        round_to_link(self.textsize().div_ceil(HISTFRACTION))
    }

    pub fn froms_size(&self) -> usize {
        round_to_link(self.textsize().div_ceil(HASHFRACTION))
    }

    pub fn tolimit(&self) -> usize {
        (self.textsize() * ARCDENSITY / 100).clamp(MINARCS, MAXARCS)
    }
}

fn round_to_link(n: usize) -> usize {
    let link = std::mem::size_of::<usize>();
    n.div_ceil(link) * link
}

/// Fixed-point multiplier applied to a raw PC offset before it indexes
/// `kcount[]` (§4.D.1): `i = (offset / 2) * scale / 65536`. Also the value
/// persisted verbatim in the `gmon_var` header's `scale` field
/// (`storage::write_gmon_var`).
pub fn histogram_scale() -> u32 {
    (65536 / HISTFRACTION) as u32
}

/// A singly-linked chain node living inside one of the flat arenas. `link`
/// is an index into the same arena, `0` meaning "end of chain" -- arena
/// slot 0 is always reserved as the sentinel, matching the historical
/// one-based indexing of the format this crate's output is compatible with.
pub const NULL_LINK: u32 = 0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_power_of_two_stride() {
        let w = TextWindow::new(0x4000000, 0x4001000, 2);
        assert_eq!(w.bucket(0x4000000), 0);
        assert_eq!(w.bucket(0x3fff000), NO_BUCKET);
        assert_eq!(w.bucket(0x4001000), NO_BUCKET);
    }

    #[test]
    fn histogram_density_scenario() {
        // From the spec's worked example: 4 KiB text, HISTFRACTION = 4.
        let w = TextWindow::new(0x4000000, 0x4001000, HASHFRACTION);
        assert_eq!(w.textsize(), 4096);
        let kcountsize = round_to_link(4096usize.div_ceil(4));
        assert_eq!(kcountsize, 1024);
    }

    #[test]
    fn tolimit_clamps() {
        let tiny = TextWindow::new(0, 1000, HASHFRACTION);
        assert_eq!(tiny.tolimit(), MINARCS);
        let huge = TextWindow::new(0, 1 << 40, HASHFRACTION);
        assert_eq!(huge.tolimit(), MAXARCS);
    }
}
