//! Caller unwinding for the optional, compile-time `unwind` feature
//! (§4.D.5, §9 "Preempt-any-instruction unwinding").
//!
//! This walks the classic frame-pointer chain (`rbp` -> saved `rbp` ->
//! saved return address), which requires the profiled binary to retain
//! frame pointers. It is deliberately the simplest unwinder that satisfies
//! the signal-safety contract: fixed-size output, no allocation, and a
//! hard depth bound so a corrupted or PIE-relocated frame chain cannot
//! loop forever.

use crate::context::RegisterSnapshot;
use crate::location::MemoryImage;

/// Default number of additional caller frames sampled past the interrupted
/// PC (§4.D.5 "default `D = 3`").
pub const DEFAULT_UNWIND_DEPTH: usize = 3;

/// Length added to `sampled` for the Nth unwound frame, so the file format
/// can distinguish "the interrupted PC itself" (`sampled == 0`) from
/// caller frames.
pub const UNWIND_TAG_BASE: i32 = 1 << 16;

/// Length, in bytes, of the `call` instruction assumed to precede a return
/// address; used to step the PC back to "before the call" so it lands
/// inside the caller's call site rather than the instruction after it.
/// §9 Open Questions: not portable across ISAs, hence gated and named.
#[cfg(target_arch = "x86_64")]
pub const CALL_INSN_LEN: u64 = 6;

/// A fixed-capacity stack of unwound caller contexts. `len` frames are
/// valid in `frames[0..len]`; never heap-allocated.
pub struct UnwoundFrames {
    frames: [RegisterSnapshot; DEFAULT_UNWIND_DEPTH],
    len: usize,
}

impl UnwoundFrames {
    pub fn as_slice(&self) -> &[RegisterSnapshot] {
        &self.frames[..self.len]
    }
}

/// Walks up to `DEFAULT_UNWIND_DEPTH` frames above `start`, following the
/// saved-rbp chain. Each produced frame has its program counter already
/// adjusted `CALL_INSN_LEN` bytes back from the return address (§4.D.5
/// "`pc` adjusted 6 bytes back") so it points at the call site, not the
/// return site.
pub fn unwind_callers(start: &RegisterSnapshot, mem: &impl MemoryImage) -> UnwoundFrames {
    let mut frames = [RegisterSnapshot::empty(); DEFAULT_UNWIND_DEPTH];
    let mut len = 0;

    let Some(mut rbp) = start.frame_base() else {
        return UnwoundFrames { frames, len };
    };

    for slot in frames.iter_mut() {
        if rbp == 0 {
            break;
        }
        // Saved rbp lives at [rbp]; the return address at [rbp + 8].
        let Some(saved_rbp) = mem.read_u64(rbp, 8) else {
            break;
        };
        let Some(return_addr) = mem.read_u64(rbp.wrapping_add(8), 8) else {
            break;
        };
        if return_addr == 0 {
            break;
        }
        let call_site = return_addr.saturating_sub(call_insn_len());
        let mut snap = RegisterSnapshot::empty();
        snap.set_frame_base(saved_rbp, saved_rbp);
        snap.set_instruction_pointer(call_site);
        *slot = snap;
        len += 1;
        rbp = saved_rbp;
    }

    UnwoundFrames { frames, len }
}

#[cfg(target_arch = "x86_64")]
fn call_insn_len() -> u64 {
    CALL_INSN_LEN
}

#[cfg(not(target_arch = "x86_64"))]
fn call_insn_len() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FlatMemory(HashMap<u64, u64>);
    impl MemoryImage for FlatMemory {
        fn read_u64(&self, addr: u64, size: u8) -> Option<u64> {
            let v = *self.0.get(&addr)?;
            let mask = if size >= 8 { u64::MAX } else { (1u64 << (size * 8)) - 1 };
            Some(v & mask)
        }
    }

    #[test]
    fn walks_two_frames() {
        let mut mem = HashMap::new();
        // frame 0 at rbp=0x1000: saved rbp=0x2000, return addr=0x4000100+6
        mem.insert(0x1000, 0x2000);
        mem.insert(0x1008, 0x4000106);
        // frame 1 at rbp=0x2000: saved rbp=0, terminates the chain
        mem.insert(0x2000, 0);
        mem.insert(0x2008, 0x4000206);
        let mem = FlatMemory(mem);

        let mut start = RegisterSnapshot::empty();
        start.set_frame_base(0x1000, 0x1000);

        let unwound = unwind_callers(&start, &mem);
        assert_eq!(unwound.as_slice().len(), 2);
        assert_eq!(unwound.as_slice()[0].instruction_pointer(), Some(0x4000100));
    }

    #[test]
    fn stops_at_null_rbp() {
        let mem = FlatMemory(HashMap::new());
        let mut start = RegisterSnapshot::empty();
        start.set_frame_base(0, 0);
        let unwound = unwind_callers(&start, &mem);
        assert_eq!(unwound.as_slice().len(), 0);
    }
}
