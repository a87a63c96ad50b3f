//! The flat, index-addressed arenas backing every profiling data structure
//! (§3 "Data model"). Everything here is allocated once in `monstartup` and
//! freed once in `mcleanup`; no entry is ever deleted, compacted, or
//! rehashed. Arena slot `0` is reserved as the "null" sentinel for every
//! linked chain, so real entries start at index `1`.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;

use crate::hashtable::TextWindow;
use crate::location::Atom;

/// One call-graph arc: `(selfpc, count)` chained through `froms[]`.
#[derive(Debug)]
pub struct ArcNode {
    pub selfpc: u64,
    pub frompc_bucket: u32,
    pub count: AtomicU32,
    pub link: AtomicU32,
}

/// One entry in a variable's PC-range chain (§3 "Variable chain").
#[derive(Debug)]
pub struct VariableNode {
    pub loc_atom: Atom,
    pub addr: i64,
    pub size: i8,
    pub lower_bound: u64,
    pub upper_bound: u64,
    pub link: u32,
    pub sample_tail: AtomicU32,
}

/// One shadow-variable trigger (§3 "Function-site/shadow chain").
#[derive(Debug)]
pub struct ShadowNode {
    pub func_enter: u64,
    pub loc_atom: Atom,
    pub addr: AtomicU64,
    pub valid: std::sync::atomic::AtomicBool,
    pub link: u32,
}

/// One value-sample record (§3 "Value samples"), as read back for
/// serialization once the run is over (single-threaded at that point).
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleRecord {
    pub seq_id: u64,
    pub sampled: i32,
    pub val: u64,
    pub tid: u32,
    pub link: u32,
    pub var_pc: u64,
    pub cur_pc: u64,
}

/// The in-arena, concurrently-writable form of a sample record. Every
/// field is an atomic so the SIGPROF handler can publish a record without
/// any lock: the fields are stored plainly and `sample_tail`/`link`
/// publication happens last with `Release` ordering (§5 "a release fence
/// before publishing `sample_tail`").
#[derive(Debug)]
pub struct SampleSlot {
    pub seq_id: AtomicU64,
    pub sampled: std::sync::atomic::AtomicI32,
    pub val: AtomicU64,
    pub tid: AtomicU32,
    pub link: AtomicU32,
    pub var_pc: AtomicU64,
    pub cur_pc: AtomicU64,
}

impl SampleSlot {
    fn empty() -> Self {
        SampleSlot {
            seq_id: AtomicU64::new(0),
            sampled: std::sync::atomic::AtomicI32::new(0),
            val: AtomicU64::new(0),
            tid: AtomicU32::new(0),
            link: AtomicU32::new(0),
            var_pc: AtomicU64::new(0),
            cur_pc: AtomicU64::new(0),
        }
    }

    /// Publishes a fully-formed sample. Plain fields first, `link` last
    /// with `Release` so a reader that observes the new `sample_tail`
    /// (which points at this slot) is guaranteed to see every other field.
    pub fn publish(&self, seq_id: u64, sampled: i32, val: u64, tid: u32, var_pc: u64, cur_pc: u64, link: u32) {
        self.seq_id.store(seq_id, Ordering::Relaxed);
        self.sampled.store(sampled, Ordering::Relaxed);
        self.val.store(val, Ordering::Relaxed);
        self.tid.store(tid, Ordering::Relaxed);
        self.var_pc.store(var_pc, Ordering::Relaxed);
        self.cur_pc.store(cur_pc, Ordering::Relaxed);
        self.link.store(link, Ordering::Release);
    }

    pub fn load(&self) -> SampleRecord {
        SampleRecord {
            seq_id: self.seq_id.load(Ordering::Acquire),
            sampled: self.sampled.load(Ordering::Acquire),
            val: self.val.load(Ordering::Acquire),
            tid: self.tid.load(Ordering::Acquire),
            link: self.link.load(Ordering::Acquire),
            var_pc: self.var_pc.load(Ordering::Acquire),
            cur_pc: self.cur_pc.load(Ordering::Acquire),
        }
    }
}

/// The full set of arenas for one profiled process, sized once at
/// `monstartup` per the table in §4.F.
pub struct Arenas {
    pub window: TextWindow,

    /// One saturating 16-bit counter per `HISTFRACTION` bytes of text.
    pub kcount: Vec<AtomicU16>,

    /// Call-graph arc heads, one per `froms` bucket, plus the arc storage
    /// they chain through. `tos` grows only on a brand-new arc, which is
    /// rare relative to the hot lookup-and-increment path, so a `RwLock`
    /// lets concurrent `mcount` callers increment existing arcs under a
    /// shared read lock and only contend on first-sight insertion.
    pub froms: Vec<AtomicU32>,
    pub tos: RwLock<Vec<ArcNode>>,
    pub tolimit: usize,

    /// Variable-chain heads and storage.
    pub callsites: Vec<AtomicU32>,
    pub variables: Vec<VariableNode>,
    pub var_limit: usize,

    /// Shadow-chain heads and storage.
    pub funcsites: Vec<AtomicU32>,
    pub shadows: Vec<ShadowNode>,
    shadows_next: AtomicU32,

    /// Bump-allocated value-sample arena. `samples[0].link` is the cursor.
    /// Each slot is atomic so the SIGPROF handler can publish a record
    /// without a lock (§5): `alloc_sample` hands out each index exactly
    /// once, and `SampleSlot::publish` stores `link` last with `Release`
    /// ordering so a reader that observes the new tail sees every field.
    pub samples: Vec<SampleSlot>,
    sample_cursor: AtomicU32,
    pub sample_limit: usize,
}

const SHADOW_LIMIT: usize = 64;
pub const SAMPLE_LIMIT: usize = 2 * 1024 * 1024;
/// Default ceiling on the number of `variables[]` entries, independent of
/// `tolimit` (which bounds call-graph arcs, not variable records). §4.C
/// treats running out of this arena as fatal for variable sampling only.
pub const DEFAULT_VAR_LIMIT: usize = 64 * 1024;

impl Arenas {
    /// Allocates every arena per the sizing table in §4.F, using this
    /// crate's spec defaults for `var_limit`/`sample_limit`. This is what
    /// `monstartup` calls in production; tests that don't need the full
    /// 2 Mi-entry sample arena should use [`Arenas::with_limits`] instead.
    pub fn new(window: TextWindow) -> Self {
        Self::with_limits(window, DEFAULT_VAR_LIMIT, SAMPLE_LIMIT)
    }

    /// Allocates every arena per the sizing table in §4.F with explicit
    /// `var_limit`/`sample_limit`. The sample arena is **fully
    /// preallocated** to `sample_limit` slots up front, matching §5's "all
    /// memory needed at sample time is pre-allocated" -- the sample path
    /// (`Arenas::alloc_sample`/`publish_sample`) must never grow a `Vec`
    /// from signal-handler context. Variable and shadow storage start
    /// empty; the config loader (§4.C) pushes nodes into them up to
    /// `var_limit`/`shadowlimit` and records the running length.
    pub fn with_limits(window: TextWindow, var_limit: usize, sample_limit: usize) -> Self {
        let kcount_len = window.kcount_size() / std::mem::size_of::<u16>();
        let froms_len = window.froms_size() / std::mem::size_of::<u32>();
        let tolimit = window.tolimit();

        let kcount = (0..kcount_len).map(|_| AtomicU16::new(0)).collect();
        let froms = (0..froms_len).map(|_| AtomicU32::new(0)).collect();
        let callsites = (0..froms_len).map(|_| AtomicU32::new(0)).collect();
        let funcsites = (0..froms_len).map(|_| AtomicU32::new(0)).collect();

        let mut tos = Vec::with_capacity(tolimit + 1);
        tos.push(ArcNode {
            selfpc: 0,
            frompc_bucket: 0,
            count: AtomicU32::new(0),
            link: AtomicU32::new(0),
        });

        let mut shadows = Vec::with_capacity(SHADOW_LIMIT + 1);
        shadows.push(ShadowNode {
            func_enter: 0,
            loc_atom: Atom::Literal(0),
            addr: AtomicU64::new(0),
            valid: std::sync::atomic::AtomicBool::new(false),
            link: 0,
        });

        let samples = (0..sample_limit.max(1)).map(|_| SampleSlot::empty()).collect();

        Arenas {
            window,
            kcount,
            froms,
            tos: RwLock::new(tos),
            tolimit,
            callsites,
            variables: vec![VariableNode {
                loc_atom: Atom::Literal(0),
                addr: 0,
                size: 0,
                lower_bound: 0,
                upper_bound: 0,
                link: 0,
                sample_tail: AtomicU32::new(0),
            }],
            var_limit,
            funcsites,
            shadows,
            shadows_next: AtomicU32::new(1),
            samples,
            sample_cursor: AtomicU32::new(0),
            sample_limit: sample_limit.max(1),
        }
    }

    /// Saturating 16-bit histogram bump (§4.D.1). Tolerates lost increments
    /// under concurrent SIGPROF delivery on multiple threads (§5).
    pub fn bump_histogram(&self, index: usize) {
        if let Some(counter) = self.kcount.get(index) {
            let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                if v == u16::MAX {
                    None
                } else {
                    Some(v + 1)
                }
            });
        }
    }

    /// Finds or creates the arc `(from_bucket, selfpc)`, incrementing its
    /// count (§4.E). The common case (arc already seen) only takes a
    /// shared read lock; a brand-new arc briefly upgrades to a write lock
    /// to append. Not signal-safe against itself, but `mcount` is ordinary
    /// (non-signal-handler) code, so a short lock is acceptable -- SIGPROF
    /// racing `mcount` is rare and tolerated per §4.E.
    pub fn record_arc(&self, from_bucket: u32, selfpc: u64) {
        let head_idx = from_bucket as usize % self.froms.len().max(1);
        {
            let tos = self.tos.read().expect("tos lock poisoned");
            let mut idx = self.froms[head_idx].load(Ordering::Acquire);
            while idx != 0 {
                let node = &tos[idx as usize];
                if node.selfpc == selfpc && node.frompc_bucket == from_bucket {
                    node.count.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                idx = node.link.load(Ordering::Acquire);
            }
        }

        let mut tos = self.tos.write().expect("tos lock poisoned");
        // Re-scan under the write lock in case another thread inserted
        // the same arc while we were waiting for it.
        let mut idx = self.froms[head_idx].load(Ordering::Acquire);
        while idx != 0 {
            let node = &tos[idx as usize];
            if node.selfpc == selfpc && node.frompc_bucket == from_bucket {
                node.count.fetch_add(1, Ordering::Relaxed);
                return;
            }
            idx = node.link.load(Ordering::Acquire);
        }
        if tos.len() >= self.tolimit {
            // Arena exhausted: drop silently, matching §7 "arena exhaustion
            // at sample time".
            return;
        }
        let new_idx = tos.len() as u32;
        let prev_head = self.froms[head_idx].load(Ordering::Acquire);
        tos.push(ArcNode {
            selfpc,
            frompc_bucket: from_bucket,
            count: AtomicU32::new(1),
            link: AtomicU32::new(prev_head),
        });
        self.froms[head_idx].store(new_idx, Ordering::Release);
    }

    /// Pushes a new variable node, returning its arena index, or `None` if
    /// the arena is exhausted (§4.C "fatal for variable sampling").
    pub fn push_variable(&mut self, node: VariableNode) -> Option<u32> {
        if self.variables.len() >= self.var_limit {
            return None;
        }
        let idx = self.variables.len() as u32;
        self.variables.push(node);
        Some(idx)
    }

    pub fn push_shadow(&mut self, node: ShadowNode) -> Option<u32> {
        if self.shadows.len() >= SHADOW_LIMIT {
            return None;
        }
        let idx = self.shadows_next.fetch_add(1, Ordering::Relaxed);
        self.shadows.push(node);
        Some(idx)
    }

    /// Atomically bumps the sample cursor and returns the newly allocated
    /// index, or `None` if `sample_limit` has been reached (§4.D.4). Uses a
    /// CAS loop rather than an unconditional `fetch_add` so a racing bump
    /// past `sample_limit` never happens -- a plain `fetch_add` would let
    /// the cursor run past `sample_limit` under concurrent SIGPROF delivery
    /// on multiple threads, violating "samples[0].link <= samplelimit"
    /// (§8.4) even though every caller past the limit still gets `None`.
    pub fn alloc_sample(&self) -> Option<u32> {
        self.sample_cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                let next = cur + 1;
                ((next as usize) < self.sample_limit).then_some(next)
            })
            .ok()
            .map(|prev| prev + 1)
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_cursor.load(Ordering::Acquire)
    }

    /// Publishes sample `idx`, updating the producing variable's
    /// `sample_tail` to point at it. Safe to call from signal-handler
    /// context: no locking, and `alloc_sample` guarantees `idx` was handed
    /// to exactly one caller.
    #[allow(clippy::too_many_arguments)]
    pub fn publish_sample(
        &self,
        idx: u32,
        var_idx: u32,
        seq_id: u64,
        sampled: i32,
        val: u64,
        tid: u32,
        var_pc: u64,
        cur_pc: u64,
    ) {
        let tail = self.variables[var_idx as usize]
            .sample_tail
            .load(Ordering::Acquire);
        self.samples[idx as usize].publish(seq_id, sampled, val, tid, var_pc, cur_pc, tail);
        self.variables[var_idx as usize]
            .sample_tail
            .store(idx, Ordering::Release);
    }

    /// Reads back sample `idx` for offline serialization (single-threaded
    /// by the time the writer runs, since `mcleanup` has already disabled
    /// further ticks).
    pub fn read_sample(&self, idx: u32) -> SampleRecord {
        self.samples[idx as usize].load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashtable::TextWindow;

    #[test]
    fn histogram_saturates() {
        let w = TextWindow::new(0x1000, 0x2000, 2);
        let arenas = Arenas::new(w);
        for _ in 0..(u16::MAX as u32 + 10) {
            arenas.bump_histogram(0);
        }
        assert_eq!(arenas.kcount[0].load(Ordering::Relaxed), u16::MAX);
    }

    #[test]
    fn arc_recording_accumulates() {
        let w = TextWindow::new(0x1000, 0x2000, 2);
        let arenas = Arenas::new(w);
        arenas.record_arc(0, 0x1100);
        arenas.record_arc(0, 0x1100);
        arenas.record_arc(0, 0x1200);
        let head = arenas.froms[0].load(Ordering::Relaxed);
        assert_ne!(head, 0);
        let tos = arenas.tos.read().unwrap();
        let mut total = 0u32;
        let mut idx = head;
        while idx != 0 {
            let node = &tos[idx as usize];
            total += node.count.load(Ordering::Relaxed);
            idx = node.link.load(Ordering::Relaxed);
        }
        assert_eq!(total, 3);
    }

    #[test]
    fn sample_cursor_respects_limit() {
        let w = TextWindow::new(0x1000, 0x2000, 2);
        let arenas = Arenas::with_limits(w, DEFAULT_VAR_LIMIT, 2);
        assert_eq!(arenas.alloc_sample(), Some(1));
        assert_eq!(arenas.alloc_sample(), None);
    }
}
