//! Call-graph arc recorder (§4.E), invoked from the function-prologue hook
//! (`mcount`). Not signal-safe relative to itself on the same thread, but
//! §4.E accepts that a signal racing `mcount` is rare and tolerable.

use crate::arena::Arenas;

/// Records one observed `caller -> callee` arc, creating it on first sight
/// and incrementing its count thereafter. `caller_pc` is bucketed through
/// the same `froms[]` geometry as the histogram and variable chains;
/// `callee_pc` (the historical `selfpc`) is stored verbatim as the arc's
/// second half of its identity.
pub fn record_call(arenas: &Arenas, caller_pc: u64, callee_pc: u64) {
    let bucket = arenas.window.bucket(caller_pc as usize);
    if bucket < 0 {
        return;
    }
    arenas.record_arc(bucket as u32, callee_pc);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashtable::TextWindow;

    #[test]
    fn out_of_range_caller_is_ignored() {
        let arenas = Arenas::new(TextWindow::new(0x4000000, 0x4001000, 2));
        record_call(&arenas, 0x3fff000, 0x4000100);
        let tos = arenas.tos.read().unwrap();
        assert_eq!(tos.len(), 1); // only the sentinel
    }

    #[test]
    fn in_range_caller_creates_and_accumulates() {
        let arenas = Arenas::new(TextWindow::new(0x4000000, 0x4001000, 2));
        record_call(&arenas, 0x4000100, 0x4000200);
        record_call(&arenas, 0x4000100, 0x4000200);
        let tos = arenas.tos.read().unwrap();
        assert_eq!(tos.len(), 2);
        assert_eq!(tos[1].count.load(std::sync::atomic::Ordering::Relaxed), 2);
    }
}
