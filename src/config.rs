//! Startup config loader (§4.C).
//!
//! Parses the meta-file at a configured path: the first non-comment line
//! must be the running process' short name, or the whole file is rejected
//! and variable sampling stays disabled (histogram/arc profiling still
//! works -- see §7). Every subsequent line is a variable record:
//!
//! ```text
//! <from-pc>:<to-pc>:<loc-atom>:<addr-or-offset>:<size>
//! ```

use std::io::BufRead;
use std::path::Path;

use crate::arena::{Arenas, ShadowNode, VariableNode};
use crate::error::{ProfError, Result};
use crate::location::Atom;

/// One decoded line of the variable-tracking config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Record {
    from: u64,
    to: u64,
    atom: Atom,
    addr: i64,
    size: i8,
}

/// Tracks the previous record so consecutive lines with an identical
/// `(loc_atom, addr)` and a touching PC range coalesce into one
/// `variables[]` entry rather than one per line (§4.C "Coalesce").
#[derive(Default)]
struct Coalescer {
    prev: Option<(Atom, i64, u32)>,
}

impl Coalescer {
    fn reset(&mut self) {
        self.prev = None;
    }
}

/// Loads `path` into `arenas`. Returns `Ok(false)` (not an error) when the
/// program-name header doesn't match `progname`, matching §4.C's "loads
/// nothing" behaviour -- the caller should treat that as "variable
/// sampling disabled" rather than a hard failure.
pub fn load(path: &Path, progname: &str, arenas: &mut Arenas) -> Result<bool> {
    let file = std::fs::File::open(path).map_err(|_| ProfError::ConfigMissing(path.to_path_buf()))?;
    let mut lines = std::io::BufReader::new(file).lines();

    let header = loop {
        match lines.next() {
            Some(Ok(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    continue;
                }
                break trimmed.to_string();
            }
            Some(Err(e)) => return Err(ProfError::Io(e)),
            None => return Ok(false),
        }
    };

    let header_name = header.trim_matches('"');
    if header_name != progname {
        return Err(ProfError::ProgramNameMismatch {
            expected: header_name.to_string(),
            actual: progname.to_string(),
        });
    }

    let mut coalescer = Coalescer::default();
    for (lineno, line) in lines.enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) => return Err(ProfError::Io(e)),
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with('#') {
            coalescer.reset();
            continue;
        }
        match parse_record(trimmed) {
            Some(record) => {
                if let Err(e) = apply_record(arenas, &mut coalescer, record) {
                    warn!("variable config line {} exhausted an arena: {}", lineno + 2, e);
                }
            }
            None => {
                warn!("malformed variable config line {}: {:?}", lineno + 2, trimmed);
            }
        }
    }

    Ok(true)
}

fn parse_record(line: &str) -> Option<Record> {
    let mut fields = line.splitn(5, ':');
    let from = u64::from_str_radix(strip_0x(fields.next()?), 16).ok()?;
    let to = u64::from_str_radix(strip_0x(fields.next()?), 16).ok()?;
    let atom_raw: u8 = fields.next()?.trim().parse().ok()?;
    let addr: i64 = fields.next()?.trim().parse().ok()?;
    let size: i8 = fields.next()?.trim().parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    let atom = decode_atom(atom_raw)?;
    Some(Record {
        from,
        to,
        atom,
        addr,
        size,
    })
}

fn strip_0x(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix("0x").unwrap_or(s)
}

/// Maps the textual DWARF opcode number onto our reduced `Atom` enum
/// (§4.A). `LIT0..LIT31` reduce the literal value into the atom itself per
/// the spec's `value = atom - LIT0` rule, so the decoded `addr` for a
/// literal is recovered from the opcode, not the config's `addr` field.
fn decode_atom(raw: u8) -> Option<Atom> {
    const DW_OP_ADDR: u8 = 0x03;
    const DW_OP_FBREG: u8 = 0x91;
    const DW_OP_BREG0: u8 = 0x70;
    const DW_OP_BREG31: u8 = 0x8f;
    const DW_OP_REG0: u8 = 0x50;
    const DW_OP_REG31: u8 = 0x6f;
    const DW_OP_LIT0: u8 = 0x30;
    const DW_OP_LIT31: u8 = 0x4f;
    const DW_OP_CONST_START: u8 = 0x08; // const1u
    const DW_OP_CONST_END: u8 = 0x13; // consts

    match raw {
        DW_OP_ADDR => Some(Atom::Absolute),
        DW_OP_FBREG => Some(Atom::FrameBase),
        r if (DW_OP_BREG0..=DW_OP_BREG31).contains(&r) => Some(Atom::BasedRegister(r - DW_OP_BREG0)),
        r if (DW_OP_REG0..=DW_OP_REG31).contains(&r) => Some(Atom::Register(r - DW_OP_REG0)),
        r if (DW_OP_LIT0..=DW_OP_LIT31).contains(&r) => Some(Atom::Literal(r - DW_OP_LIT0)),
        r if (DW_OP_CONST_START..=DW_OP_CONST_END).contains(&r) => Some(Atom::Constant),
        _ => None,
    }
}

/// Pushes (or coalesces) one record into the variable or shadow chain.
/// `size == 0` records a shadow entry on `funcsites[bucket(from)]` instead
/// of a variable on `callsites`, per §4.C.
fn apply_record(arenas: &mut Arenas, coalescer: &mut Coalescer, record: Record) -> Result<()> {
    if record.size == 0 {
        let bucket = arenas.window.bucket(record.from as usize);
        if bucket < 0 {
            return Ok(());
        }
        let bucket = bucket as usize % arenas.funcsites.len().max(1);
        let prev_head = arenas.funcsites[bucket].load(std::sync::atomic::Ordering::Relaxed);
        let idx = arenas
            .push_shadow(ShadowNode {
                func_enter: record.from,
                loc_atom: record.atom,
                addr: std::sync::atomic::AtomicU64::new(record.addr as u64),
                valid: std::sync::atomic::AtomicBool::new(false),
                link: prev_head,
            })
            .ok_or(ProfError::ArenaExhausted { limit: 64 })?;
        arenas.funcsites[bucket].store(idx, std::sync::atomic::Ordering::Relaxed);
        return Ok(());
    }

    let lower = record.from;
    let upper = record.to;
    let stride = arenas.window.hash_fraction * std::mem::size_of::<usize>();
    let from_bucket = arenas.window.bucket(record.from as usize);
    let to_bucket = arenas.window.bucket(record.to as usize);
    if from_bucket < 0 && to_bucket < 0 {
        return Ok(());
    }

    let first = if from_bucket >= 0 { record.from as usize } else { arenas.window.lowpc };
    let last = if to_bucket >= 0 { record.to as usize } else { arenas.window.highpc - 1 };

    let mut pc = first;
    let mut shared_idx: Option<u32> = None;
    while pc <= last {
        let bucket = arenas.window.bucket(pc);
        if bucket >= 0 {
            let bucket = bucket as usize;
            let prev_head = arenas.callsites[bucket].load(std::sync::atomic::Ordering::Relaxed);

            let reuse = shared_idx.filter(|_| coalescer.prev == Some((record.atom, record.addr, prev_head)));

            let idx = if let Some(idx) = reuse {
                idx
            } else {
                let idx = arenas
                    .push_variable(VariableNode {
                        loc_atom: record.atom,
                        addr: record.addr,
                        size: record.size,
                        lower_bound: lower,
                        upper_bound: upper,
                        link: prev_head,
                        sample_tail: std::sync::atomic::AtomicU32::new(0),
                    })
                    .ok_or(ProfError::ArenaExhausted {
                        limit: arenas.var_limit,
                    })?;
                shared_idx = Some(idx);
                coalescer.prev = Some((record.atom, record.addr, prev_head));
                idx
            };

            arenas.callsites[bucket].store(idx, std::sync::atomic::Ordering::Relaxed);
        }
        match pc.checked_add(stride.max(1)) {
            Some(next) => pc = next,
            None => break,
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashtable::TextWindow;
    use std::io::Write;

    fn window() -> TextWindow {
        TextWindow::new(0x4000000, 0x4001000, crate::hashtable::HASHFRACTION)
    }

    #[test]
    fn rejects_mismatched_progname() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("info.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "\"someother\"").unwrap();
        let mut arenas = Arenas::new(window());
        let err = load(&path, "myprog", &mut arenas).unwrap_err();
        assert!(matches!(err, ProfError::ProgramNameMismatch { .. }));
    }

    #[test]
    fn loads_fbreg_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("info.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "\"myprog\"").unwrap();
        writeln!(f, "0x4000500:0x4000520:145:-24:4").unwrap();
        let mut arenas = Arenas::new(window());
        let ok = load(&path, "myprog", &mut arenas).unwrap();
        assert!(ok);
        let bucket = arenas.window.bucket(0x400050c);
        assert!(bucket >= 0);
        let head = arenas.callsites[bucket as usize].load(std::sync::atomic::Ordering::Relaxed);
        assert_ne!(head, 0);
        assert_eq!(arenas.variables[head as usize].loc_atom, Atom::FrameBase);
    }

    #[test]
    fn coalesces_touching_identical_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("info.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "\"myprog\"").unwrap();
        writeln!(f, "0x4000500:0x4000510:145:-8:4").unwrap();
        writeln!(f, "0x4000510:0x4000520:145:-8:4").unwrap();
        let mut arenas = Arenas::new(window());
        load(&path, "myprog", &mut arenas).unwrap();
        // Only one real variable entry should have been allocated (index 1);
        // index 0 is the reserved sentinel.
        assert_eq!(arenas.variables.len(), 2);
    }

    #[test]
    fn shadow_record_on_zero_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("info.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "\"myprog\"").unwrap();
        writeln!(f, "0x4000500:0x4000500:80:0:0").unwrap();
        let mut arenas = Arenas::new(window());
        load(&path, "myprog", &mut arenas).unwrap();
        let bucket = arenas.window.bucket(0x4000500) as usize;
        let head = arenas.funcsites[bucket].load(std::sync::atomic::Ordering::Relaxed);
        assert_ne!(head, 0);
    }

    #[test]
    fn malformed_line_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("info.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "\"myprog\"").unwrap();
        writeln!(f, "not:a:valid:line").unwrap();
        writeln!(f, "0x4000500:0x4000520:145:-24:4").unwrap();
        let mut arenas = Arenas::new(window());
        let ok = load(&path, "myprog", &mut arenas).unwrap();
        assert!(ok);
    }
}
