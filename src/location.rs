//! DWARF-2 location-expression evaluator (§4.A).
//!
//! Every function here is signal-safe: no allocation, no unbounded
//! recursion, no dynamic dispatch through shared state. Inputs are taken
//! by value or by const-borrowed slice so the evaluator can run inside the
//! SIGPROF handler.

use crate::context::RegisterSnapshot;

/// Sentinel recorded when a pointer dereference (`size < 0`) targets a null
/// pointer, matching the historical tool's `0xdeadcafe` marker.
pub const NULL_DEREF_SENTINEL: u64 = 0xdead_cafe;

/// One decoded DWARF-2 location atom. The config loader (§4.C) is
/// responsible for turning the textual `loc_atom` field of a config record
/// into one of these; the evaluator never parses text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Atom {
    /// `DW_OP_lit0 ..= DW_OP_lit31`, value already reduced to `atom - LIT0`.
    Literal(u8),
    /// `DW_OP_const{1,2,4,8}{u,s}` / `DW_OP_constu` / `DW_OP_consts`, value
    /// already decoded by the config parser into `addr`.
    Constant,
    /// `DW_OP_reg0 ..= DW_OP_reg31`.
    Register(u8),
    /// `DW_OP_breg0 ..= DW_OP_breg31`, offset carried in `addr`.
    BasedRegister(u8),
    /// `DW_OP_fbreg`: `regfile[RBP] + 16 + addr`.
    FrameBase,
    /// `DW_OP_addr`, absolute address requiring PIE relocation.
    Absolute,
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum EvalError {
    #[error("register index out of range")]
    RegisterOutOfRange,
    #[error("register not captured in this snapshot")]
    RegisterNotCaptured,
    #[error("based-register pointer below stack pointer guard")]
    BelowStackGuard,
    #[error("unsupported or unknown atom")]
    UnsupportedAtom,
    #[error("size field out of the 1..=8 byte range")]
    BadSize,
    #[error("memory read failed for a computed address")]
    ReadFault,
}

/// A memory reader abstraction so the evaluator can run both against a live
/// process image (read directly, in-process) and against a test fixture.
/// The signal handler's implementation is a bytewise copy of already-mapped
/// memory and cannot fail except by address-space bounds, which it treats
/// as "no value".
pub trait MemoryImage {
    /// Reads up to 8 bytes starting at `addr`; returns `None` if any part
    /// of the range is not known-readable.
    fn read_u64(&self, addr: u64, size: u8) -> Option<u64>;
}

/// Evaluates one location atom against a captured context, returning the
/// raw 64-bit value (already sign/zero handled per `size` by the caller if
/// `size < 0` dereference semantics apply -- see `evaluate_with_deref`).
pub fn evaluate(
    atom: Atom,
    addr: i64,
    size: i8,
    regs: &RegisterSnapshot,
    mem: &impl MemoryImage,
    load_address: u64,
) -> Result<u64, EvalError> {
    match atom {
        Atom::Literal(n) => Ok(n as u64),
        Atom::Constant => Ok(addr as u64),
        Atom::Register(r) => regs
            .get(r)
            .map(|v| v)
            .ok_or(EvalError::RegisterOutOfRange),
        Atom::BasedRegister(r) => {
            if !regs.is_valid(r) {
                return Err(EvalError::RegisterNotCaptured);
            }
            let base = regs.get(r).ok_or(EvalError::RegisterOutOfRange)?;
            let ptr = (base as i64).wrapping_add(addr) as u64;
            if ptr < regs.stack_pointer() {
                return Err(EvalError::BelowStackGuard);
            }
            let abs_size = effective_size(size)?;
            mem.read_u64(ptr, abs_size).ok_or(EvalError::ReadFault)
        }
        Atom::FrameBase => {
            let rbp = regs.frame_base().ok_or(EvalError::RegisterNotCaptured)?;
            let ptr = (rbp as i64).wrapping_add(16).wrapping_add(addr) as u64;
            let abs_size = effective_size(size)?;
            mem.read_u64(ptr, abs_size).ok_or(EvalError::ReadFault)
        }
        Atom::Absolute => {
            let ptr = (addr as u64).wrapping_add(load_address);
            let abs_size = effective_size(size)?;
            mem.read_u64(ptr, abs_size).ok_or(EvalError::ReadFault)
        }
    }
}

fn effective_size(size: i8) -> Result<u8, EvalError> {
    let abs = size.unsigned_abs();
    if abs == 0 || abs > 8 {
        return Err(EvalError::BadSize);
    }
    Ok(abs)
}

/// Full evaluation including the `size < 0` dereference-as-pointer rule:
/// the primary evaluation produces a pointer, which is re-read for
/// `-size` bytes; a null pointer yields the sentinel rather than failing.
pub fn evaluate_with_deref(
    atom: Atom,
    addr: i64,
    size: i8,
    regs: &RegisterSnapshot,
    mem: &impl MemoryImage,
    load_address: u64,
) -> Result<u64, EvalError> {
    if size >= 0 {
        return evaluate(atom, addr, size, regs, mem, load_address);
    }
    // The primary evaluation yields a pointer, so it always reads a full
    // machine word regardless of the (negative) size requested for the
    // eventual dereference.
    let ptr = evaluate(atom, addr, 8, regs, mem, load_address)?;
    if ptr == 0 {
        return Ok(NULL_DEREF_SENTINEL);
    }
    let deref_size = effective_size(size)?;
    mem.read_u64(ptr, deref_size).ok_or(EvalError::ReadFault)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RegisterSnapshot;

    struct FlatMemory(std::collections::HashMap<u64, u64>);

    impl MemoryImage for FlatMemory {
        fn read_u64(&self, addr: u64, size: u8) -> Option<u64> {
            let v = *self.0.get(&addr)?;
            let mask = if size >= 8 {
                u64::MAX
            } else {
                (1u64 << (size * 8)) - 1
            };
            Some(v & mask)
        }
    }

    #[test]
    fn literal_atom() {
        let regs = RegisterSnapshot::empty();
        let mem = FlatMemory(Default::default());
        let v = evaluate(Atom::Literal(5), 0, 4, &regs, &mem, 0).unwrap();
        assert_eq!(v, 5);
    }

    #[test]
    fn fbreg_worked_example() {
        // From the spec: RBP = 0x7fffffffe000, addr = -24, expect a read
        // at 0x7fffffffdff8.
        let mut regs = RegisterSnapshot::empty();
        regs.set_frame_base(0x7fffffffe000, 0x7fffffffe000);
        let mut map = std::collections::HashMap::new();
        map.insert(0x7fffffffdff8, 0xdead_beefu64);
        let mem = FlatMemory(map);
        let v = evaluate(Atom::FrameBase, -24, 4, &regs, &mem, 0).unwrap();
        assert_eq!(v, 0xdead_beef & 0xffff_ffff);
    }

    #[test]
    fn breg_below_stack_guard_fails() {
        let mut regs = RegisterSnapshot::empty();
        regs.set_register(crate::context::REG_RSP, 0x7fffffffe000, true);
        regs.set_stack_pointer(0x7fffffffe000);
        let mem = FlatMemory(Default::default());
        let err = evaluate(
            Atom::BasedRegister(crate::context::REG_RSP),
            -0x1000,
            8,
            &regs,
            &mem,
            0,
        )
        .unwrap_err();
        assert_eq!(err, EvalError::BelowStackGuard);
    }

    #[test]
    fn null_deref_yields_sentinel() {
        let mut regs = RegisterSnapshot::empty();
        regs.set_frame_base(0x1000, 0x1000);
        // regfile[RBP] + 16 + 0 == 0x1010 holds a null pointer.
        let mut map = std::collections::HashMap::new();
        map.insert(0x1010, 0u64);
        let mem = FlatMemory(map);
        let v = evaluate_with_deref(Atom::FrameBase, 0, -8, &regs, &mem, 0).unwrap();
        assert_eq!(v, NULL_DEREF_SENTINEL);
    }
}
