//! Taint-seed driven variable discovery (the analysis itself, not its
//! call-graph scheduling -- see `main.rs` for the SCC/worklist driver).

use std::collections::{BTreeSet, HashMap, HashSet};

use llvm_ir::instruction::{Call, GetElementPtr, Load};
use llvm_ir::{Constant, Function, Instruction, Name, Operand, Terminator, Type};

use crate::cfg::Cfg;
use crate::metadata::{DebugInfo, DebugVariable};
use crate::taint::TaintSeeds;

pub struct FoundVar {
    pub debug: DebugVariable,
    pub tags: BTreeSet<String>,
}

pub struct FunctionResult {
    pub vars: HashMap<String, FoundVar>,
    pub globals: HashSet<String>,
}

const MAX_DEPTH: u32 = 8;

/// `checkOnMVAndEGV`: does this function touch an externally-linked global
/// or a class-member field whose name matches a taint seed?
pub fn is_seed_function(func: &Function, module: &llvm_ir::Module, taint: &TaintSeeds, debug: &DebugInfo) -> bool {
    let externals: HashSet<&str> = module
        .global_vars
        .iter()
        .filter(|g| matches!(g.linkage, llvm_ir::module::Linkage::External))
        .map(|g| g.name.as_ref())
        .collect();

    for bb in &func.basic_blocks {
        for instr in &bb.instrs {
            match instr {
                Instruction::Load(Load { address, .. }) => {
                    if let Some(name) = global_ref_name(address) {
                        if externals.contains(name.as_str()) && taint.matches(&name) {
                            return true;
                        }
                    }
                }
                Instruction::GetElementPtr(gep) => {
                    if gep.indices.len() < 2 {
                        continue;
                    }
                    if let Some(struct_name) = base_struct_name(gep) {
                        if let Some(index) = last_constant_index(gep) {
                            if let Some(field) = debug.class_field(&struct_name, index) {
                                if taint.matches(&field.name) {
                                    return true;
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
    false
}

/// `collectOnLoop`: canonical induction variables, add/sub/mul/div operands
/// paired with a constant, and loop-carried PHIs.
pub fn collect_on_loop(func: &Function, debug: &DebugInfo, out: &mut FunctionResult) {
    let cfg = Cfg::build(func);
    let name_to_bb: HashMap<&Name, &llvm_ir::BasicBlock> = func.basic_blocks.iter().map(|b| (&b.name, b)).collect();

    for nat_loop in cfg.natural_loops() {
        for name in &nat_loop.blocks {
            let Some(bb) = name_to_bb.get(name) else { continue };
            for instr in &bb.instrs {
                if let Instruction::Phi(phi) = instr {
                    let is_induction = phi.incoming_values.iter().any(|(op, _)| {
                        matches!(op, Operand::LocalOperand { name: n, .. } if defines_binop_on(func, n, &Name::Name(Box::new(phi_local_name(phi)))))
                    });
                    let has_const_incoming = phi.incoming_values.iter().any(|(op, _)| matches!(op, Operand::ConstantOperand(_)));
                    if is_induction || has_const_incoming {
                        extract_var_metadata(&Operand::LocalOperand { name: phi.dest.clone(), ty: phi.to_type.clone() }, func, debug, "loop", out);
                    }
                }
                if let Some((target, _const_operand)) = arith_with_constant(instr) {
                    extract_var_metadata(&target, func, debug, "loop", out);
                }
            }
        }
    }
}

/// `collectOnMultiple`: branch-gating conditions on branches whose
/// successors themselves branch/call/invoke, plus every call argument.
pub fn collect_on_multiple(func: &Function, debug: &DebugInfo, out: &mut FunctionResult) {
    let successors_by_name: HashMap<&Name, &llvm_ir::BasicBlock> = func.basic_blocks.iter().map(|b| (&b.name, b)).collect();

    for bb in &func.basic_blocks {
        if let Terminator::CondBr(condbr) = &bb.term {
            if branch_needs_check(condbr, &successors_by_name) {
                extract_var_metadata(&condbr.condition, func, debug, "cond", out);
            }
        }
        for instr in &bb.instrs {
            if let Instruction::Call(call) = instr {
                for (arg, _) in &call.arguments {
                    extract_var_metadata(arg, func, debug, "arg", out);
                }
            }
        }
    }
}

fn branch_needs_check(condbr: &llvm_ir::terminator::CondBr, blocks: &HashMap<&Name, &llvm_ir::BasicBlock>) -> bool {
    for dest in [&condbr.true_dest, &condbr.false_dest] {
        let Some(bb) = blocks.get(dest) else { continue };
        let branches_further = matches!(bb.term, Terminator::Br(_) | Terminator::CondBr(_));
        let calls = bb.instrs.iter().any(|i| matches!(i, Instruction::Call(_)));
        if branches_further || calls {
            return true;
        }
    }
    false
}

/// Walks operands up to `MAX_DEPTH`, resolves each leaf to its declared
/// debug variable, and records (or tags) it in `out`.
fn extract_var_metadata(root: &Operand, func: &Function, debug: &DebugInfo, tag: &str, out: &mut FunctionResult) {
    let def_map = build_def_map(func);
    let mut collected = HashSet::new();
    collect_operands(root, &def_map, 0, &mut collected, &mut out.globals);

    for ssa in collected {
        let Some(var) = debug.variable_for_ssa(&ssa) else { continue };
        if var.name == "this" {
            continue;
        }
        out.vars
            .entry(ssa)
            .and_modify(|v| {
                v.tags.insert(tag.to_string());
            })
            .or_insert_with(|| {
                let mut tags = BTreeSet::new();
                tags.insert(tag.to_string());
                FoundVar { debug: var.clone(), tags }
            });
    }
}

fn collect_operands(op: &Operand, def_map: &HashMap<Name, &Instruction>, depth: u32, out: &mut HashSet<String>, globals: &mut HashSet<String>) {
    if depth >= MAX_DEPTH {
        return;
    }
    match op {
        Operand::LocalOperand { name, .. } => {
            if let Some(instr) = def_map.get(name) {
                for sub in instruction_operands(instr) {
                    collect_operands(&sub, def_map, depth + 1, out, globals);
                }
            }
            out.insert(format!("%{name}"));
        }
        Operand::ConstantOperand(c) => {
            if let Constant::GlobalReference { name, .. } = c.as_ref() {
                globals.insert(name.to_string());
            }
        }
        Operand::MetadataOperand => {}
    }
}

fn instruction_operands(instr: &Instruction) -> Vec<Operand> {
    use Instruction::*;
    match instr {
        Load(i) => vec![i.address.clone()],
        Store(i) => vec![i.address.clone(), i.value.clone()],
        GetElementPtr(i) => {
            let mut v = vec![i.address.clone()];
            v.extend(i.indices.iter().cloned());
            v
        }
        ICmp(i) => vec![i.operand0.clone(), i.operand1.clone()],
        FCmp(i) => vec![i.operand0.clone(), i.operand1.clone()],
        Select(i) => vec![i.condition.clone(), i.true_value.clone(), i.false_value.clone()],
        Add(i) => vec![i.operand0.clone(), i.operand1.clone()],
        Sub(i) => vec![i.operand0.clone(), i.operand1.clone()],
        Mul(i) => vec![i.operand0.clone(), i.operand1.clone()],
        UDiv(i) => vec![i.operand0.clone(), i.operand1.clone()],
        SDiv(i) => vec![i.operand0.clone(), i.operand1.clone()],
        Call(Call { arguments, .. }) => arguments.iter().map(|(op, _)| op.clone()).collect(),
        Phi(i) => i.incoming_values.iter().map(|(op, _)| op.clone()).collect(),
        Trunc(i) => vec![i.operand.clone()],
        ZExt(i) => vec![i.operand.clone()],
        SExt(i) => vec![i.operand.clone()],
        BitCast(i) => vec![i.operand.clone()],
        _ => Vec::new(),
    }
}

fn build_def_map(func: &Function) -> HashMap<Name, &Instruction> {
    let mut map = HashMap::new();
    for bb in &func.basic_blocks {
        for instr in &bb.instrs {
            if let Some(name) = result_name(instr) {
                map.insert(name.clone(), instr);
            }
        }
    }
    map
}

fn result_name(instr: &Instruction) -> Option<&Name> {
    use Instruction::*;
    match instr {
        Load(i) => Some(&i.dest),
        GetElementPtr(i) => Some(&i.dest),
        ICmp(i) => Some(&i.dest),
        FCmp(i) => Some(&i.dest),
        Select(i) => Some(&i.dest),
        Add(i) => Some(&i.dest),
        Sub(i) => Some(&i.dest),
        Mul(i) => Some(&i.dest),
        UDiv(i) => Some(&i.dest),
        SDiv(i) => Some(&i.dest),
        Phi(i) => Some(&i.dest),
        Alloca(i) => Some(&i.dest),
        Trunc(i) => Some(&i.dest),
        ZExt(i) => Some(&i.dest),
        SExt(i) => Some(&i.dest),
        BitCast(i) => Some(&i.dest),
        Call(Call { dest: Some(d), .. }) => Some(d),
        _ => None,
    }
}

fn arith_with_constant(instr: &Instruction) -> Option<(Operand, Operand)> {
    use Instruction::*;
    let (op0, op1) = match instr {
        Add(i) => (i.operand0.clone(), i.operand1.clone()),
        Sub(i) => (i.operand0.clone(), i.operand1.clone()),
        Mul(i) => (i.operand0.clone(), i.operand1.clone()),
        UDiv(i) => (i.operand0.clone(), i.operand1.clone()),
        SDiv(i) => (i.operand0.clone(), i.operand1.clone()),
        _ => return None,
    };
    if matches!(op1, Operand::ConstantOperand(_)) {
        Some((op0, op1))
    } else {
        None
    }
}

fn defines_binop_on(func: &Function, candidate: &Name, _phi_name: &Name) -> bool {
    let def_map = build_def_map(func);
    matches!(
        def_map.get(candidate),
        Some(Instruction::Add(_) | Instruction::Sub(_) | Instruction::Mul(_) | Instruction::UDiv(_) | Instruction::SDiv(_))
    )
}

fn phi_local_name(phi: &llvm_ir::instruction::Phi) -> String {
    phi.dest.to_string()
}

fn global_ref_name(op: &Operand) -> Option<String> {
    if let Operand::ConstantOperand(c) = op {
        if let Constant::GlobalReference { name, .. } = c.as_ref() {
            return Some(name.to_string());
        }
    }
    None
}

fn base_struct_name(gep: &GetElementPtr) -> Option<String> {
    if let Operand::LocalOperand { ty, .. } = &gep.address {
        if let Type::PointerType { pointee_type, .. } = ty.as_ref() {
            if let Type::NamedStructType { name } = pointee_type.as_ref() {
                return Some(name.clone());
            }
        }
    }
    None
}

fn last_constant_index(gep: &GetElementPtr) -> Option<usize> {
    gep.indices.get(1).and_then(|op| {
        if let Operand::ConstantOperand(c) = op {
            if let Constant::Int { value, .. } = c.as_ref() {
                return Some(*value as usize);
            }
        }
        None
    })
}

impl Default for FunctionResult {
    fn default() -> Self {
        FunctionResult {
            vars: HashMap::new(),
            globals: HashSet::new(),
        }
    }
}
