//! Writes the two schema side-channels (`schema.txt`, `src2basicblock.txt`)
//! and the runtime variable-location config the sampling runtime's config
//! loader reads at startup.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::io::Write;
use std::path::{Path, PathBuf};

use llvm_ir::{Name, Terminator};

use crate::cfg::Cfg;
use crate::discover::FoundVar;

/// One resolved runtime location, joined in from `--locations` by the key
/// `file:line:name`. Producing this table from a linked binary's DWARF is
/// outside this pass's job -- see DESIGN.md "PC/location lowering".
pub struct LocationTable(HashMap<String, String>);

impl LocationTable {
    pub fn load(path: Option<&Path>) -> std::io::Result<Self> {
        let mut map = HashMap::new();
        if let Some(path) = path {
            let text = std::fs::read_to_string(path)?;
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    map.insert(key.trim().to_string(), value.trim().to_string());
                }
            }
        }
        Ok(LocationTable(map))
    }

    fn lookup(&self, file: &str, line: u32, name: &str) -> Option<&str> {
        self.0.get(&format!("{file}:{line}:{name}")).map(|s| s.as_str())
    }
}

pub struct Emitter {
    out_dir: PathBuf,
    extensions: Vec<String>,
    schema: Vec<String>,
    src2bb: Vec<String>,
    config_lines: Vec<String>,
    emitted: usize,
    skipped_no_location: usize,
}

impl Emitter {
    pub fn new(out_dir: PathBuf, extensions: Vec<String>) -> Self {
        Emitter {
            out_dir,
            extensions,
            schema: Vec::new(),
            src2bb: Vec::new(),
            config_lines: Vec::new(),
            emitted: 0,
            skipped_no_location: 0,
        }
    }

    fn suffix_allowed(&self, filename: &str) -> bool {
        self.extensions.iter().any(|ext| filename.ends_with(ext.as_str()))
    }

    /// Records one function's discovered variables as `schema` lines and,
    /// when `locations` has a match, a runtime config line.
    pub fn record_function_vars(&mut self, func_name: &str, vars: &HashMap<String, FoundVar>, locations: &LocationTable) {
        let demangled = crate::demangle::demangle(func_name);
        for found in vars.values() {
            let v = &found.debug;
            if !self.suffix_allowed(&v.file) {
                continue;
            }
            let tags: Vec<&str> = found.tags.iter().map(|s| s.as_str()).collect();
            self.schema.push(format!(
                "{} {} {} {} {} {} {}",
                v.directory,
                v.file,
                demangled,
                v.line,
                v.name,
                v.type_name,
                tags.join("|"),
            ));

            match locations.lookup(&v.file, v.line, &v.name) {
                Some(loc) => {
                    self.config_lines.push(loc.to_string());
                    self.emitted += 1;
                }
                None => self.skipped_no_location += 1,
            }
        }
    }

    pub fn record_globals(&mut self, module: &llvm_ir::Module, global_names: &HashSet<String>) {
        for gv in &module.global_vars {
            if !global_names.contains(gv.name.as_ref()) {
                continue;
            }
            self.schema.push(format!(
                "{} {} #global {} {} uintptr globalvar",
                "", "", 0, gv.name
            ));
        }
    }

    /// Records per-basic-block source ranges and predecessor/successor
    /// labels for every block of `func`, deduplicating against `recorded`.
    pub fn record_blocks(&mut self, func: &llvm_ir::Function, recorded: &mut HashSet<String>) {
        let cfg = Cfg::build(func);
        for bb in &func.basic_blocks {
            let label = block_label(&func.name, &bb.name);
            if !recorded.insert(label.clone()) {
                continue;
            }
            let (begin, end) = source_range(bb);
            let mut line = format!("tag={label},begin={begin},end={end};");
            if let Some(idx) = cfg.block_index(&bb.name) {
                for seq in predecessor_then_self_then_successor_labels(func, &cfg, idx) {
                    let _ = write!(line, "{seq},");
                }
            }
            self.src2bb.push(line);
        }
    }

    pub fn record_function_range(&mut self, func: &llvm_ir::Function, filename: &str) {
        let (begin, end) = func
            .basic_blocks
            .iter()
            .fold((i64::MAX, i64::MIN), |(lo, hi), bb| {
                let (b, e) = source_range(bb);
                (lo.min(b as i64), hi.max(e as i64))
            });
        let begin = if begin == i64::MAX { -1 } else { begin };
        let end = if end == i64::MIN { -1 } else { end };
        self.src2bb.push(format!(
            "function={},begin={},end={},filename={}",
            crate::demangle::demangle(&func.name),
            begin,
            end,
            filename,
        ));
    }

    pub fn finish(self, progname: &str) -> std::io::Result<EmitSummary> {
        std::fs::create_dir_all(&self.out_dir)?;

        let schema_path = self.out_dir.join("schema.txt");
        let mut f = std::fs::File::create(&schema_path)?;
        for line in &self.schema {
            writeln!(f, "{line}")?;
        }

        let bb_path = self.out_dir.join("src2basicblock.txt");
        let mut f = std::fs::File::create(&bb_path)?;
        for line in &self.src2bb {
            writeln!(f, "{line}")?;
        }

        let config_path = self.out_dir.join("info.txt");
        let mut f = std::fs::File::create(&config_path)?;
        writeln!(f, "\"{progname}\"")?;
        for line in &self.config_lines {
            writeln!(f, "{line}")?;
        }

        Ok(EmitSummary {
            schema_path,
            bb_path,
            config_path,
            variables_emitted: self.emitted,
            variables_skipped_no_location: self.skipped_no_location,
        })
    }
}

pub struct EmitSummary {
    pub schema_path: PathBuf,
    pub bb_path: PathBuf,
    pub config_path: PathBuf,
    pub variables_emitted: usize,
    pub variables_skipped_no_location: usize,
}

fn block_label(func_name: &str, bb_name: &Name) -> String {
    format!("{func_name}#{bb_name}")
}

fn source_range(bb: &llvm_ir::BasicBlock) -> (u32, u32) {
    let mut begin = i64::MAX;
    let mut end = i64::MIN;
    for instr in &bb.instrs {
        if is_dbg_intrinsic(instr) {
            continue;
        }
        if let Some(loc) = debugloc_of(instr) {
            if loc.line == 0 {
                continue;
            }
            begin = begin.min(loc.line as i64);
            end = end.max(loc.line as i64);
        }
    }
    if begin == i64::MAX {
        (0, 0)
    } else {
        (begin as u32, end as u32)
    }
}

fn is_dbg_intrinsic(instr: &llvm_ir::Instruction) -> bool {
    if let llvm_ir::Instruction::Call(call) = instr {
        if let either::Either::Right(llvm_ir::Operand::ConstantOperand(c)) = &call.function {
            if let llvm_ir::Constant::GlobalReference { name, .. } = c.as_ref() {
                return name.to_string().starts_with("llvm.dbg.");
            }
        }
    }
    false
}

fn debugloc_of(instr: &llvm_ir::Instruction) -> Option<&llvm_ir::debugloc::DebugLoc> {
    use llvm_ir::Instruction::*;
    match instr {
        Load(i) => i.debugloc.as_ref(),
        Store(i) => i.debugloc.as_ref(),
        GetElementPtr(i) => i.debugloc.as_ref(),
        Call(i) => i.debugloc.as_ref(),
        ICmp(i) => i.debugloc.as_ref(),
        FCmp(i) => i.debugloc.as_ref(),
        Add(i) => i.debugloc.as_ref(),
        Sub(i) => i.debugloc.as_ref(),
        Mul(i) => i.debugloc.as_ref(),
        Phi(i) => i.debugloc.as_ref(),
        Alloca(i) => i.debugloc.as_ref(),
        _ => None,
    }
}

fn predecessor_then_self_then_successor_labels(func: &llvm_ir::Function, cfg: &Cfg, idx: usize) -> Vec<String> {
    // Rebuilt from the function directly rather than threading pred/succ
    // index vectors through `Cfg`'s private fields.
    let mut labels = Vec::new();
    for bb in &func.basic_blocks {
        if successors_contain(&bb.term, &func.basic_blocks[idx].name) {
            labels.push(block_label(&func.name, &bb.name));
        }
    }
    labels.push(block_label(&func.name, &func.basic_blocks[idx].name));
    for dest in successors(&func.basic_blocks[idx].term) {
        labels.push(block_label(&func.name, &dest));
    }
    let _ = cfg;
    labels
}

fn successors_contain(term: &Terminator, target: &Name) -> bool {
    successors(term).iter().any(|n| n == target)
}

fn successors(term: &Terminator) -> Vec<Name> {
    match term {
        Terminator::Br(b) => vec![b.dest.clone()],
        Terminator::CondBr(b) => vec![b.true_dest.clone(), b.false_dest.clone()],
        Terminator::Switch(s) => {
            let mut v: Vec<Name> = s.dests.iter().map(|(_, n)| n.clone()).collect();
            v.push(s.default_dest.clone());
            v
        }
        Terminator::IndirectBr(b) => b.possible_dests.clone(),
        Terminator::Invoke(i) => vec![i.return_label.clone(), i.exception_label.clone()],
        _ => Vec::new(),
    }
}
