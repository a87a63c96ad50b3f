//! Whole-module call graph and strongly-connected-component ordering.
//! `llvm-ir` has no `CallGraph` analysis of its own, so this builds one by
//! scanning every direct call site.

use std::collections::{HashMap, HashSet};

use llvm_ir::instruction::Call;
use llvm_ir::{Constant, Instruction, Operand, Terminator};

pub struct CallGraph {
    callees: HashMap<String, HashSet<String>>,
}

impl CallGraph {
    pub fn build(module: &llvm_ir::Module) -> Self {
        let mut callees: HashMap<String, HashSet<String>> = HashMap::new();
        for func in &module.functions {
            let entry = callees.entry(func.name.clone()).or_default();
            for bb in &func.basic_blocks {
                for instr in &bb.instrs {
                    if let Instruction::Call(call) = instr {
                        if let Some(name) = direct_callee(call) {
                            entry.insert(name);
                        }
                    }
                }
                if let Terminator::Invoke(invoke) = &bb.term {
                    if let Some(name) = direct_callee_operand(&invoke.function) {
                        entry.insert(name);
                    }
                }
            }
        }
        CallGraph { callees }
    }

    pub fn callees_of(&self, func: &str) -> impl Iterator<Item = &String> {
        self.callees.get(func).into_iter().flatten()
    }

    /// Tarjan SCCs, returned callee-before-caller (the order the historical
    /// pass's `scc_begin`/`scc_end` iteration relies on).
    pub fn sccs(&self, function_names: &[String]) -> Vec<Vec<String>> {
        let mut tarjan = Tarjan::new(self, function_names);
        for name in function_names {
            if !tarjan.indices.contains_key(name) {
                tarjan.strongconnect(name);
            }
        }
        tarjan.output
    }
}

fn direct_callee(call: &Call) -> Option<String> {
    match &call.function {
        either::Either::Right(op) => direct_callee_operand(op),
        either::Either::Left(_) => None,
    }
}

fn direct_callee_operand(op: &Operand) -> Option<String> {
    if let Operand::ConstantOperand(c) = op {
        if let Constant::GlobalReference { name, .. } = c.as_ref() {
            return Some(name.to_string().trim_start_matches('@').to_string());
        }
    }
    None
}

struct Tarjan<'a> {
    graph: &'a CallGraph,
    indices: HashMap<String, usize>,
    lowlink: HashMap<String, usize>,
    on_stack: HashSet<String>,
    stack: Vec<String>,
    counter: usize,
    output: Vec<Vec<String>>,
}

impl<'a> Tarjan<'a> {
    fn new(graph: &'a CallGraph, _names: &[String]) -> Self {
        Tarjan {
            graph,
            indices: HashMap::new(),
            lowlink: HashMap::new(),
            on_stack: HashSet::new(),
            stack: Vec::new(),
            counter: 0,
            output: Vec::new(),
        }
    }

    fn strongconnect(&mut self, v: &str) {
        self.indices.insert(v.to_string(), self.counter);
        self.lowlink.insert(v.to_string(), self.counter);
        self.counter += 1;
        self.stack.push(v.to_string());
        self.on_stack.insert(v.to_string());

        let callees: Vec<String> = self.graph.callees_of(v).cloned().collect();
        for w in callees {
            if !self.indices.contains_key(&w) {
                self.strongconnect(&w);
                let w_low = self.lowlink[&w];
                let v_low = self.lowlink[v];
                self.lowlink.insert(v.to_string(), v_low.min(w_low));
            } else if self.on_stack.contains(&w) {
                let w_idx = self.indices[&w];
                let v_low = self.lowlink[v];
                self.lowlink.insert(v.to_string(), v_low.min(w_idx));
            }
        }

        if self.lowlink[v] == self.indices[v] {
            let mut component = Vec::new();
            loop {
                let w = self.stack.pop().unwrap();
                self.on_stack.remove(&w);
                let is_v = w == v;
                component.push(w);
                if is_v {
                    break;
                }
            }
            self.output.push(component);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &str)]) -> CallGraph {
        let mut callees: HashMap<String, HashSet<String>> = HashMap::new();
        for (from, to) in edges {
            callees.entry(from.to_string()).or_default().insert(to.to_string());
            callees.entry(to.to_string()).or_default();
        }
        CallGraph { callees }
    }

    #[test]
    fn acyclic_graph_has_one_function_per_scc() {
        let g = graph(&[("main", "helper"), ("helper", "leaf")]);
        let names = vec!["main".to_string(), "helper".to_string(), "leaf".to_string()];
        let sccs = g.sccs(&names);
        assert!(sccs.iter().all(|c| c.len() == 1));
        let leaf_pos = sccs.iter().position(|c| c[0] == "leaf").unwrap();
        let main_pos = sccs.iter().position(|c| c[0] == "main").unwrap();
        assert!(leaf_pos < main_pos, "callee SCC should come before caller SCC");
    }

    #[test]
    fn mutual_recursion_collapses_into_one_scc() {
        let g = graph(&[("a", "b"), ("b", "a")]);
        let names = vec!["a".to_string(), "b".to_string()];
        let sccs = g.sccs(&names);
        assert_eq!(sccs.len(), 1);
        assert_eq!(sccs[0].len(), 2);
    }
}
