//! Minimal control-flow analysis over one function: successor edges,
//! dominators, and natural loops. `llvm-ir` hands us basic blocks and
//! terminators but no `LoopInfo` equivalent, so this is the hand-rolled
//! stand-in the discovery pass needs for its loop collector.

use std::collections::{HashMap, HashSet};

use llvm_ir::{Name, Terminator};

pub struct Cfg {
    pub order: Vec<Name>,
    index_of: HashMap<Name, usize>,
    succ: Vec<Vec<usize>>,
    pred: Vec<Vec<usize>>,
    idom: Vec<usize>,
}

pub struct NaturalLoop {
    pub header: Name,
    pub blocks: HashSet<Name>,
}

impl Cfg {
    pub fn build(func: &llvm_ir::Function) -> Self {
        let order: Vec<Name> = func.basic_blocks.iter().map(|bb| bb.name.clone()).collect();
        let index_of: HashMap<Name, usize> = order.iter().cloned().enumerate().map(|(i, n)| (n, i)).collect();

        let mut succ = vec![Vec::new(); order.len()];
        let mut pred = vec![Vec::new(); order.len()];
        for (i, bb) in func.basic_blocks.iter().enumerate() {
            for dest in successors_of(&bb.term) {
                if let Some(&j) = index_of.get(&dest) {
                    succ[i].push(j);
                    pred[j].push(i);
                }
            }
        }

        let rpo = reverse_postorder(&succ, 0);
        let idom = compute_idom(&pred, &rpo);

        Cfg {
            order,
            index_of,
            succ,
            pred,
            idom,
        }
    }

    fn dominates(&self, a: usize, mut b: usize) -> bool {
        loop {
            if a == b {
                return true;
            }
            if b == self.idom[b] {
                return a == b;
            }
            b = self.idom[b];
        }
    }

    /// Natural loops, one per distinct header, merging back edges that
    /// share a header.
    pub fn natural_loops(&self) -> Vec<NaturalLoop> {
        let mut by_header: HashMap<usize, HashSet<usize>> = HashMap::new();
        for (u, outs) in self.succ.iter().enumerate() {
            for &v in outs {
                if self.dominates(v, u) {
                    let blocks = by_header.entry(v).or_default();
                    blocks.insert(v);
                    let mut stack = vec![u];
                    blocks.insert(u);
                    while let Some(n) = stack.pop() {
                        for &p in &self.pred[n] {
                            if blocks.insert(p) {
                                stack.push(p);
                            }
                        }
                    }
                }
            }
        }
        by_header
            .into_iter()
            .map(|(header, blocks)| NaturalLoop {
                header: self.order[header].clone(),
                blocks: blocks.into_iter().map(|i| self.order[i].clone()).collect(),
            })
            .collect()
    }

    pub fn block_index(&self, name: &Name) -> Option<usize> {
        self.index_of.get(name).copied()
    }
}

fn successors_of(term: &Terminator) -> Vec<Name> {
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

fn reverse_postorder(succ: &[Vec<usize>], entry: usize) -> Vec<usize> {
    let mut visited = vec![false; succ.len()];
    let mut post = Vec::with_capacity(succ.len());
    let mut stack = vec![(entry, 0usize)];
    visited[entry] = true;
    while let Some(&mut (node, ref mut next)) = stack.last_mut() {
        if *next < succ[node].len() {
            let child = succ[node][*next];
            *next += 1;
            if !visited[child] {
                visited[child] = true;
                stack.push((child, 0));
            }
        } else {
            post.push(node);
            stack.pop();
        }
    }
    post.reverse();
    post
}

/// Cooper/Harvey/Kennedy iterative dominator computation.
fn compute_idom(pred: &[Vec<usize>], rpo: &[usize]) -> Vec<usize> {
    let n = pred.len();
    if n == 0 {
        return Vec::new();
    }
    let entry = rpo[0];
    let rpo_number: HashMap<usize, usize> = rpo.iter().enumerate().map(|(i, &b)| (b, i)).collect();
    let mut idom = vec![usize::MAX; n];
    idom[entry] = entry;

    let mut changed = true;
    while changed {
        changed = false;
        for &b in rpo.iter().skip(1) {
            let processed: Vec<usize> = pred[b].iter().copied().filter(|&p| idom[p] != usize::MAX).collect();
            let Some(&first) = processed.first() else { continue };
            let mut new_idom = first;
            for &p in &processed[1..] {
                new_idom = intersect(new_idom, p, &idom, &rpo_number);
            }
            if idom[b] != new_idom {
                idom[b] = new_idom;
                changed = true;
            }
        }
    }
    idom.iter().map(|&x| if x == usize::MAX { entry } else { x }).collect()
}

fn intersect(mut a: usize, mut b: usize, idom: &[usize], rpo_number: &HashMap<usize, usize>) -> usize {
    while a != b {
        while rpo_number[&a] > rpo_number[&b] {
            a = idom[a];
        }
        while rpo_number[&b] > rpo_number[&a] {
            b = idom[b];
        }
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a `Cfg` directly from a successor adjacency list, bypassing
    /// `llvm_ir::Function` construction (see DESIGN.md's note on why
    /// `discover.rs`/`emit.rs` don't get the same treatment: their helpers
    /// take `llvm_ir` types with too many required fields to hand-build,
    /// but `Cfg`'s graph algorithms only need plain indices).
    fn cfg_from_edges(n: usize, edges: &[(usize, usize)]) -> Cfg {
        let order: Vec<Name> = (0..n).map(|i| Name::Number(i)).collect();
        let index_of: HashMap<Name, usize> = order.iter().cloned().enumerate().map(|(i, name)| (name, i)).collect();
        let mut succ = vec![Vec::new(); n];
        let mut pred = vec![Vec::new(); n];
        for &(u, v) in edges {
            succ[u].push(v);
            pred[v].push(u);
        }
        let rpo = reverse_postorder(&succ, 0);
        let idom = compute_idom(&pred, &rpo);
        Cfg {
            order,
            index_of,
            succ,
            pred,
            idom,
        }
    }

    #[test]
    fn straight_line_has_no_loops() {
        // 0 -> 1 -> 2
        let cfg = cfg_from_edges(3, &[(0, 1), (1, 2)]);
        assert!(cfg.natural_loops().is_empty());
        assert!(cfg.dominates(0, 2));
        assert!(!cfg.dominates(2, 0));
    }

    #[test]
    fn simple_back_edge_is_one_natural_loop() {
        // 0 -> 1 -> 2 -> 1 (back edge 2 -> 1), 2 -> 3 (exit)
        let cfg = cfg_from_edges(4, &[(0, 1), (1, 2), (2, 1), (2, 3)]);
        let loops = cfg.natural_loops();
        assert_eq!(loops.len(), 1);
        let nat = &loops[0];
        assert_eq!(nat.header, Name::Number(1));
        assert_eq!(nat.blocks, HashSet::from([Name::Number(1), Name::Number(2)]));
    }

    #[test]
    fn diamond_has_no_loop_and_shared_dominator() {
        // 0 -> 1, 0 -> 2, 1 -> 3, 2 -> 3
        let cfg = cfg_from_edges(4, &[(0, 1), (0, 2), (1, 3), (2, 3)]);
        assert!(cfg.natural_loops().is_empty());
        assert!(cfg.dominates(0, 3));
        assert!(!cfg.dominates(1, 3));
        assert!(!cfg.dominates(2, 3));
    }

    #[test]
    fn nested_back_edges_share_the_same_header_merge() {
        // 0 -> 1 -> 2 -> 3 -> 2 (inner back edge), 3 -> 1 (outer back edge)
        let cfg = cfg_from_edges(4, &[(0, 1), (1, 2), (2, 3), (3, 2), (3, 1)]);
        let loops = cfg.natural_loops();
        // Two distinct headers (1 and 2), each a NaturalLoop entry.
        let headers: HashSet<Name> = loops.iter().map(|l| l.header.clone()).collect();
        assert_eq!(headers, HashSet::from([Name::Number(1), Name::Number(2)]));
        let outer = loops.iter().find(|l| l.header == Name::Number(1)).unwrap();
        assert!(outer.blocks.contains(&Name::Number(1)));
        assert!(outer.blocks.contains(&Name::Number(2)));
        assert!(outer.blocks.contains(&Name::Number(3)));
    }
}
