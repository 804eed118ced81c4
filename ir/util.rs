//! Accessors over commands and control flow: sources, destinations, jump
//! targets, successor/predecessor lists, and the two topological orders used
//! by the dataflow framework (§2 item 1, §4.1).

use std::collections::BTreeMap as Map;

use super::{BasicBlock, BlockId, Cmd, Function, Value};

/// Every [`Value`] read by a command, in an unspecified but stable order.
pub fn sources(cmd: &Cmd) -> Vec<&Value> {
    use Cmd::*;
    match cmd {
        Move { src, .. } => vec![src],
        CallStatic { src_f, srcs, .. } | CallDyn { src_f, srcs, .. } => {
            let mut v = vec![src_f];
            v.extend(srcs.iter());
            v
        }
        NewArr { src_n, .. } => vec![src_n],
        GetArr { src_arr, src_i, .. } => vec![src_arr, src_i],
        SetArr {
            src_arr,
            src_i,
            src_v,
            ..
        } => vec![src_arr, src_i, src_v],
        RenormArr { src_arr, src_i, .. } => vec![src_arr, src_i],
        NewRecord { .. } => vec![],
        SetField {
            src_rec, src_v, ..
        } => vec![src_rec, src_v],
        InitUpvalues { srcs, .. } => srcs.iter().collect(),
        CheckGC { .. } | Nop { .. } => vec![],
        Jmp { .. } => vec![],
        JmpIf { cond, .. } => vec![cond],
    }
}

/// The same set of operands as [`sources`], mutable — used by constant
/// propagation's rewrite step (§4.3).
pub fn sources_mut(cmd: &mut Cmd) -> Vec<&mut Value> {
    use Cmd::*;
    match cmd {
        Move { src, .. } => vec![src],
        CallStatic { src_f, srcs, .. } | CallDyn { src_f, srcs, .. } => {
            let mut v = vec![src_f];
            v.extend(srcs.iter_mut());
            v
        }
        NewArr { src_n, .. } => vec![src_n],
        GetArr { src_arr, src_i, .. } => vec![src_arr, src_i],
        SetArr {
            src_arr,
            src_i,
            src_v,
            ..
        } => vec![src_arr, src_i, src_v],
        RenormArr { src_arr, src_i, .. } => vec![src_arr, src_i],
        NewRecord { .. } => vec![],
        SetField {
            src_rec, src_v, ..
        } => vec![src_rec, src_v],
        InitUpvalues { srcs, .. } => srcs.iter_mut().collect(),
        CheckGC { .. } | Nop { .. } => vec![],
        Jmp { .. } => vec![],
        JmpIf { cond, .. } => vec![cond],
    }
}

/// The single scalar destination of a command, if any.  `CallStatic` and
/// `CallDyn` may have zero or more destinations; use [`dests`] for those.
pub fn dest(cmd: &Cmd) -> Option<super::VarId> {
    use Cmd::*;
    match cmd {
        Move { dst, .. } => Some(*dst),
        NewArr { dst, .. } => Some(*dst),
        GetArr { dst, .. } => Some(*dst),
        NewRecord { dst, .. } => Some(*dst),
        _ => None,
    }
}

/// Every variable a command writes to.
pub fn dests(cmd: &Cmd) -> Vec<super::VarId> {
    use Cmd::*;
    match cmd {
        CallStatic { dsts, .. } | CallDyn { dsts, .. } => dsts.clone(),
        _ => dest(cmd).into_iter().collect(),
    }
}

/// Mutable access to a command's single scalar destination, mirroring
/// [`dest`] — used by the inliner to renumber callee var-ids in place.
pub fn dest_mut(cmd: &mut Cmd) -> Option<&mut super::VarId> {
    use Cmd::*;
    match cmd {
        Move { dst, .. } => Some(dst),
        NewArr { dst, .. } => Some(dst),
        GetArr { dst, .. } => Some(dst),
        NewRecord { dst, .. } => Some(dst),
        _ => None,
    }
}

/// Mutable access to every variable a command writes to, mirroring [`dests`].
pub fn dests_mut(cmd: &mut Cmd) -> Vec<&mut super::VarId> {
    use Cmd::*;
    match cmd {
        CallStatic { dsts, .. } | CallDyn { dsts, .. } => dsts.iter_mut().collect(),
        _ => dest_mut(cmd).into_iter().collect(),
    }
}

/// Jump targets of a terminator; empty for non-terminators.
pub fn jump_targets(cmd: &Cmd) -> Vec<BlockId> {
    match cmd {
        Cmd::Jmp { target, .. } => vec![*target],
        Cmd::JmpIf {
            target_true,
            target_false,
            ..
        } => vec![*target_true, *target_false],
        _ => vec![],
    }
}

/// The control-flow graph of a single function, computed once per analysis
/// run from its basic blocks (edges precomputed at construction rather than
/// walked repeatedly).
#[derive(Clone, Debug)]
pub struct Cfg {
    succ: Map<BlockId, Vec<BlockId>>,
    pred: Map<BlockId, Vec<BlockId>>,
}

impl Cfg {
    pub fn new(f: &Function) -> Self {
        let mut succ: Map<BlockId, Vec<BlockId>> = Map::new();
        let mut pred: Map<BlockId, Vec<BlockId>> = Map::new();

        for id in f.block_ids() {
            succ.entry(id).or_default();
            pred.entry(id).or_default();
        }

        for id in f.block_ids() {
            let block: &BasicBlock = f.block(id);
            if let Some(term) = block.terminator() {
                for target in jump_targets(term) {
                    succ.entry(id).or_default().push(target);
                    pred.entry(target).or_default().push(id);
                }
            }
        }

        Cfg { succ, pred }
    }

    pub fn succ(&self, id: BlockId) -> &[BlockId] {
        self.succ.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn pred(&self, id: BlockId) -> &[BlockId] {
        self.pred.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Depth-first postorder over successors from `entry`, reversed: a
    /// forward topological order (blocks unreachable from `entry` are
    /// omitted).
    pub fn rpo_forward(&self, entry: BlockId) -> Vec<BlockId> {
        self.rpo(entry, |id| self.succ(id))
    }

    /// The mirror traversal over predecessors, starting from `exit`: the
    /// order a backward analysis should visit blocks in.
    pub fn rpo_backward(&self, exit: BlockId) -> Vec<BlockId> {
        self.rpo(exit, |id| self.pred(id))
    }

    fn rpo(&self, start: BlockId, next: impl Fn(BlockId) -> &[BlockId]) -> Vec<BlockId> {
        let mut visited = std::collections::BTreeSet::new();
        let mut postorder = Vec::new();
        let mut stack = vec![(start, 0usize)];
        visited.insert(start);

        while let Some((id, child_idx)) = stack.pop() {
            let children = next(id);
            if child_idx < children.len() {
                stack.push((id, child_idx + 1));
                let child = children[child_idx];
                if visited.insert(child) {
                    stack.push((child, 0));
                }
            } else {
                postorder.push(id);
            }
        }

        postorder.reverse();
        postorder
    }
}

impl Function {
    /// Insert `block` at position `at` (1-based), shifting every later
    /// block's id up by one and rewriting every *pre-existing* jump target
    /// accordingly. `block`'s own jump targets are left untouched — the
    /// caller authors them already in post-shift numbering. Returns `at` as
    /// the new block's id.
    ///
    /// Any edge that used to point at the block now occupying `at` (i.e. an
    /// edge into whatever got pushed one slot down) follows the shift too,
    /// so a caller that instead wants that edge to point at the newly
    /// inserted block must retarget it explicitly after this call — this is
    /// exactly what the renormalize optimizer does with the loop's prep
    /// block (§4.5).
    ///
    /// Used by the renormalize optimizer to splice in a pre-header; the
    /// inliner implements its own bespoke shifting (§4.6) because its
    /// renumbering rule is asymmetric between caller and callee blocks.
    pub fn insert_block(&mut self, at: BlockId, block: BasicBlock) -> BlockId {
        let insert_idx = at.index();

        // Shift every pre-existing jump target before the new block exists
        // in `self.blocks`, so there is nothing to special-case here.
        for b in &mut self.blocks {
            for cmd in &mut b.cmds {
                shift_targets(cmd, at, 1);
            }
        }

        self.blocks.insert(insert_idx, block);

        at
    }
}

fn shift_targets(cmd: &mut Cmd, threshold: BlockId, delta: i64) {
    match cmd {
        Cmd::Jmp { target, .. } => shift_one(target, threshold, delta),
        Cmd::JmpIf {
            target_true,
            target_false,
            ..
        } => {
            shift_one(target_true, threshold, delta);
            shift_one(target_false, threshold, delta);
        }
        _ => {}
    }
}

fn shift_one(target: &mut BlockId, threshold: BlockId, delta: i64) {
    if *target >= threshold {
        target.0 = (target.0 as i64 + delta) as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionType, Loc, Type, Var};

    fn block(cmds: Vec<Cmd>) -> BasicBlock {
        BasicBlock::new(cmds)
    }

    fn diamond() -> Function {
        // b1 -> {b2, b3} -> b4 (b4 is last, no terminator)
        Function {
            typ: FunctionType {
                arg_types: vec![],
                ret_types: vec![],
            },
            vars: vec![Var {
                name: "c".into(),
                typ: Type::Bool,
                loc: Loc::default(),
            }],
            ret_vars: vec![],
            captured_vars: vec![],
            blocks: vec![
                block(vec![Cmd::JmpIf {
                    loc: Loc::default(),
                    cond: Value::LocalVar(super::super::VarId(1)),
                    target_true: BlockId(2),
                    target_false: BlockId(3),
                }]),
                block(vec![Cmd::Jmp {
                    loc: Loc::default(),
                    target: BlockId(4),
                }]),
                block(vec![Cmd::Jmp {
                    loc: Loc::default(),
                    target: BlockId(4),
                }]),
                block(vec![]),
            ],
            f_id_of_upvalue: Map::new(),
            f_id_of_local: Map::new(),
            for_loops: vec![],
            loc: Loc::default(),
        }
    }

    #[test]
    fn cfg_computes_succ_and_pred() {
        let f = diamond();
        let cfg = Cfg::new(&f);
        assert_eq!(cfg.succ(BlockId(1)), &[BlockId(2), BlockId(3)]);
        assert_eq!(cfg.pred(BlockId(4)), &[BlockId(2), BlockId(3)]);
        assert!(cfg.pred(BlockId(1)).is_empty());
    }

    #[test]
    fn rpo_forward_visits_entry_first() {
        let f = diamond();
        let cfg = Cfg::new(&f);
        let order = cfg.rpo_forward(f.entry_block());
        assert_eq!(order[0], BlockId(1));
        assert_eq!(*order.last().unwrap(), BlockId(4));
    }

    #[test]
    fn insert_block_shifts_preexisting_targets() {
        let mut f = diamond();
        // Insert a new block at the old b2's slot; its own jump already uses
        // post-shift numbering (old b2 now lives at b3).
        f.insert_block(
            BlockId(2),
            block(vec![Cmd::Jmp {
                loc: Loc::default(),
                target: BlockId(3),
            }]),
        );

        // b1's edges followed the shift: target_true (old b2) now points at
        // b3, target_false (old b3) now points at b4.
        match &f.block(BlockId(1)).cmds[0] {
            Cmd::JmpIf {
                target_true,
                target_false,
                ..
            } => {
                assert_eq!(*target_true, BlockId(3));
                assert_eq!(*target_false, BlockId(4));
            }
            _ => panic!("expected JmpIf"),
        }
        // The caller retargets b1 at the new block explicitly, as the
        // renormalize optimizer does for the loop's prep block.
        if let Cmd::JmpIf { target_true, .. } = &mut f.block_mut(BlockId(1)).cmds[0] {
            *target_true = BlockId(2);
        }
        assert_eq!(f.blocks.len(), 5);
        match &f.block(BlockId(2)).cmds[0] {
            Cmd::Jmp { target, .. } => assert_eq!(*target, BlockId(3)),
            _ => panic!("expected Jmp"),
        }
    }
}
