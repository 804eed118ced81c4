//! GC-rooting information (§4.4): liveness of GC-typed locals at GC-safe
//! points, stack-slot assignment via interference, reaching-definitions for
//! the mirror set, and the CheckGC consolidation pass that runs ahead of it.

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use crate::ir::util::{self, Cfg};
use crate::ir::{BlockId, Cmd, Function, Loc, VarId};

use super::dataflow::{self, CmdTransfer, Direction, GenKill, SetOp};

/// A single write to a GC-typed variable: the block and command index of
/// the write, plus the variable written.
type Definition = (BlockId, usize, VarId);

pub struct GcInfo {
    pub live_gc_vars: Map<(BlockId, usize), Vec<VarId>>,
    pub max_frame_size: u32,
    pub slot_of_variable: Map<VarId, u32>,
    pub vars_to_mirror: Map<(BlockId, usize), Vec<VarId>>,
}

// SECTION: liveness

struct LivenessTransfer;

impl CmdTransfer<VarId> for LivenessTransfer {
    fn cmd_transfer(&self, f: &Function, block: BlockId, cmd_idx: usize, gk: &mut GenKill<VarId>) {
        let cmd = &f.block(block).cmds[cmd_idx];
        for dst in util::dests(cmd) {
            if f.var(dst).typ.is_gc() {
                gk.kill(dst);
            }
        }
        for src in util::sources(cmd) {
            if let crate::ir::Value::LocalVar(id) = src {
                if f.var(*id).typ.is_gc() {
                    gk.gen(*id);
                }
            }
        }
    }
}

fn compute_liveness(f: &Function, cfg: &Cfg) -> Map<(BlockId, usize), Vec<VarId>> {
    let entry: Set<VarId> = f
        .ret_vars
        .iter()
        .copied()
        .filter(|id| f.var(*id).typ.is_gc())
        .collect();
    let transfer = LivenessTransfer;
    let result = dataflow::analyze_set(Direction::Backward, SetOp::Union, entry, &transfer, f, cfg);

    let mut live_gc_vars = Map::new();
    for block in f.block_ids() {
        for (idx, cmd) in f.block(block).cmds.iter().enumerate() {
            if cmd.is_gc_safe() {
                let live = result.after(block, idx);
                live_gc_vars.insert((block, idx), live.iter().copied().collect());
            }
        }
    }
    live_gc_vars
}

// SECTION: interference / slot packing

fn assign_slots(live_gc_vars: &Map<(BlockId, usize), Vec<VarId>>) -> (u32, Map<VarId, u32>) {
    let mut interferes: Map<VarId, Set<VarId>> = Map::new();
    for live in live_gc_vars.values() {
        for &v1 in live {
            for &v2 in live {
                interferes.entry(v1).or_default().insert(v2);
            }
        }
    }

    let mut slot_of_variable: Map<VarId, u32> = Map::new();
    let mut max_frame_size = 0u32;

    for (&v1, row) in &interferes {
        let used: Set<u32> = row
            .iter()
            .filter(|v2| **v2 != v1)
            .filter_map(|v2| slot_of_variable.get(v2).copied())
            .collect();
        let mut slot = 0u32;
        while used.contains(&slot) {
            slot += 1;
        }
        slot_of_variable.insert(v1, slot);
        max_frame_size = max_frame_size.max(slot + 1);
    }

    (max_frame_size, slot_of_variable)
}

// SECTION: reaching definitions / mirror set

struct ReachDefTransfer {
    defs_of_var: Map<VarId, Set<(BlockId, usize)>>,
}

impl ReachDefTransfer {
    fn build(f: &Function) -> Self {
        let mut defs_of_var: Map<VarId, Set<(BlockId, usize)>> = Map::new();
        for block in f.block_ids() {
            for (idx, cmd) in f.block(block).cmds.iter().enumerate() {
                for dst in util::dests(cmd) {
                    if f.var(dst).typ.is_gc() {
                        defs_of_var.entry(dst).or_default().insert((block, idx));
                    }
                }
            }
        }
        ReachDefTransfer { defs_of_var }
    }
}

impl CmdTransfer<Definition> for ReachDefTransfer {
    fn cmd_transfer(&self, f: &Function, block: BlockId, cmd_idx: usize, gk: &mut GenKill<Definition>) {
        let cmd = &f.block(block).cmds[cmd_idx];
        for dst in util::dests(cmd) {
            if !f.var(dst).typ.is_gc() {
                continue;
            }
            if let Some(sites) = self.defs_of_var.get(&dst) {
                for &(b, c) in sites {
                    gk.kill((b, c, dst));
                }
            }
            gk.gen((block, cmd_idx, dst));
        }
    }
}

fn compute_mirror_set(f: &Function, cfg: &Cfg) -> Map<(BlockId, usize), Vec<VarId>> {
    let transfer = ReachDefTransfer::build(f);
    let result = dataflow::analyze_set(Direction::Forward, SetOp::Union, Set::new(), &transfer, f, cfg);

    let mut vars_to_mirror: Map<(BlockId, usize), Vec<VarId>> = Map::new();
    for block in f.block_ids() {
        for (idx, cmd) in f.block(block).cmds.iter().enumerate() {
            if !cmd.is_gc_safe() {
                continue;
            }
            let reaching = result.before(block, idx);
            let entry = vars_to_mirror.entry((block, idx)).or_default();
            let mut seen: Set<VarId> = Set::new();
            for &(_, _, v) in reaching {
                if seen.insert(v) {
                    entry.push(v);
                }
            }
        }
    }
    vars_to_mirror
}

/// Compute the three GC-info outputs for a single function (§4.4). Must run
/// after [`move_checkgc`] so liveness is measured against the consolidated
/// set of GC-safe points, and after inlining so slots are assigned over the
/// final CFG.
pub fn compute(f: &Function) -> GcInfo {
    let cfg = Cfg::new(f);
    let live_gc_vars = compute_liveness(f, &cfg);
    let (max_frame_size, slot_of_variable) = assign_slots(&live_gc_vars);
    let vars_to_mirror = compute_mirror_set(f, &cfg);
    GcInfo {
        live_gc_vars,
        max_frame_size,
        slot_of_variable,
        vars_to_mirror,
    }
}

/// Consolidate each block's `CheckGC` commands into at most one, placed
/// immediately before the next barrier (`CallStatic`, `CallDyn`, or the
/// block's terminator), or at the block's end if none follows. Calls are
/// already GC-safe points, so this never changes observable behavior, only
/// the number of explicit checks. Returns `(moved, removed)`: `removed` is
/// the total count of `CheckGC` commands deleted; `moved` is the number of
/// blocks that had at least one and therefore received a consolidated
/// replacement (§4.4, §6).
pub fn move_checkgc(f: &mut Function) -> (u32, u32) {
    let mut moved = 0u32;
    let mut removed = 0u32;

    for block in &mut f.blocks {
        let mut first_loc: Option<Loc> = None;
        let mut kept: Vec<Cmd> = Vec::with_capacity(block.cmds.len());
        for cmd in block.cmds.drain(..) {
            match cmd {
                Cmd::CheckGC { loc } => {
                    removed += 1;
                    if first_loc.is_none() {
                        first_loc = Some(loc);
                    }
                }
                other => kept.push(other),
            }
        }

        if let Some(loc) = first_loc {
            moved += 1;
            let insert_at = kept
                .iter()
                .position(|c| matches!(c, Cmd::CallStatic { .. } | Cmd::CallDyn { .. }) || c.is_terminator())
                .unwrap_or(kept.len());
            kept.insert(insert_at, Cmd::CheckGC { loc });
        }

        block.cmds = kept;
    }

    (moved, removed)
}
