//! A generic, direction-agnostic dataflow-analysis engine (§4.1), plus a
//! set-framework convenience layer for the common gen/kill case.
//!
//! Concrete analyses (§4.2-§4.5) implement [`Framework`] and call
//! [`analyze`]; analyses whose transfer function is a pointwise gen/kill over
//! a `BTreeSet` instead implement the narrower [`CmdTransfer`] trait and call
//! [`analyze_set`], which builds the `Framework` plumbing for them.

use std::collections::{BTreeMap as Map, BTreeSet as Set, VecDeque};

use crate::ir::util::Cfg;
use crate::ir::{BlockId, Function};

/// Which way a [`Framework`] walks the CFG: forward analyses (e.g.
/// reaching definitions, constant propagation) see each block's predecessors
/// as its dataflow inputs; backward analyses (e.g. liveness) see its
/// successors.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// The per-pass contract a dataflow analysis supplies. `State` is the
/// lattice value held at a single program point (entry-of-block,
/// after-command, exit-of-block).
pub trait Framework {
    type State: Clone + PartialEq;

    fn direction(&self) -> Direction;

    /// The value assigned to every block on the first iteration, before any
    /// join has run — typically the lattice's top or bottom element.
    fn identity(&self) -> Self::State;

    /// The value flowing into the function's single entry point (forward)
    /// or out of its single exit point (backward).
    fn entry_value(&self, f: &Function) -> Self::State;

    /// Combine two values flowing into the same point from different edges.
    fn join(&self, a: &Self::State, b: &Self::State) -> Self::State;

    /// Transfer `state` across a single command, in forward program order
    /// regardless of `direction()` — i.e. `state` is always "the value
    /// before `cmd`" and the result is always "the value after `cmd`" in
    /// forward terms; [`analyze`] reverses the walk itself for backward
    /// analyses so implementers never need to think about direction here.
    fn transfer(&self, f: &Function, block: BlockId, cmd_idx: usize, state: &Self::State) -> Self::State;
}

/// The per-command snapshots for one block: `points[i]` is the state before
/// `cmds[i]` and `points[cmds.len()]` is the state after the last command,
/// for both directions — a backward analysis simply fills this array from
/// the end instead of the front. This unifies "state before command `i`" =
/// `points[i]` and "state after command `i`" = `points[i + 1]` regardless of
/// which way the analysis runs.
#[derive(Clone, Debug)]
pub struct BlockPoints<S> {
    pub points: Vec<S>,
}

impl<S> BlockPoints<S> {
    pub fn before(&self, cmd_idx: usize) -> &S {
        &self.points[cmd_idx]
    }

    pub fn after(&self, cmd_idx: usize) -> &S {
        &self.points[cmd_idx + 1]
    }
}

/// The complete result of a dataflow run: for every block, its entry/exit
/// (in forward terms) values plus the full per-command points array.
pub struct AnalysisResult<S> {
    pub entry: Map<BlockId, S>,
    pub exit: Map<BlockId, S>,
    pub points: Map<BlockId, BlockPoints<S>>,
}

impl<S> AnalysisResult<S> {
    /// The value live at a specific command's entry, independent of
    /// direction — always "before this command in forward program order".
    pub fn before(&self, block: BlockId, cmd_idx: usize) -> &S {
        self.points[&block].before(cmd_idx)
    }

    pub fn after(&self, block: BlockId, cmd_idx: usize) -> &S {
        self.points[&block].after(cmd_idx)
    }
}

/// Run `fw` to a fixed point over `f`'s CFG using a worklist in topological
/// order. Terminates because every concrete [`Framework`] in this crate has
/// a lattice of finite height and a monotone `transfer`/`join`.
pub fn analyze<FW: Framework>(fw: &FW, f: &Function, cfg: &Cfg) -> AnalysisResult<FW::State> {
    let block_ids: Vec<BlockId> = f.block_ids().collect();

    let order = match fw.direction() {
        Direction::Forward => cfg.rpo_forward(f.entry_block()),
        Direction::Backward => cfg.rpo_backward(f.last_block()),
    };
    // Blocks unreachable in the traversal direction still need an initial
    // value so lookups never panic.
    let mut in_state: Map<BlockId, FW::State> = block_ids
        .iter()
        .map(|&id| (id, fw.identity()))
        .collect();

    let entry_id = match fw.direction() {
        Direction::Forward => f.entry_block(),
        Direction::Backward => f.last_block(),
    };
    in_state.insert(entry_id, fw.entry_value(f));

    let mut queue: VecDeque<BlockId> = order.iter().copied().collect();
    let mut queued: Set<BlockId> = queue.iter().copied().collect();

    // Blocks absent from `order` (unreachable from the traversal root) are
    // still processed, holding `identity()`, so every block has a result.
    for &id in &block_ids {
        if queued.insert(id) {
            queue.push_back(id);
        }
    }

    let mut out_state: Map<BlockId, FW::State> = Map::new();
    let mut points: Map<BlockId, BlockPoints<FW::State>> = Map::new();

    while let Some(id) = queue.pop_front() {
        queued.remove(&id);

        let incoming: Vec<BlockId> = match fw.direction() {
            Direction::Forward => cfg.pred(id).to_vec(),
            Direction::Backward => cfg.succ(id).to_vec(),
        };

        let joined = if id == entry_id {
            in_state[&id].clone()
        } else {
            // A predecessor with no out_state yet hasn't been visited by the
            // worklist; treat it as not-yet-constraining rather than
            // defaulting it to `identity()`. For intersection-style
            // analyses `identity()` is the empty set standing in for the
            // (unrepresentable) universe, and folding it in before the
            // real predecessor is computed would permanently collapse a
            // loop header to empty the first time a back edge is seen.
            // Skipping absent predecessors and letting the worklist
            // re-join once they do produce a value keeps the fixed point
            // correct for both set operators.
            let mut acc: Option<FW::State> = None;
            for p in &incoming {
                if let Some(v) = out_state.get(p) {
                    acc = Some(match acc {
                        None => v.clone(),
                        Some(prev) => fw.join(&prev, v),
                    });
                }
            }
            acc.unwrap_or_else(|| fw.identity())
        };
        in_state.insert(id, joined.clone());

        let block_points = run_block(fw, f, cfg, id, &joined);
        let new_out = match fw.direction() {
            Direction::Forward => block_points.points.last().unwrap().clone(),
            Direction::Backward => block_points.points.first().unwrap().clone(),
        };

        let changed = out_state
            .get(&id)
            .map(|old| *old != new_out)
            .unwrap_or(true);

        out_state.insert(id, new_out);
        points.insert(id, block_points);

        if changed {
            let downstream: Vec<BlockId> = match fw.direction() {
                Direction::Forward => cfg.succ(id).to_vec(),
                Direction::Backward => cfg.pred(id).to_vec(),
            };
            for d in downstream {
                if queued.insert(d) {
                    queue.push_back(d);
                }
            }
        }
    }

    let (entry, exit) = match fw.direction() {
        Direction::Forward => (in_state, out_state),
        Direction::Backward => (out_state, in_state),
    };

    AnalysisResult { entry, exit, points }
}

/// Build the points array for one block, forward in program order. For a
/// backward analysis, `start` is the value at the *end* of the block (the
/// join of successors) and we walk `transfer` from the back.
fn run_block<FW: Framework>(
    fw: &FW,
    f: &Function,
    _cfg: &Cfg,
    block: BlockId,
    start: &FW::State,
) -> BlockPoints<FW::State> {
    let n = f.block(block).cmds.len();
    let mut pts = vec![fw.identity(); n + 1];

    match fw.direction() {
        Direction::Forward => {
            pts[0] = start.clone();
            for i in 0..n {
                pts[i + 1] = fw.transfer(f, block, i, &pts[i]);
            }
        }
        Direction::Backward => {
            pts[n] = start.clone();
            for i in (0..n).rev() {
                pts[i] = fw.transfer(f, block, i, &pts[i + 1]);
            }
        }
    }

    BlockPoints { points: pts }
}

// SECTION: set-framework convenience layer (§4.1 gen/kill summarization)

/// The gen/kill effect of a single command on a set-valued dataflow fact.
/// `gen` and `kill` must be disjoint — a command that both generates and
/// kills the same element is a bug in the transfer function, not a
/// legitimate analysis state.
#[derive(Debug, Default)]
pub struct GenKill<T: Ord> {
    gen: Set<T>,
    kill: Set<T>,
}

impl<T: Ord + Clone> GenKill<T> {
    pub fn new() -> Self {
        GenKill {
            gen: Set::new(),
            kill: Set::new(),
        }
    }

    pub fn gen(&mut self, item: T) {
        self.gen.insert(item);
    }

    pub fn kill(&mut self, item: T) {
        self.kill.insert(item);
    }

    fn apply(&self, state: &Set<T>) -> Set<T> {
        debug_assert!(
            self.gen.is_disjoint(&self.kill),
            "gen and kill must not share an element"
        );
        let mut next: Set<T> = state.difference(&self.kill).cloned().collect();
        next.extend(self.gen.iter().cloned());
        next
    }
}

/// Which lattice operator a [`SetFramework`] joins with: union (may-style
/// analyses like uninitialized-variable detection, where any incoming path
/// lacking a definition is a hazard) or intersection (must-style analyses
/// like the renormalize optimizer's loop-invariant check, where every
/// incoming path must agree).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SetOp {
    Union,
    Intersection,
}

/// Per-command gen/kill summarization, supplied by a concrete set-valued
/// analysis.
pub trait CmdTransfer<T: Ord> {
    fn cmd_transfer(&self, f: &Function, block: BlockId, cmd_idx: usize, gk: &mut GenKill<T>);
}

/// A ready-made [`Framework`] over `BTreeSet<T>` built from a [`SetOp`], an
/// entry value, and a [`CmdTransfer`] implementation — the convenience layer
/// named in §4.1 so that gen/kill analyses never hand-write `join`/`transfer`.
pub struct SetFramework<'a, T: Ord + Clone, C: CmdTransfer<T>> {
    pub direction: Direction,
    pub op: SetOp,
    pub entry: Set<T>,
    pub transfer: &'a C,
    _marker: std::marker::PhantomData<T>,
}

impl<'a, T: Ord + Clone, C: CmdTransfer<T>> SetFramework<'a, T, C> {
    pub fn new(direction: Direction, op: SetOp, entry: Set<T>, transfer: &'a C) -> Self {
        SetFramework {
            direction,
            op,
            entry,
            transfer,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<'a, T: Ord + Clone, C: CmdTransfer<T>> Framework for SetFramework<'a, T, C> {
    type State = Set<T>;

    fn direction(&self) -> Direction {
        self.direction
    }

    fn identity(&self) -> Self::State {
        match self.op {
            // Union's identity is the empty set (bottom); there is no finite
            // representation of "everything" for intersection's top, so we
            // approximate it with the empty set too and rely on `entry_value`
            // plus monotone shrinking from real predecessors to reach the
            // correct fixed point — the same approach spec.md's
            // set-framework convenience describes for intersection-style
            // analyses seeded from a concrete entry set.
            SetOp::Union | SetOp::Intersection => Set::new(),
        }
    }

    fn entry_value(&self, _f: &Function) -> Self::State {
        self.entry.clone()
    }

    fn join(&self, a: &Self::State, b: &Self::State) -> Self::State {
        match self.op {
            SetOp::Union => a.union(b).cloned().collect(),
            SetOp::Intersection => a.intersection(b).cloned().collect(),
        }
    }

    fn transfer(&self, f: &Function, block: BlockId, cmd_idx: usize, state: &Self::State) -> Self::State {
        let mut gk = GenKill::new();
        self.transfer.cmd_transfer(f, block, cmd_idx, &mut gk);
        gk.apply(state)
    }
}

/// Run a [`SetFramework`] to a fixed point. Intersection-style analyses
/// whose identity is the empty set only produce a meaningful result once a
/// block has at least one predecessor with a real value; blocks with no
/// predecessors (only the entry, post-validation) instead use `entry_value`,
/// matching the single-entry invariant in §3.
pub fn analyze_set<T: Ord + Clone, C: CmdTransfer<T>>(
    direction: Direction,
    op: SetOp,
    entry: Set<T>,
    transfer: &C,
    f: &Function,
    cfg: &Cfg,
) -> AnalysisResult<Set<T>> {
    let fw = SetFramework::new(direction, op, entry, transfer);
    analyze(&fw, f, cfg)
}
