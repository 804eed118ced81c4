//! Array-renormalization hoisting (§4.5): for each counted loop, a forward
//! intersection dataflow tracks which vars still name an array allocated
//! outside the loop and untouched since, then hoists any `RenormArr` whose
//! array and index both stay loop-invariant into a new pre-header block.

use std::collections::BTreeSet as Set;

use crate::ir::util::{self, Cfg};
use crate::ir::{BasicBlock, BlockId, Cmd, Function, Loop, Value, VarId};

use super::dataflow::{self, CmdTransfer, Direction, GenKill, SetOp};

struct RenormTransfer {
    body_first: BlockId,
    body_last: BlockId,
}

impl RenormTransfer {
    fn in_body(&self, block: BlockId) -> bool {
        block.0 >= self.body_first.0 && block.0 <= self.body_last.0
    }
}

impl CmdTransfer<VarId> for RenormTransfer {
    fn cmd_transfer(&self, f: &Function, block: BlockId, cmd_idx: usize, gk: &mut GenKill<VarId>) {
        let cmd = &f.block(block).cmds[cmd_idx];

        if !matches!(cmd, Cmd::RenormArr { .. } | Cmd::GetArr { .. } | Cmd::SetArr { .. }) {
            for src in util::sources(cmd) {
                if let Value::LocalVar(id) = src {
                    gk.kill(*id);
                }
            }
        }

        let gen_dst = if !self.in_body(block) {
            match cmd {
                Cmd::NewArr { dst, .. } => Some(*dst),
                _ => None,
            }
        } else {
            None
        };

        for dst in util::dests(cmd) {
            if Some(dst) != gen_dst {
                gk.kill(dst);
            }
        }
        if let Some(dst) = gen_dst {
            gk.gen(dst);
        }
    }
}

/// Hoist loop-invariant `RenormArr`s out of every counted loop in `f`.
/// Returns the number of `RenormArr` sites hoisted (§6's "renormalizes: N").
pub fn run(f: &mut Function) -> u32 {
    let mut total = 0u32;

    let mut loop_order: Vec<usize> = (0..f.for_loops.len()).collect();
    loop_order.sort_by_key(|&i| f.for_loops[i].prep_block_id);

    for li in loop_order {
        // Re-read the loop descriptor fresh each time: an earlier loop's
        // transform may have shifted this loop's block ids.
        let loop_desc = f.for_loops[li].clone();
        total += optimize_loop(f, &loop_desc);
    }

    total
}

fn optimize_loop(f: &mut Function, loop_desc: &Loop) -> u32 {
    let cfg = Cfg::new(f);
    let transfer = RenormTransfer {
        body_first: loop_desc.body_first_block_id,
        body_last: loop_desc.body_last_block_id,
    };
    let result = dataflow::analyze_set(Direction::Forward, SetOp::Intersection, Set::new(), &transfer, f, &cfg);

    let body_block_ids: Vec<BlockId> = (loop_desc.body_first_block_id.0..=loop_desc.body_last_block_id.0)
        .map(BlockId)
        .collect();

    let mut cannot_optimize: Set<VarId> = Set::new();
    let mut candidates: Vec<(BlockId, usize, VarId)> = Vec::new();
    let mut all_unsafe = false;

    for &b in &body_block_ids {
        let cmds_len = f.block(b).cmds.len();
        for idx in 0..cmds_len {
            let cmd = f.block(b).cmds[idx].clone();
            if let Cmd::RenormArr { src_arr: Value::LocalVar(arr_id), src_i, .. } = &cmd {
                let before = result.before(b, idx);
                let idx_is_iv =
                    matches!(src_i, Value::LocalVar(i) if *i == loop_desc.iteration_variable_id);
                if !idx_is_iv || !before.contains(arr_id) {
                    cannot_optimize.insert(*arr_id);
                } else {
                    candidates.push((b, idx, *arr_id));
                }
            }
            for dst in util::dests(&cmd) {
                if dst == loop_desc.iteration_variable_id {
                    all_unsafe = true;
                }
            }
        }
    }

    if all_unsafe {
        return 0;
    }

    let mut arrays_to_optimize: Vec<VarId> = Vec::new();
    let mut seen: Set<VarId> = Set::new();
    for (b, idx, arr_id) in candidates {
        if cannot_optimize.contains(&arr_id) {
            continue;
        }
        let loc = f.block(b).cmds[idx].loc();
        f.block_mut(b).cmds[idx] = Cmd::Nop { loc };
        if seen.insert(arr_id) {
            arrays_to_optimize.push(arr_id);
        }
    }

    if arrays_to_optimize.is_empty() {
        return 0;
    }

    let preheader_at = BlockId(loop_desc.prep_block_id.0 + 1);
    let new_body_first = BlockId(loop_desc.body_first_block_id.0 + 1);

    let mut preheader_cmds: Vec<Cmd> = arrays_to_optimize
        .iter()
        .map(|&arr| Cmd::RenormArr {
            loc: loop_desc.loc,
            src_arr: Value::LocalVar(arr),
            src_i: loop_desc.limit_value.clone(),
        })
        .collect();
    preheader_cmds.push(Cmd::Jmp {
        loc: loop_desc.loc,
        target: new_body_first,
    });

    f.insert_block(preheader_at, BasicBlock::new(preheader_cmds));

    if let Some(Cmd::JmpIf { target_true, .. }) = f.block_mut(loop_desc.prep_block_id).cmds.last_mut() {
        *target_true = preheader_at;
    }

    for l in &mut f.for_loops {
        if l.prep_block_id.0 >= preheader_at.0 {
            l.prep_block_id.0 += 1;
        }
        if l.body_first_block_id.0 >= preheader_at.0 {
            l.body_first_block_id.0 += 1;
        }
        if l.body_last_block_id.0 >= preheader_at.0 {
            l.body_last_block_id.0 += 1;
        }
    }

    arrays_to_optimize.len() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionType, Loc, Type, Var};
    use std::collections::BTreeMap as Map;

    #[test]
    fn hoists_a_loop_invariant_renormarr_to_a_new_preheader() {
        // S4: k(): arr allocated above a counted loop; body does
        // RenormArr(arr, i); s = arr[i]; arr[i] = s.
        let f = Function {
            typ: FunctionType {
                arg_types: vec![],
                ret_types: vec![],
            },
            vars: vec![
                Var { name: "arr".into(), typ: Type::Array(Box::new(Type::Integer)), loc: Loc::default() },
                Var { name: "i".into(), typ: Type::Integer, loc: Loc::default() },
                Var { name: "s".into(), typ: Type::Integer, loc: Loc::default() },
            ],
            ret_vars: vec![],
            captured_vars: vec![],
            blocks: vec![
                BasicBlock::new(vec![
                    Cmd::NewArr {
                        loc: Loc::default(),
                        dst: VarId(1),
                        elem_typ: Type::Integer,
                        src_n: Value::Integer(10),
                    },
                    Cmd::Jmp { loc: Loc::default(), target: BlockId(2) },
                ]),
                BasicBlock::new(vec![Cmd::JmpIf {
                    loc: Loc::default(),
                    cond: Value::Bool(true),
                    target_true: BlockId(3),
                    target_false: BlockId(4),
                }]),
                BasicBlock::new(vec![
                    Cmd::RenormArr {
                        loc: Loc::default(),
                        src_arr: Value::LocalVar(VarId(1)),
                        src_i: Value::LocalVar(VarId(2)),
                    },
                    Cmd::GetArr {
                        loc: Loc::default(),
                        dst: VarId(3),
                        src_arr: Value::LocalVar(VarId(1)),
                        src_i: Value::LocalVar(VarId(2)),
                    },
                    Cmd::SetArr {
                        loc: Loc::default(),
                        src_arr: Value::LocalVar(VarId(1)),
                        src_i: Value::LocalVar(VarId(2)),
                        src_v: Value::LocalVar(VarId(3)),
                    },
                    Cmd::Jmp { loc: Loc::default(), target: BlockId(2) },
                ]),
                BasicBlock::new(vec![]),
            ],
            f_id_of_upvalue: Map::new(),
            f_id_of_local: Map::new(),
            for_loops: vec![Loop {
                prep_block_id: BlockId(2),
                body_first_block_id: BlockId(3),
                body_last_block_id: BlockId(3),
                iteration_variable_id: VarId(2),
                limit_value: Value::Integer(10),
                step_is_positive: true,
                loc: Loc::default(),
            }],
            loc: Loc::default(),
        };

        let mut f = f;
        let count = run(&mut f);
        assert_eq!(count, 1);
        assert_eq!(f.blocks.len(), 5);

        match &f.block(BlockId(2)).cmds[0] {
            Cmd::JmpIf { target_true, .. } => assert_eq!(*target_true, BlockId(3)),
            _ => panic!("expected JmpIf"),
        }
        match &f.block(BlockId(3)).cmds[0] {
            Cmd::RenormArr { src_arr, .. } => assert_eq!(*src_arr, Value::LocalVar(VarId(1))),
            _ => panic!("expected hoisted RenormArr"),
        }
        match &f.block(BlockId(3)).cmds[1] {
            Cmd::Jmp { target, .. } => assert_eq!(*target, BlockId(4)),
            _ => panic!("expected Jmp to the shifted body"),
        }
        assert!(matches!(f.block(BlockId(4)).cmds[0], Cmd::Nop { .. }));
    }

    #[test]
    fn writes_to_the_iteration_variable_disable_the_whole_loop() {
        let f = Function {
            typ: FunctionType {
                arg_types: vec![],
                ret_types: vec![],
            },
            vars: vec![
                Var { name: "arr".into(), typ: Type::Array(Box::new(Type::Integer)), loc: Loc::default() },
                Var { name: "i".into(), typ: Type::Integer, loc: Loc::default() },
            ],
            ret_vars: vec![],
            captured_vars: vec![],
            blocks: vec![
                BasicBlock::new(vec![
                    Cmd::NewArr {
                        loc: Loc::default(),
                        dst: VarId(1),
                        elem_typ: Type::Integer,
                        src_n: Value::Integer(10),
                    },
                    Cmd::Jmp { loc: Loc::default(), target: BlockId(2) },
                ]),
                BasicBlock::new(vec![Cmd::JmpIf {
                    loc: Loc::default(),
                    cond: Value::Bool(true),
                    target_true: BlockId(3),
                    target_false: BlockId(4),
                }]),
                BasicBlock::new(vec![
                    Cmd::RenormArr {
                        loc: Loc::default(),
                        src_arr: Value::LocalVar(VarId(1)),
                        src_i: Value::LocalVar(VarId(2)),
                    },
                    Cmd::Move {
                        loc: Loc::default(),
                        dst: VarId(2),
                        src: Value::Integer(0),
                    },
                    Cmd::Jmp { loc: Loc::default(), target: BlockId(2) },
                ]),
                BasicBlock::new(vec![]),
            ],
            f_id_of_upvalue: Map::new(),
            f_id_of_local: Map::new(),
            for_loops: vec![Loop {
                prep_block_id: BlockId(2),
                body_first_block_id: BlockId(3),
                body_last_block_id: BlockId(3),
                iteration_variable_id: VarId(2),
                limit_value: Value::Integer(10),
                step_is_positive: true,
                loc: Loc::default(),
            }],
            loc: Loc::default(),
        };

        let mut f = f;
        let count = run(&mut f);
        assert_eq!(count, 0);
        assert_eq!(f.blocks.len(), 4);
    }
}
