//! Static-call inlining (§4.6): splices a statically-resolvable callee's CFG
//! directly into the caller at the call site, replacing the `CallStatic`
//! with argument/return `Move`s. Recursive call chains are left un-inlined —
//! an explicit set of function-ids currently being spliced into the current
//! caller acts as the inlining stack the source notes call for.

use std::collections::BTreeMap as Map;
use std::collections::BTreeSet as Set;

use crate::ir::util;
use crate::ir::{BasicBlock, BlockId, Cmd, FuncId, Function, Loop, Module, UpvalId, Value, VarId};

/// Resolve a `CallStatic`'s `src_f` to a statically-known callee, if any.
fn resolve_callee(f: &Function, src_f: &Value) -> Option<FuncId> {
    match src_f {
        Value::Upvalue(u) => f.f_id_of_upvalue.get(u).copied(),
        Value::LocalVar(v) => f.f_id_of_local.get(v).copied(),
        _ => None,
    }
}

/// First call site (in block/command order) whose callee is statically known
/// and not already on `stack`.
fn find_next_inlinable_call(f: &Function, stack: &Set<FuncId>) -> Option<(BlockId, usize, FuncId)> {
    for b in f.block_ids() {
        for (idx, cmd) in f.block(b).cmds.iter().enumerate() {
            if let Cmd::CallStatic { src_f, .. } = cmd {
                if let Some(callee_id) = resolve_callee(f, src_f) {
                    if !stack.contains(&callee_id) {
                        return Some((b, idx, callee_id));
                    }
                }
            }
        }
    }
    None
}

fn map_targets(cmd: &mut Cmd, f: &dyn Fn(BlockId) -> BlockId) {
    match cmd {
        Cmd::Jmp { target, .. } => *target = f(*target),
        Cmd::JmpIf {
            target_true,
            target_false,
            ..
        } => {
            *target_true = f(*target_true);
            *target_false = f(*target_false);
        }
        _ => {}
    }
}

/// Splice `callee_id`'s body into `caller_id` at `call_block`/`call_idx`,
/// per §4.6's renumbering rules. Every id used below is described relative
/// to the caller's blocks *before* this splice.
fn splice_call(module: &mut Module, caller_id: FuncId, call_block: BlockId, call_idx: usize, callee_id: FuncId) {
    let mut callee = module.function(callee_id).clone();

    let caller_var_base = module.function(caller_id).vars.len();
    let caller_upval_base = module.function(caller_id).captured_vars.len();

    let var_map = |old: VarId| VarId::from_index(caller_var_base + old.index());
    let upval_map = |old: UpvalId| UpvalId::from_index(caller_upval_base + old.index());

    // Renumber every var/upvalue the callee's own commands reference, and
    // shift its internal jump targets into the block-id space they'll
    // occupy once spliced in (§4.6: callee targets shift by call_block - 1).
    let block_shift_into_caller = call_block.0 as i64 - 1;
    for block in &mut callee.blocks {
        for cmd in &mut block.cmds {
            for v in util::sources_mut(cmd) {
                match v {
                    Value::LocalVar(id) => *id = var_map(*id),
                    Value::Upvalue(id) => *id = upval_map(*id),
                    _ => {}
                }
            }
            for d in util::dests_mut(cmd) {
                *d = var_map(*d);
            }
            map_targets(cmd, &|t| BlockId((t.0 as i64 + block_shift_into_caller) as u32));
        }
    }
    let callee_ret_vars: Vec<VarId> = callee.ret_vars.iter().map(|&v| var_map(v)).collect();
    let num_callee_blocks = callee.blocks.len() as u32;

    let callee_f_id_of_upvalue: Vec<(UpvalId, FuncId)> = callee
        .f_id_of_upvalue
        .iter()
        .map(|(&u, &fid)| (upval_map(u), fid))
        .collect();
    let callee_f_id_of_local: Vec<(VarId, FuncId)> = callee
        .f_id_of_local
        .iter()
        .map(|(&v, &fid)| (var_map(v), fid))
        .collect();

    // The callee's own loop metadata, renumbered into the caller's block/var
    // space the same way its commands are above, to be appended to the
    // caller's `for_loops` once spliced in.
    let callee_for_loops: Vec<Loop> = callee
        .for_loops
        .iter()
        .map(|l| Loop {
            prep_block_id: BlockId((l.prep_block_id.0 as i64 + block_shift_into_caller) as u32),
            body_first_block_id: BlockId((l.body_first_block_id.0 as i64 + block_shift_into_caller) as u32),
            body_last_block_id: BlockId((l.body_last_block_id.0 as i64 + block_shift_into_caller) as u32),
            iteration_variable_id: var_map(l.iteration_variable_id),
            limit_value: match &l.limit_value {
                Value::LocalVar(id) => Value::LocalVar(var_map(*id)),
                Value::Upvalue(id) => Value::Upvalue(upval_map(*id)),
                other => other.clone(),
            },
            step_is_positive: l.step_is_positive,
            loc: l.loc,
        })
        .collect();

    {
        let caller = module.function_mut(caller_id);
        caller.vars.extend(callee.vars);
        caller.captured_vars.extend(callee.captured_vars);
        for (u, fid) in callee_f_id_of_upvalue {
            caller.f_id_of_upvalue.insert(u, fid);
        }
        for (v, fid) in callee_f_id_of_local {
            caller.f_id_of_local.insert(v, fid);
        }

        // Shift the caller's own pre-existing jump targets that point past
        // the call block: every later block moves up by (callee blocks - 1)
        // since the call block itself is absorbed into the spliced region,
        // not displaced by it.
        let delta = num_callee_blocks as i64 - 1;
        for block in &mut caller.blocks {
            for cmd in &mut block.cmds {
                map_targets(cmd, &|t| {
                    if t.0 > call_block.0 {
                        BlockId((t.0 as i64 + delta) as u32)
                    } else {
                        t
                    }
                });
            }
        }

        // The caller's own pre-existing loop metadata names blocks the same
        // way jump targets do, so it shifts by the same rule — before any
        // callee loops are appended, so the newly-appended entries (already
        // in their final numbering) aren't shifted a second time.
        let shift_loop_block = |b: BlockId| {
            if b.0 > call_block.0 {
                BlockId((b.0 as i64 + delta) as u32)
            } else {
                b
            }
        };
        for l in &mut caller.for_loops {
            l.prep_block_id = shift_loop_block(l.prep_block_id);
            l.body_first_block_id = shift_loop_block(l.body_first_block_id);
            l.body_last_block_id = shift_loop_block(l.body_last_block_id);
        }
        caller.for_loops.extend(callee_for_loops);
    }

    let caller = module.function_mut(caller_id);
    let original_cmds = std::mem::take(&mut caller.block_mut(call_block).cmds);
    let mut before: Vec<Cmd> = Vec::new();
    let mut after: Vec<Cmd> = Vec::new();
    let mut call_cmd: Option<Cmd> = None;
    for (i, cmd) in original_cmds.into_iter().enumerate() {
        if i < call_idx {
            before.push(cmd);
        } else if i == call_idx {
            call_cmd = Some(cmd);
        } else {
            after.push(cmd);
        }
    }
    let (call_loc, dsts, srcs_args) = match call_cmd.expect("call_idx must name the CallStatic") {
        Cmd::CallStatic { loc, dsts, srcs, .. } => (loc, dsts, srcs),
        _ => panic!("splice_call invoked on a non-CallStatic command"),
    };

    // Argument moves, one per callee parameter, prepended to the first
    // spliced block.
    let arg_moves: Vec<Cmd> = srcs_args
        .into_iter()
        .enumerate()
        .map(|(i, src)| Cmd::Move {
            loc: call_loc,
            dst: var_map(VarId::from_index(i)),
            src,
        })
        .collect();

    // Return moves, copying each callee return var into the call's
    // destination, appended to the last spliced block.
    let ret_moves: Vec<Cmd> = dsts
        .iter()
        .zip(callee_ret_vars.iter())
        .map(|(&dst, &ret_var)| Cmd::Move {
            loc: call_loc,
            dst,
            src: Value::LocalVar(ret_var),
        })
        .collect();

    let mut spliced_blocks: Vec<BasicBlock> = callee.blocks;
    {
        let first = &mut spliced_blocks[0];
        let mut head = before;
        head.extend(arg_moves);
        head.extend(std::mem::take(&mut first.cmds));
        first.cmds = head;
    }
    {
        let last = spliced_blocks.last_mut().expect("callee has at least one block");
        last.cmds.extend(ret_moves);
        last.cmds.extend(after);
    }

    // The original call block is absorbed into the first spliced block;
    // the rest are inserted immediately after it, already in their final
    // (shifted) positions.
    *caller.block_mut(call_block) = spliced_blocks.remove(0);
    let mut insert_at = call_block.index() + 1;
    for b in spliced_blocks {
        caller.blocks.insert(insert_at, b);
        insert_at += 1;
    }
}

fn inline_in_function(module: &mut Module, func_id: FuncId, stack: &mut Set<FuncId>) {
    loop {
        let next = find_next_inlinable_call(module.function(func_id), stack);
        let Some((b, idx, callee_id)) = next else {
            return;
        };
        splice_call(module, func_id, b, idx, callee_id);
        stack.insert(callee_id);
        inline_in_function(module, func_id, stack);
        stack.remove(&callee_id);
    }
}

/// Inline every statically-resolvable, non-recursive call in `module`,
/// function by function.
pub fn run(module: &mut Module) {
    for func_id in module.func_ids().collect::<Vec<_>>() {
        let mut stack = Set::new();
        stack.insert(func_id);
        inline_in_function(module, func_id, &mut stack);
    }
}
