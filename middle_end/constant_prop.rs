//! Constant propagation and folding (§4.3): a per-variable {Undef, Constant,
//! Nac} lattice over scalar-typed locals, plus a module-level pre-pass that
//! threads constant upvalues from `InitUpvalues` call sites into their
//! callees before each callee's own propagation runs.

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use crate::ir::util::{self, Cfg};
use crate::ir::{is_constant, BlockId, Cmd, FuncId, Function, Module, UpvalId, Value, VarId};

use super::dataflow::{self, Direction, Framework};

#[derive(Clone, Debug, PartialEq)]
enum ConstLattice {
    Undef,
    Constant(Value),
    Nac,
}

fn join_lattice(a: &ConstLattice, b: &ConstLattice) -> ConstLattice {
    use ConstLattice::*;
    match (a, b) {
        (Nac, _) | (_, Nac) => Nac,
        (Undef, other) | (other, Undef) => other.clone(),
        (Constant(x), Constant(y)) => {
            if x == y {
                Constant(x.clone())
            } else {
                Nac
            }
        }
    }
}

type Env = Map<VarId, ConstLattice>;

struct ConstPropFramework;

impl Framework for ConstPropFramework {
    type State = Env;

    fn direction(&self) -> Direction {
        Direction::Forward
    }

    fn identity(&self) -> Env {
        Env::new()
    }

    fn entry_value(&self, f: &Function) -> Env {
        let mut env = Env::new();
        for id in f.var_ids() {
            if f.var(id).typ.is_scalar() {
                let v = if f.is_param(id) {
                    ConstLattice::Nac
                } else {
                    ConstLattice::Undef
                };
                env.insert(id, v);
            }
        }
        env
    }

    fn join(&self, a: &Env, b: &Env) -> Env {
        let keys: Set<VarId> = a.keys().chain(b.keys()).cloned().collect();
        let mut out = Env::new();
        for k in keys {
            let av = a.get(&k).cloned().unwrap_or(ConstLattice::Undef);
            let bv = b.get(&k).cloned().unwrap_or(ConstLattice::Undef);
            out.insert(k, join_lattice(&av, &bv));
        }
        out
    }

    fn transfer(&self, f: &Function, block: BlockId, cmd_idx: usize, state: &Env) -> Env {
        let mut env = state.clone();
        let cmd = &f.block(block).cmds[cmd_idx];
        match cmd {
            Cmd::Move { dst, src, .. } if f.var(*dst).typ.is_scalar() => {
                let val = match src {
                    Value::Upvalue(_) => ConstLattice::Nac,
                    Value::LocalVar(id) => env.get(id).cloned().unwrap_or(ConstLattice::Undef),
                    literal => {
                        debug_assert!(is_constant(literal), "non-reference Move source must be a literal");
                        ConstLattice::Constant(literal.clone())
                    }
                };
                env.insert(*dst, val);
            }
            _ => {
                for dst in util::dests(cmd) {
                    if f.var(dst).typ.is_scalar() {
                        env.insert(dst, ConstLattice::Nac);
                    }
                }
            }
        }
        env
    }
}

/// Rewrite every `Value::Upvalue` whose slot is recorded in `known` with its
/// constant, in place. Run before the per-function dataflow pass.
fn rewrite_known_upvalues(f: &mut Function, known: &Map<UpvalId, Value>) {
    if known.is_empty() {
        return;
    }
    for block in &mut f.blocks {
        for cmd in &mut block.cmds {
            for v in util::sources_mut(cmd) {
                if let Value::Upvalue(u) = v {
                    if let Some(val) = known.get(u) {
                        *v = val.clone();
                    }
                }
            }
        }
    }
}

/// Scan `f`'s `InitUpvalues` commands, recording any literal argument as a
/// known constant for the target function's corresponding upvalue slot.
fn collect_constant_upvalues(f: &Function, constant_upvalues: &mut Map<FuncId, Map<UpvalId, Value>>) {
    for block in &f.blocks {
        for cmd in &block.cmds {
            if let Cmd::InitUpvalues { f_id, srcs, .. } = cmd {
                for (i, src) in srcs.iter().enumerate() {
                    if is_constant(src) {
                        constant_upvalues
                            .entry(*f_id)
                            .or_default()
                            .insert(UpvalId::from_index(i), src.clone());
                    }
                }
            }
        }
    }
}

/// Run the dataflow pass on a single function and rewrite every scalar
/// source that the analysis proved constant.
fn run_function(f: &mut Function) {
    let cfg = Cfg::new(f);
    let result = dataflow::analyze(&ConstPropFramework, f, &cfg);

    for block in f.block_ids() {
        let n = f.block(block).cmds.len();
        for idx in 0..n {
            let before = result.before(block, idx).clone();
            let cmd = &mut f.block_mut(block).cmds[idx];
            for v in util::sources_mut(cmd) {
                if let Value::LocalVar(id) = v {
                    if let Some(ConstLattice::Constant(val)) = before.get(id) {
                        *v = val.clone();
                    }
                }
            }
        }
    }
}

/// Run constant propagation over every function in the module, in
/// declaration order, threading constant upvalues from each function's own
/// `InitUpvalues` call sites into the functions that come after it (§4.3's
/// pre-pass). A call graph cycle in this threading converges to a sound,
/// if not maximally precise, result after one sweep — a second module-wide
/// iteration would only improve precision, never correctness (§9).
pub fn run(module: &mut Module) {
    let mut constant_upvalues: Map<FuncId, Map<UpvalId, Value>> = Map::new();
    let func_ids: Vec<FuncId> = module.func_ids().collect();

    for fid in func_ids {
        if let Some(known) = constant_upvalues.get(&fid).cloned() {
            rewrite_known_upvalues(module.function_mut(fid), &known);
        }
        run_function(module.function_mut(fid));
        collect_constant_upvalues(module.function(fid), &mut constant_upvalues);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BasicBlock, FunctionType, Loc, Type, Var};

    fn single_block_fn(arg_types: Vec<Type>, vars: Vec<Var>, cmds: Vec<Cmd>) -> Function {
        Function {
            typ: FunctionType {
                arg_types,
                ret_types: vec![],
            },
            vars,
            ret_vars: vec![],
            captured_vars: vec![],
            blocks: vec![BasicBlock::new(cmds)],
            f_id_of_upvalue: Map::new(),
            f_id_of_local: Map::new(),
            for_loops: vec![],
            loc: Loc::default(),
        }
    }

    #[test]
    fn folds_a_chain_of_moves_from_a_literal() {
        // v1 = 7; v2 = v1; read v2 should fold to literal 7.
        let mut f = single_block_fn(
            vec![],
            vec![
                Var {
                    name: "a".into(),
                    typ: Type::Integer,
                    loc: Loc::default(),
                },
                Var {
                    name: "b".into(),
                    typ: Type::Integer,
                    loc: Loc::default(),
                },
                Var {
                    name: "c".into(),
                    typ: Type::Integer,
                    loc: Loc::default(),
                },
            ],
            vec![
                Cmd::Move {
                    loc: Loc::default(),
                    dst: VarId(1),
                    src: Value::Integer(7),
                },
                Cmd::Move {
                    loc: Loc::default(),
                    dst: VarId(2),
                    src: Value::LocalVar(VarId(1)),
                },
                Cmd::Move {
                    loc: Loc::default(),
                    dst: VarId(3),
                    src: Value::LocalVar(VarId(2)),
                },
            ],
        );
        run_function(&mut f);
        match &f.blocks[0].cmds[2] {
            Cmd::Move { src, .. } => assert_eq!(*src, Value::Integer(7)),
            _ => panic!("expected Move"),
        }
    }

    #[test]
    fn parameters_are_not_a_constant() {
        let mut f = single_block_fn(
            vec![Type::Integer],
            vec![
                Var {
                    name: "a".into(),
                    typ: Type::Integer,
                    loc: Loc::default(),
                },
                Var {
                    name: "b".into(),
                    typ: Type::Integer,
                    loc: Loc::default(),
                },
            ],
            vec![Cmd::Move {
                loc: Loc::default(),
                dst: VarId(2),
                src: Value::LocalVar(VarId(1)),
            }],
        );
        run_function(&mut f);
        match &f.blocks[0].cmds[0] {
            Cmd::Move { src, .. } => assert_eq!(*src, Value::LocalVar(VarId(1))),
            _ => panic!("expected Move"),
        }
    }

    #[test]
    fn constant_upvalue_from_a_caller_is_threaded_into_the_callee() {
        // caller (fn 1) calls callee (fn 2) via InitUpvalues with a literal.
        let caller = single_block_fn(
            vec![],
            vec![],
            vec![Cmd::InitUpvalues {
                loc: Loc::default(),
                f_id: FuncId(2),
                srcs: vec![Value::Integer(9)],
            }],
        );
        let mut callee = single_block_fn(
            vec![],
            vec![Var {
                name: "x".into(),
                typ: Type::Integer,
                loc: Loc::default(),
            }],
            vec![Cmd::Move {
                loc: Loc::default(),
                dst: VarId(1),
                src: Value::Upvalue(UpvalId(1)),
            }],
        );
        callee.captured_vars.push(crate::ir::Upvalue {
            name: "u".into(),
            typ: Type::Integer,
            loc: Loc::default(),
        });

        let mut module = Module {
            functions: vec![caller, callee],
            record_types: Map::new(),
        };
        run(&mut module);

        match &module.functions[1].blocks[0].cmds[0] {
            Cmd::Move { src, .. } => assert_eq!(*src, Value::Integer(9)),
            _ => panic!("expected Move"),
        }
    }
}
