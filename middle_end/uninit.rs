//! Uninitialized-variable and missing-return detection (§4.2).
//!
//! A forward set-union dataflow over var-ids: the lattice element at a
//! program point is "the var-ids that may still be uninitialized here".
//! Parameters start initialized; every other local starts in the set.

use std::collections::BTreeSet as Set;

use crate::commons::AnalysisError;
use crate::ir::util::{self, Cfg};
use crate::ir::{Cmd, Function, Module, Value, VarId};

use super::dataflow::{self, CmdTransfer, Direction, GenKill, SetOp};

struct UninitTransfer<'a> {
    module: &'a Module,
}

impl<'a> UninitTransfer<'a> {
    /// An upvalue-box `NewRecord` does not initialize its destination; the
    /// box is only initialized by the later `SetField` that writes into it.
    fn is_upvalue_box_alloc(&self, cmd: &Cmd) -> bool {
        matches!(
            cmd,
            Cmd::NewRecord { rec_typ, .. }
                if self.module.record_types.get(rec_typ).map(|r| r.is_upvalue_box).unwrap_or(false)
        )
    }

    fn upvalue_box_write(&self, cmd: &Cmd) -> Option<VarId> {
        match cmd {
            Cmd::SetField { src_rec, rec_typ, .. }
                if self
                    .module
                    .record_types
                    .get(rec_typ)
                    .map(|r| r.is_upvalue_box)
                    .unwrap_or(false) =>
            {
                match src_rec {
                    Value::LocalVar(id) => Some(*id),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

impl<'a> CmdTransfer<VarId> for UninitTransfer<'a> {
    fn cmd_transfer(
        &self,
        f: &Function,
        block: crate::ir::BlockId,
        cmd_idx: usize,
        gk: &mut GenKill<VarId>,
    ) {
        let cmd = &f.block(block).cmds[cmd_idx];

        if let Some(boxed) = self.upvalue_box_write(cmd) {
            gk.kill(boxed);
            return;
        }

        if self.is_upvalue_box_alloc(cmd) {
            // Destination deliberately NOT killed: the box stays
            // uninitialized until the matching SetField above.
            return;
        }

        for dst in util::dests(cmd) {
            gk.kill(dst);
        }
    }
}

/// The values a command reads for the purpose of use-before-init reporting:
/// identical to [`util::sources`] except that an upvalue-box `SetField`
/// reports only the value being stored (`src_v`), not the box reference
/// being written into (`src_rec`).
fn reported_sources<'a>(transfer: &UninitTransfer, cmd: &'a Cmd) -> Vec<&'a Value> {
    if transfer.upvalue_box_write(cmd).is_some() {
        match cmd {
            Cmd::SetField { src_v, .. } => vec![src_v],
            _ => unreachable!(),
        }
    } else {
        util::sources(cmd)
    }
}

/// Run the analysis over a single function, returning one diagnostic per
/// use-before-init site plus, if applicable, a missing-return diagnostic.
pub fn check_function(module: &Module, f: &Function) -> Vec<AnalysisError> {
    let cfg = Cfg::new(f);
    let entry: Set<VarId> = f
        .var_ids()
        .filter(|id| !f.is_param(*id))
        .collect();

    let transfer = UninitTransfer { module };
    let result = dataflow::analyze_set(Direction::Forward, SetOp::Union, entry, &transfer, f, &cfg);

    let mut errors = Vec::new();
    let mut reported: Set<VarId> = Set::new();

    for block in f.block_ids() {
        let cmds = &f.block(block).cmds;
        for (idx, cmd) in cmds.iter().enumerate() {
            let before = result.before(block, idx);
            for v in reported_sources(&transfer, cmd) {
                if let Value::LocalVar(id) = v {
                    if before.contains(id) && reported.insert(*id) {
                        errors.push(AnalysisError::UseBeforeInit {
                            var: f.var(*id).name.clone(),
                            loc: cmd.loc(),
                        });
                    }
                }
            }
        }
    }

    if !f.typ.ret_types.is_empty() {
        if let Some(&first_ret) = f.ret_vars.first() {
            let finish = &result.exit[&f.last_block()];
            if finish.contains(&first_ret) {
                errors.push(AnalysisError::MissingReturn { loc: f.loc });
            }
        }
    }

    errors
}

/// Run the analysis over every function in the module. A non-empty result
/// means the module must be rejected before any later pass runs (§4.2, §7).
pub fn check_module(module: &Module) -> Vec<AnalysisError> {
    module
        .functions
        .iter()
        .flat_map(|f| check_function(module, f))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BasicBlock, FunctionType, Loc, Type, Var};
    use std::collections::BTreeMap as Map;

    fn module_with(f: Function) -> Module {
        Module {
            functions: vec![f],
            record_types: Map::new(),
        }
    }

    #[test]
    fn reports_use_of_unassigned_local() {
        // S1: function f(): return x, x declared but never assigned.
        let f = Function {
            typ: FunctionType {
                arg_types: vec![],
                ret_types: vec![Type::Integer],
            },
            vars: vec![Var {
                name: "x".into(),
                typ: Type::Integer,
                loc: Loc::default(),
            }],
            ret_vars: vec![VarId(1)],
            captured_vars: vec![],
            blocks: vec![BasicBlock::new(vec![])],
            f_id_of_upvalue: Map::new(),
            f_id_of_local: Map::new(),
            for_loops: vec![],
            loc: Loc::default(),
        };
        let errors = check_function(&module_with(f.clone()), &f);
        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], AnalysisError::MissingReturn { .. }));
    }

    #[test]
    fn parameters_start_initialized() {
        let f = Function {
            typ: FunctionType {
                arg_types: vec![Type::Integer],
                ret_types: vec![Type::Integer],
            },
            vars: vec![Var {
                name: "x".into(),
                typ: Type::Integer,
                loc: Loc::default(),
            }],
            ret_vars: vec![VarId(1)],
            captured_vars: vec![],
            blocks: vec![BasicBlock::new(vec![])],
            f_id_of_upvalue: Map::new(),
            f_id_of_local: Map::new(),
            for_loops: vec![],
            loc: Loc::default(),
        };
        let errors = check_function(&module_with(f.clone()), &f);
        assert!(errors.is_empty());
    }

    #[test]
    fn reports_read_before_move() {
        let f = Function {
            typ: FunctionType {
                arg_types: vec![],
                ret_types: vec![],
            },
            vars: vec![
                Var {
                    name: "x".into(),
                    typ: Type::Integer,
                    loc: Loc::default(),
                },
                Var {
                    name: "y".into(),
                    typ: Type::Integer,
                    loc: Loc::default(),
                },
            ],
            ret_vars: vec![],
            captured_vars: vec![],
            blocks: vec![BasicBlock::new(vec![Cmd::Move {
                loc: Loc { line: 5, col: 1 },
                dst: VarId(2),
                src: Value::LocalVar(VarId(1)),
            }])],
            f_id_of_upvalue: Map::new(),
            f_id_of_local: Map::new(),
            for_loops: vec![],
            loc: Loc::default(),
        };
        let errors = check_function(&module_with(f.clone()), &f);
        assert_eq!(errors.len(), 1);
        match &errors[0] {
            AnalysisError::UseBeforeInit { var, loc } => {
                assert_eq!(var, "x");
                assert_eq!(*loc, Loc { line: 5, col: 1 });
            }
            _ => panic!("expected UseBeforeInit"),
        }
    }
}
