//! The intermediate representation consumed and produced by the middle end.
//!
//! This is the data model described by the front end's contract: a module is
//! an ordered sequence of functions, each of which owns a dense array of
//! variables, a dense array of basic blocks forming a CFG, and a dense array
//! of captured-upvalue descriptors.  Ids are 1-based throughout (the source
//! language this core serves lowers from a 1-indexed host), so `VarId(1)` is
//! always the first variable and `BlockId(1)` is always the entry block.
//!
//! Nothing in here performs validation beyond the structural checks in
//! [`validate`]; type checking happens in the front end, which is out of
//! scope for this crate.

use std::collections::BTreeMap as Map;
use std::fmt;

use derive_more::Display;
use serde::{Deserialize, Serialize};

pub mod util;

pub use util::Cfg;

// SECTION: dense ids

macro_rules! dense_id {
    ($name:ident, $prefix:literal) => {
        #[derive(
            Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub u32);

        impl $name {
            /// Convert a 1-based id into a 0-based index into its owning `Vec`.
            pub fn index(self) -> usize {
                debug_assert!(self.0 >= 1, "{} ids are 1-based", $prefix);
                (self.0 - 1) as usize
            }

            pub fn from_index(idx: usize) -> Self {
                Self((idx + 1) as u32)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }
    };
}

dense_id!(FuncId, "f");
dense_id!(VarId, "v");
dense_id!(UpvalId, "u");
dense_id!(BlockId, "b");
dense_id!(StructId, "s");
dense_id!(FieldId, "d");

/// An instruction id: the basic block it lives in plus its 0-based index in
/// that block's command list.
pub type InstId = (BlockId, usize);

// SECTION: source locations

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Loc {
    pub line: u32,
    pub col: u32,
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

// SECTION: types

/// The types of values that flow through the IR.
///
/// `is_gc` decides whether a variable of this type needs mirroring to the
/// host runtime's value stack at GC-safe points (§4.4).  Scalars `Nil`,
/// `Bool`, `Integer`, `Float` are unboxed and not GC-managed; `Str`, `Array`,
/// `Record` and `Function` values live on the GC heap.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Type {
    Nil,
    Bool,
    Integer,
    Float,
    Str,
    Array(Box<Type>),
    Record(StructId),
    Function {
        arg_types: Vec<Type>,
        ret_types: Vec<Type>,
    },
}

impl Type {
    pub fn is_gc(&self) -> bool {
        !matches!(self, Type::Nil | Type::Bool | Type::Integer | Type::Float)
    }

    /// True for the five scalar types eligible for constant propagation
    /// (§4.3).  Note this is a strictly larger set than "not GC": `Str` is
    /// both GC-managed and constant-propagation eligible.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Type::Nil | Type::Bool | Type::Integer | Type::Float | Type::Str
        )
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Nil => write!(f, "nil"),
            Type::Bool => write!(f, "bool"),
            Type::Integer => write!(f, "integer"),
            Type::Float => write!(f, "float"),
            Type::Str => write!(f, "string"),
            Type::Array(elem) => write!(f, "array[{elem}]"),
            Type::Record(id) => write!(f, "record({id})"),
            Type::Function {
                arg_types,
                ret_types,
            } => {
                write!(f, "(")?;
                for (i, t) in arg_types.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{t}")?;
                }
                write!(f, ") -> (")?;
                for (i, t) in ret_types.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{t}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Record-type metadata, kept at module scope so that `NewRecord`/`SetField`
/// commands can refer to a record type by its dense id rather than embedding
/// a full field list at every use site.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordTypeInfo {
    pub fields: Vec<Type>,
    /// Upvalue boxes are allocated like any other record, but §3's
    /// lifecycle invariant treats them as uninitialized until the first
    /// `SetField` targeting them (§4.2).
    pub is_upvalue_box: bool,
}

// SECTION: values and variables

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Nil,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Str(String),
    LocalVar(VarId),
    Upvalue(UpvalId),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::LocalVar(v) => write!(f, "{v}"),
            Value::Upvalue(u) => write!(f, "{u}"),
        }
    }
}

/// True for the IR-literal variants of [`Value`] (everything but
/// `LocalVar`/`Upvalue`).  Used by the constant-value test named in §2 item 1.
pub fn is_constant(v: &Value) -> bool {
    matches!(
        v,
        Value::Nil | Value::Bool(_) | Value::Integer(_) | Value::Float(_) | Value::Str(_)
    )
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Var {
    pub name: String,
    pub typ: Type,
    pub loc: Loc,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Upvalue {
    pub name: String,
    pub typ: Type,
    pub loc: Loc,
}

// SECTION: commands

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Cmd {
    Move {
        loc: Loc,
        dst: VarId,
        src: Value,
    },
    CallStatic {
        loc: Loc,
        dsts: Vec<VarId>,
        src_f: Value,
        srcs: Vec<Value>,
    },
    CallDyn {
        loc: Loc,
        dsts: Vec<VarId>,
        src_f: Value,
        srcs: Vec<Value>,
    },
    NewArr {
        loc: Loc,
        dst: VarId,
        elem_typ: Type,
        src_n: Value,
    },
    GetArr {
        loc: Loc,
        dst: VarId,
        src_arr: Value,
        src_i: Value,
    },
    SetArr {
        loc: Loc,
        src_arr: Value,
        src_i: Value,
        src_v: Value,
    },
    RenormArr {
        loc: Loc,
        src_arr: Value,
        src_i: Value,
    },
    NewRecord {
        loc: Loc,
        dst: VarId,
        rec_typ: StructId,
    },
    SetField {
        loc: Loc,
        src_rec: Value,
        src_v: Value,
        rec_typ: StructId,
        field: FieldId,
    },
    InitUpvalues {
        loc: Loc,
        f_id: FuncId,
        srcs: Vec<Value>,
    },
    CheckGC {
        loc: Loc,
    },
    Jmp {
        loc: Loc,
        target: BlockId,
    },
    JmpIf {
        loc: Loc,
        cond: Value,
        target_true: BlockId,
        target_false: BlockId,
    },
    Nop {
        loc: Loc,
    },
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cmd::Move { dst, src, .. } => write!(f, "{dst} = {src}"),
            Cmd::CallStatic {
                dsts, src_f, srcs, ..
            } => {
                write!(f, "{} = call_static {src_f}(", fmt_list(dsts))?;
                write!(f, "{})", fmt_value_list(srcs))
            }
            Cmd::CallDyn {
                dsts, src_f, srcs, ..
            } => {
                write!(f, "{} = call_dyn {src_f}(", fmt_list(dsts))?;
                write!(f, "{})", fmt_value_list(srcs))
            }
            Cmd::NewArr {
                dst,
                elem_typ,
                src_n,
                ..
            } => write!(f, "{dst} = new_arr[{elem_typ}]({src_n})"),
            Cmd::GetArr {
                dst, src_arr, src_i, ..
            } => write!(f, "{dst} = {src_arr}[{src_i}]"),
            Cmd::SetArr {
                src_arr,
                src_i,
                src_v,
                ..
            } => write!(f, "{src_arr}[{src_i}] = {src_v}"),
            Cmd::RenormArr { src_arr, src_i, .. } => {
                write!(f, "renormalize({src_arr}, {src_i})")
            }
            Cmd::NewRecord { dst, rec_typ, .. } => write!(f, "{dst} = new_record({rec_typ})"),
            Cmd::SetField {
                src_rec,
                src_v,
                field,
                ..
            } => write!(f, "{src_rec}.{field} = {src_v}"),
            Cmd::InitUpvalues { f_id, srcs, .. } => {
                write!(f, "init_upvalues({f_id}, {})", fmt_value_list(srcs))
            }
            Cmd::CheckGC { .. } => write!(f, "check_gc"),
            Cmd::Jmp { target, .. } => write!(f, "jmp {target}"),
            Cmd::JmpIf {
                cond,
                target_true,
                target_false,
                ..
            } => write!(f, "jmp_if {cond} {target_true} {target_false}"),
            Cmd::Nop { .. } => write!(f, "nop"),
        }
    }
}

fn fmt_list<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|x| x.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn fmt_value_list(items: &[Value]) -> String {
    fmt_list(items)
}

impl Cmd {
    pub fn loc(&self) -> Loc {
        use Cmd::*;
        match self {
            Move { loc, .. }
            | CallStatic { loc, .. }
            | CallDyn { loc, .. }
            | NewArr { loc, .. }
            | GetArr { loc, .. }
            | SetArr { loc, .. }
            | RenormArr { loc, .. }
            | NewRecord { loc, .. }
            | SetField { loc, .. }
            | InitUpvalues { loc, .. }
            | CheckGC { loc }
            | Jmp { loc, .. }
            | JmpIf { loc, .. }
            | Nop { loc } => *loc,
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(self, Cmd::Jmp { .. } | Cmd::JmpIf { .. })
    }

    /// A GC-safe point: any command at which the GC may run (§4.4).
    pub fn is_gc_safe(&self) -> bool {
        matches!(
            self,
            Cmd::CallStatic { .. } | Cmd::CallDyn { .. } | Cmd::CheckGC { .. }
        )
    }
}

// SECTION: basic blocks

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BasicBlock {
    pub cmds: Vec<Cmd>,
}

impl BasicBlock {
    pub fn new(cmds: Vec<Cmd>) -> Self {
        BasicBlock { cmds }
    }

    pub fn terminator(&self) -> Option<&Cmd> {
        self.cmds.last().filter(|c| c.is_terminator())
    }
}

// SECTION: loops

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Loop {
    pub prep_block_id: BlockId,
    pub body_first_block_id: BlockId,
    pub body_last_block_id: BlockId,
    pub iteration_variable_id: VarId,
    pub limit_value: Value,
    pub step_is_positive: bool,
    pub loc: Loc,
}

// SECTION: functions

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FunctionType {
    pub arg_types: Vec<Type>,
    pub ret_types: Vec<Type>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Function {
    pub typ: FunctionType,
    pub vars: Vec<Var>,
    pub ret_vars: Vec<VarId>,
    pub captured_vars: Vec<Upvalue>,
    pub blocks: Vec<BasicBlock>,
    pub f_id_of_upvalue: Map<UpvalId, FuncId>,
    pub f_id_of_local: Map<VarId, FuncId>,
    pub for_loops: Vec<Loop>,
    pub loc: Loc,
}

impl Function {
    pub fn var(&self, id: VarId) -> &Var {
        &self.vars[id.index()]
    }

    pub fn var_mut(&mut self, id: VarId) -> &mut Var {
        &mut self.vars[id.index()]
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.index()]
    }

    pub fn entry_block(&self) -> BlockId {
        BlockId(1)
    }

    pub fn last_block(&self) -> BlockId {
        BlockId(self.blocks.len() as u32)
    }

    pub fn num_params(&self) -> usize {
        self.typ.arg_types.len()
    }

    pub fn is_param(&self, id: VarId) -> bool {
        id.0 as usize <= self.num_params()
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (1..=self.blocks.len() as u32).map(BlockId)
    }

    pub fn var_ids(&self) -> impl Iterator<Item = VarId> {
        (1..=self.vars.len() as u32).map(VarId)
    }

    pub fn upvalue_ids(&self) -> impl Iterator<Item = UpvalId> {
        (1..=self.captured_vars.len() as u32).map(UpvalId)
    }
}

// SECTION: modules

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Module {
    pub functions: Vec<Function>,
    pub record_types: Map<StructId, RecordTypeInfo>,
}

impl Module {
    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.index()]
    }

    pub fn function_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id.index()]
    }

    pub fn func_ids(&self) -> impl Iterator<Item = FuncId> {
        (1..=self.functions.len() as u32).map(FuncId)
    }
}

// SECTION: structural validation

/// A violation of one of §3's structural invariants.  The front end's type
/// checker is contractually responsible for never producing one of these;
/// encountering one here indicates a bug upstream of this crate, so we
/// report it as plain text rather than as an [`crate::commons::Diagnostic`].
#[derive(Debug, Display)]
#[display(fmt = "malformed IR: {_0}")]
pub struct MalformedIr(pub String);

impl std::error::Error for MalformedIr {}

/// Check the structural invariants listed in §3: every id referenced
/// resolves within its function, parameters occupy `1..=arg_count`, the
/// entry block has no predecessors, and exactly the last block lacks a
/// terminator.
pub fn validate(module: &Module) -> Result<(), MalformedIr> {
    for f in &module.functions {
        if f.vars.len() < f.num_params() {
            return Err(MalformedIr(format!(
                "function has {} params but only {} vars",
                f.num_params(),
                f.vars.len()
            )));
        }
        if f.blocks.is_empty() {
            return Err(MalformedIr("function has no basic blocks".into()));
        }

        let cfg = Cfg::new(f);
        for (i, block) in f.blocks.iter().enumerate() {
            let id = BlockId::from_index(i);
            let is_last = id == f.last_block();
            match block.terminator() {
                Some(_) if is_last => {
                    return Err(MalformedIr(format!(
                        "last block {id} must not terminate with a jump"
                    )))
                }
                None if !is_last => {
                    return Err(MalformedIr(format!(
                        "non-terminal block {id} is missing a terminator"
                    )))
                }
                _ => {}
            }
            for cmd in &block.cmds {
                for target in util::jump_targets(cmd) {
                    if target.index() >= f.blocks.len() {
                        return Err(MalformedIr(format!(
                            "block {id} jumps to out-of-range block {target}"
                        )));
                    }
                }
                for v in util::sources(cmd) {
                    if let Value::LocalVar(id) = v {
                        if id.index() >= f.vars.len() {
                            return Err(MalformedIr(format!("reference to out-of-range var {id}")));
                        }
                    }
                    if let Value::Upvalue(id) = v {
                        if id.index() >= f.captured_vars.len() {
                            return Err(MalformedIr(format!(
                                "reference to out-of-range upvalue {id}"
                            )));
                        }
                    }
                }
            }
        }
        if !cfg.pred(f.entry_block()).is_empty() {
            return Err(MalformedIr("entry block has predecessors".into()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_function() -> Function {
        Function {
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
        }
    }

    #[test]
    fn validates_minimal_function() {
        let module = Module {
            functions: vec![simple_function()],
            record_types: Map::new(),
        };
        assert!(validate(&module).is_ok());
    }

    #[test]
    fn rejects_jump_from_last_block() {
        let mut f = simple_function();
        f.blocks[0].cmds.push(Cmd::Jmp {
            loc: Loc::default(),
            target: BlockId(1),
        });
        let module = Module {
            functions: vec![f],
            record_types: Map::new(),
        };
        assert!(validate(&module).is_err());
    }

    #[test]
    fn is_gc_matches_scalar_vs_heap_types() {
        assert!(!Type::Integer.is_gc());
        assert!(!Type::Bool.is_gc());
        assert!(Type::Str.is_gc());
        assert!(Type::Array(Box::new(Type::Integer)).is_gc());
        assert!(Type::Record(StructId(1)).is_gc());
    }

    #[test]
    fn is_scalar_includes_string_but_not_arrays() {
        assert!(Type::Str.is_scalar());
        assert!(!Type::Array(Box::new(Type::Integer)).is_scalar());
    }
}
