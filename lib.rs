//! The middle-end optimization core: a generic dataflow framework and the
//! analyses/transforms built on it (uninitialized-variable detection,
//! constant propagation, GC-rooting information, array-renormalization
//! hoisting, and static-call inlining), driven to completion by
//! [`middle_end::pipeline::run_pipeline`].
//!
//! The front-end parser/type checker and the C code emitter are external
//! collaborators; this crate consumes and produces the `ir::Module` value
//! documented in `ir`.

pub mod commons;
pub mod ir;
pub mod middle_end;
