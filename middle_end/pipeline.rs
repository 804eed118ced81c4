//! The driver that runs a full middle-end pass over a module (§2 "control
//! flow of a full middle-end pass"): uninitialized-variable checking first
//! (errors abort before any rewrite touches the module), then constant
//! propagation, inlining, renormalize hoisting, GC-check consolidation, and
//! finally per-function GC info for the code generator.

use std::collections::BTreeMap as Map;

use log::info;

use crate::commons::Diagnostic;
use crate::ir::{FuncId, Module};

use super::gc_info::{self, GcInfo};
use super::{constant_prop, inline, renormalize, uninit};

/// Everything a code generator needs after a successful pass (§6).
pub struct PipelineOutcome {
    pub module: Module,
    pub gc_info: Map<FuncId, GcInfo>,
    pub moved_checkgc: u32,
    pub removed_checkgc: u32,
    pub renormalizes: u32,
}

/// Run the full middle-end pipeline over `module`. On any use-before-init or
/// missing-return diagnostic, no rewriting pass runs at all and the
/// diagnostics are returned instead (§7).
pub fn run_pipeline(mut module: Module) -> Result<PipelineOutcome, Vec<Diagnostic>> {
    let errors = uninit::check_module(&module);
    if !errors.is_empty() {
        return Err(errors.into_iter().map(|e| e.into_diagnostic()).collect());
    }

    constant_prop::run(&mut module);
    inline::run(&mut module);
    let renormalizes: u32 = module
        .func_ids()
        .collect::<Vec<_>>()
        .into_iter()
        .map(|fid| renormalize::run(module.function_mut(fid)))
        .sum();

    let mut moved_checkgc = 0u32;
    let mut removed_checkgc = 0u32;
    for fid in module.func_ids().collect::<Vec<_>>() {
        let (moved, removed) = gc_info::move_checkgc(module.function_mut(fid));
        moved_checkgc += moved;
        removed_checkgc += removed;
    }

    let mut gc_info_by_func: Map<FuncId, GcInfo> = Map::new();
    for fid in module.func_ids() {
        gc_info_by_func.insert(fid, gc_info::compute(module.function(fid)));
    }

    info!("moved checkgc: {moved_checkgc}");
    info!("removed checkgc: {removed_checkgc}");
    info!("renormalizes: {renormalizes}");

    Ok(PipelineOutcome {
        module,
        gc_info: gc_info_by_func,
        moved_checkgc,
        removed_checkgc,
        renormalizes,
    })
}
