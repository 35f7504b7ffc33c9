//! The treenode specializer.
//!
//! `compile_treenode` runs at most once per node, under the
//! process-wide context lock: parse both reflect records, link the
//! callee into the caller, rewrite the observed call site into a
//! guarded direct call, optimize with an aggressive inliner, compile,
//! and swap the caller's fresh entry point into the parent node's
//! active target.
//!
//! Specializer state is deliberately leaked: emitted machine code must
//! outlive every pointer into it, which — with no deoptimization —
//! means process lifetime.

use crate::resolver::{process_symbols, ReflectedGlobals};
use crate::tree::{LandingSite, NodeState, Treenode};
use dashmap::DashMap;
use drti_core::SpecializeError;
use drti_ir::devirt::{self, CONVERTER_TOKEN};
use drti_ir::link::link_only_needed;
use drti_ir::module::{Linkage, Module};
use drti_ir::opt::{optimize_function, optimize_module, PipelineConfig};
use drti_ir::{bitcode, Function};
use drti_jit::{compile_module, CompiledModule, SymbolResolver};
use parking_lot::Mutex;
use std::sync::OnceLock;

/// One process-wide lock covers parse, link, rewrite, optimize,
/// compile and install. Specializations are serial; the accounting
/// fast paths never take it.
static CONTEXT_LOCK: Mutex<()> = Mutex::new(());

/// Compiled modules pinned for the process lifetime, keyed by the
/// treenode whose latch produced them.
fn leaked_modules() -> &'static DashMap<usize, &'static CompiledModule> {
    static REGISTRY: OnceLock<DashMap<usize, &'static CompiledModule>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

// =============================================================================
// Reflected modules
// =============================================================================

/// A decorated translation unit re-materialized from its reflect
/// record.
pub struct ReflectedModule {
    pub landing: &'static LandingSite,
    pub module: Module,
}

impl ReflectedModule {
    /// Parse the embedded bitcode. Eager: lazy materialization is
    /// known to corrupt destructor-like callees during optimization.
    pub fn parse(landing: &'static LandingSite) -> Result<Self, SpecializeError> {
        let bytes = unsafe { landing.reflect.bitcode() };
        let module = bitcode::read_module(bytes).map_err(|err| {
            log::error!(
                "drti: {} parse failed: {}",
                landing.function_name,
                err
            );
            SpecializeError::BitcodeParse(err.to_string())
        })?;
        log::info!(
            "drti: module for {} of size {}",
            landing.function_name,
            bytes.len()
        );
        Ok(ReflectedModule { landing, module })
    }

    /// The stored address table for this module.
    pub fn address_table(&self) -> &'static [usize] {
        unsafe { self.landing.reflect.address_table() }
    }

    /// The function this landing site names, which must exist in the
    /// parsed bitcode.
    pub fn callsite_function(&self) -> Result<&Function, SpecializeError> {
        self.module
            .function(self.landing.function_name)
            .ok_or_else(|| {
                log::error!(
                    "drti: {} not found in bitcode. Globals dump follows:",
                    self.landing.function_name
                );
                for func in &self.module.functions {
                    log::error!("drti: {}", func.name);
                }
                for global in &self.module.globals {
                    log::error!("drti: {}", global.name);
                }
                SpecializeError::SymbolNotFound {
                    name: self.landing.function_name.to_string(),
                }
            })
    }
}

// =============================================================================
// Specialization
// =============================================================================

/// Specialize the caller of a latched treenode and install the result
/// as the parent chain's active target.
pub fn compile_treenode(node: &'static Treenode) -> Result<(), SpecializeError> {
    let _guard = CONTEXT_LOCK.lock();

    debug_assert!(!node.parent.is_null());
    let parent: &'static Treenode = unsafe { &*node.parent };
    // The caller is the function containing this node's callsite; the
    // parent's landing, once set, names the same function.
    let caller_landing = node.location.landing;
    let callee_landing = node.landing().ok_or_else(|| {
        SpecializeError::CodegenFailure("treenode has no recorded landing".to_string())
    })?;

    let mut caller = ReflectedModule::parse(caller_landing)?;
    let mut callee = ReflectedModule::parse(callee_landing)?;
    caller.callsite_function()?;
    callee.callsite_function()?;

    let caller_fn = caller_landing.function_name;
    let callee_fn = callee_landing.function_name;
    log::info!(
        "drti: attempting to inline call from {} to {}",
        caller_fn,
        callee_fn
    );

    // The callee must be linkable and irresistible to the inliner; the
    // caller must stay visible so its address can be looked up after
    // compilation.
    {
        let func = callee
            .module
            .function_mut(callee_fn)
            .expect("checked above");
        func.linkage = Linkage::LinkOnce;
        func.always_inline = true;
    }
    {
        let func = caller
            .module
            .function_mut(caller_fn)
            .expect("checked above");
        func.linkage = Linkage::External;
    }

    // Built before linking, from each module in its own enumeration
    // order; this also promotes internal globals so the optimizer will
    // not emit second copies.
    let reflected = ReflectedGlobals::new(&mut caller, &mut callee)?;

    // Converter helpers carry used-semantics: nothing references them
    // until the rewrite does.
    let mut required: Vec<String> = vec![callee_fn.to_string()];
    for func in &callee.module.functions {
        if func.name.contains(CONVERTER_TOKEN) && !func.is_declaration() {
            required.push(func.name.clone());
        }
    }
    let required_refs: Vec<&str> = required.iter().map(String::as_str).collect();
    link_only_needed(&mut caller.module, &callee.module, &required_refs)?;

    devirt::rewrite_callsite(
        &mut caller.module,
        caller_fn,
        node.location.call_number,
        node.target as u64,
        callee_fn,
    )?;

    optimize_module(&mut caller.module, &PipelineConfig::aggressive());
    // The callee was optimized ahead of time; only the rewritten
    // caller gets the function-level sweep.
    optimize_function(&mut caller.module, caller_fn);

    let resolvers: [&dyn SymbolResolver; 2] = [&reflected, process_symbols()];
    let compiled = compile_module(&caller.module, &resolvers)?;
    let address = compiled.function_address(caller_fn).ok_or_else(|| {
        SpecializeError::CodegenFailure(format!("{} missing after codegen", caller_fn))
    })?;
    log::trace!("drti: {} compiled address {:#x}", caller_fn, address);

    // Pin the machine code for the process lifetime, then redirect the
    // chain to it.
    leaked_modules().insert(node as *const Treenode as usize, compiled.leak());
    parent.install_resolved(address as *const u8);
    node.set_state(NodeState::Resolved);

    Ok(())
}
