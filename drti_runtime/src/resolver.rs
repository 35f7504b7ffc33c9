//! Symbol generators for the JIT.
//!
//! [`ReflectedGlobals`] resolves lookups from the linked module
//! against the addresses the decorator stashed in the two reflect
//! records, so recompiled code shares every global, static-initializer
//! guard and external function with the already-running image.
//! [`ProcessSymbols`] is the fallback for runtime support symbols.

use crate::specialize::ReflectedModule;
use drti_core::SpecializeError;
use drti_ir::globals::is_listed_global;
use drti_ir::module::{Linkage, Module};
use drti_jit::SymbolResolver;
use rustc_hash::FxHashMap;
use std::sync::OnceLock;

// =============================================================================
// Reflected globals
// =============================================================================

/// Lookups using the global addresses stashed by the decorator.
///
/// Built from the two parsed modules *before* linking, walking each in
/// exactly the order the decorator used when recording its address
/// table. Any divergence is a programming error surfaced as
/// `address-table-mismatch`.
#[derive(Debug)]
pub struct ReflectedGlobals {
    map: FxHashMap<String, usize>,
}

impl ReflectedGlobals {
    pub fn new(
        first: &mut ReflectedModule,
        second: &mut ReflectedModule,
    ) -> Result<Self, SpecializeError> {
        let mut map = FxHashMap::default();
        Self::add_module(&mut map, first, &second.module)?;
        Self::add_module(&mut map, second, &first.module)?;
        Ok(ReflectedGlobals { map })
    }

    /// Consume one module's address table in enumeration order. Every
    /// listed entry consumes its slot, mapped or not, so the table is
    /// exactly spent when the walk completes.
    fn add_module(
        map: &mut FxHashMap<String, usize>,
        reflected: &mut ReflectedModule,
        available: &Module,
    ) -> Result<(), SpecializeError> {
        let table = reflected.address_table();
        let function_name = reflected.landing.function_name;
        let mut index = 0usize;

        let mut next_address = |index: &mut usize| -> Result<usize, SpecializeError> {
            if *index >= table.len() {
                log::error!(
                    "drti: {} module has {} globals but only {} stored addresses",
                    function_name,
                    *index + 1,
                    table.len()
                );
                return Err(SpecializeError::AddressTableMismatch {
                    listed: *index + 1,
                    stored: table.len(),
                });
            }
            let address = table[*index];
            *index += 1;
            Ok(address)
        };

        // Globals map unconditionally, declarations included. Unlike
        // function bodies, data has no recompilation analogue: a
        // second copy would fork live state, so even a global the
        // sibling module defines resolves to the stored address.
        for global in reflected.module.globals.iter_mut() {
            if !is_listed_global(global) {
                continue;
            }
            let address = next_address(&mut index)?;
            insert_checked(map, &global.name, address)?;
            // Force internal variables to resolve against the copy
            // compiled ahead of time. Static initializers must observe
            // their already-initialized state and run only once.
            if !global.is_declaration() && global.linkage == Linkage::Internal {
                global.linkage = Linkage::AvailableExternally;
            }
        }

        // The filtering here must match the decorator's when it
        // collected the addresses.
        for func in reflected.module.functions.iter() {
            if !func.is_declaration() || func.is_intrinsic() {
                continue;
            }
            let address = next_address(&mut index)?;
            if let Some(found) = available.function(&func.name) {
                if !found.is_declaration() {
                    // A definition exists: the slot is consumed but the
                    // symbol stays unmapped, so the known body can be
                    // recompiled instead of pinned to its old address.
                    log::debug!("drti: not mapping available function {}", func.name);
                    continue;
                }
            }
            insert_checked(map, &func.name, address)?;
        }

        if index != table.len() {
            log::error!(
                "drti: {} module lists {} globals but {} addresses are stored",
                function_name,
                index,
                table.len()
            );
            return Err(SpecializeError::AddressTableMismatch {
                listed: index,
                stored: table.len(),
            });
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn lookup(&self, name: &str) -> Option<usize> {
        self.map.get(name).copied()
    }
}

/// Record one reflected address. Duplicate symbols across the two
/// modules must agree on where the live copy is.
fn insert_checked(
    map: &mut FxHashMap<String, usize>,
    name: &str,
    address: usize,
) -> Result<(), SpecializeError> {
    log::debug!("drti: {} runtime address {:#x}", name, address);
    if let Some(existing) = map.insert(name.to_string(), address) {
        if existing != address {
            log::error!(
                "drti: conflicting reflected addresses for {} ({:#x} vs {:#x})",
                name,
                existing,
                address
            );
            return Err(SpecializeError::LinkFailure(format!(
                "conflicting reflected addresses for {}",
                name
            )));
        }
    }
    Ok(())
}

impl SymbolResolver for ReflectedGlobals {
    fn resolve(&self, name: &str) -> Option<usize> {
        let found = self.map.get(name).copied();
        if let Some(address) = found {
            log::trace!("drti: resolved global {} as {:#x}", name, address);
        }
        found
    }
}

// =============================================================================
// Process symbols
// =============================================================================

/// Fallback resolver for runtime support symbols — the exported
/// intrinsics and entry point generated code may reference.
pub struct ProcessSymbols {
    map: FxHashMap<String, usize>,
}

impl ProcessSymbols {
    fn new() -> Self {
        let mut map = FxHashMap::default();
        map.insert(
            "_drti_call_from".to_string(),
            crate::intrinsics::_drti_call_from as usize,
        );
        map.insert(
            "_drti_landed".to_string(),
            crate::intrinsics::_drti_landed as usize,
        );
        map.insert(
            "_drti_validate_caller".to_string(),
            crate::intrinsics::_drti_validate_caller as usize,
        );
        map.insert(
            "drti_inspect".to_string(),
            crate::inspect::drti_inspect as usize,
        );
        ProcessSymbols { map }
    }
}

impl SymbolResolver for ProcessSymbols {
    fn resolve(&self, name: &str) -> Option<usize> {
        self.map.get(name).copied()
    }
}

/// The process-wide support-symbol registry.
pub fn process_symbols() -> &'static ProcessSymbols {
    static REGISTRY: OnceLock<ProcessSymbols> = OnceLock::new();
    REGISTRY.get_or_init(ProcessSymbols::new)
}
