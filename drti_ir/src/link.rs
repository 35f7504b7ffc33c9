//! Link-only-needed module merging.
//!
//! Pulls into the destination module the definitions required to
//! resolve its references, transitively, plus an explicit seed set:
//! the callee being specialized is not referenced by the caller until
//! the rewrite runs, and converter helpers are referenced by nothing
//! at all, so both must be named up front.
//!
//! Declarations are never imported — symbol references resolve by
//! name, and enumeration for the reflect address tables happens on the
//! separate modules before linking.

use crate::module::{Linkage, Module};
use drti_core::SpecializeError;

/// Merge needed definitions from `src` into `dest`.
pub fn link_only_needed(
    dest: &mut Module,
    src: &Module,
    required: &[&str],
) -> Result<(), SpecializeError> {
    check_conflicts(dest, src)?;

    loop {
        let mut needed: Vec<String> = dest
            .referenced_symbols()
            .into_iter()
            .chain(required.iter().map(|s| s.to_string()))
            .collect();
        needed.sort();
        needed.dedup();

        let mut changed = false;
        for name in needed {
            if defines(dest, &name) {
                continue;
            }
            if let Some(func) = src.function(&name).filter(|f| !f.is_declaration()) {
                log::trace!("drti: linking in function {}", name);
                // Drop a pre-existing declaration in favor of the body.
                dest.functions.retain(|f| f.name != name);
                dest.functions.push(func.clone());
                changed = true;
            } else if let Some(global) = src.global(&name).filter(|g| !g.is_declaration()) {
                log::trace!("drti: linking in global {}", name);
                dest.globals.retain(|g| g.name != name);
                dest.globals.push(global.clone());
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }

    for name in required {
        if !defines(dest, name) {
            return Err(SpecializeError::LinkFailure(format!(
                "required symbol {} has no definition",
                name
            )));
        }
    }

    Ok(())
}

fn defines(module: &Module, name: &str) -> bool {
    module
        .function(name)
        .map(|f| !f.is_declaration())
        .unwrap_or(false)
        || module
            .global(name)
            .map(|g| !g.is_declaration())
            .unwrap_or(false)
}

/// Two authoritative definitions of the same symbol cannot be merged.
fn check_conflicts(dest: &Module, src: &Module) -> Result<(), SpecializeError> {
    for func in &src.functions {
        if func.is_declaration() || func.linkage != Linkage::External {
            continue;
        }
        if let Some(existing) = dest.function(&func.name) {
            if !existing.is_declaration() && existing.linkage == Linkage::External {
                return Err(SpecializeError::LinkFailure(format!(
                    "duplicate external definition of {}",
                    func.name
                )));
            }
        }
    }
    for global in &src.globals {
        if global.is_declaration() || global.linkage != Linkage::External {
            continue;
        }
        if let Some(existing) = dest.global(&global.name) {
            if !existing.is_declaration() && existing.linkage == Linkage::External {
                return Err(SpecializeError::LinkFailure(format!(
                    "duplicate external definition of {}",
                    global.name
                )));
            }
        }
    }
    Ok(())
}
