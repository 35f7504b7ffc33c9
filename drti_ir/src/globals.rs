//! The listed-globals enumeration.
//!
//! The decorator records runtime addresses for a module's globals in
//! one deterministic order; the runtime walks the re-parsed module in
//! the same order to consume the table. Both sides use the filters
//! here. Any divergence between the two walks is a programming error
//! and surfaces as an address-table mismatch.
//!
//! Declarations are listed like definitions: an extern data symbol
//! must resolve against the copy already live in the process,
//! wherever that copy was defined. Constants are excluded: their
//! values are wanted at compile time. Address-taken constants could
//! in principle break under this rule; the limitation is accepted.

use crate::module::{Function, Global, Module};

/// Whether a global needs address equivalence between ahead-of-time
/// and JIT-compiled code.
#[inline]
pub fn is_listed_global(global: &Global) -> bool {
    !global.is_const && !global.name.starts_with("llvm.")
}

/// Globals requiring address equivalence, in declaration order.
pub fn visit_listed_globals(module: &Module) -> impl Iterator<Item = &Global> {
    module.globals.iter().filter(|g| is_listed_global(g))
}

/// Function declarations that resolve to already-loaded addresses, in
/// declaration order. These follow the globals in every reflect
/// address table.
pub fn listed_function_declarations(module: &Module) -> impl Iterator<Item = &Function> {
    module
        .functions
        .iter()
        .filter(|f| f.is_declaration() && !f.is_intrinsic())
}

/// Total number of address-table entries this module requires.
pub fn listed_entry_count(module: &Module) -> usize {
    visit_listed_globals(module).count() + listed_function_declarations(module).count()
}
