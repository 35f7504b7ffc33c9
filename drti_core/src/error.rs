//! Error taxonomy for treenode specialization.
//!
//! Every failure mode of the specializer maps onto exactly one of
//! these variants. All of them are caught at the top of
//! `compile_treenode`; the treenode is left in the `Failed` state and
//! the original indirect call path keeps executing.

use thiserror::Error;

/// Reasons a single specialization can fail.
///
/// None of these are fatal for the process: the accounting graph stays
/// intact and other treenodes at the same callsite remain eligible.
#[derive(Debug, Error)]
pub enum SpecializeError {
    /// The treenode was produced by code compiled against a different
    /// ABI version. Detected before any JIT work starts.
    #[error("ABI mismatch: client {caller} != runtime {runtime}")]
    AbiMismatch { caller: u32, runtime: u32 },

    /// The embedded bitcode could not be parsed.
    #[error("bitcode parse failure: {0}")]
    BitcodeParse(String),

    /// A landing-site function name is missing from its parsed module.
    #[error("symbol {name} not found in bitcode")]
    SymbolNotFound { name: String },

    /// The module's global enumeration does not line up with the
    /// stored address table.
    #[error("module lists {listed} globals but reflect record stores {stored} addresses")]
    AddressTableMismatch { listed: usize, stored: usize },

    /// Linking the callee module into the caller module failed.
    #[error("linking failed: {0}")]
    LinkFailure(String),

    /// Arguments or return type at the rewritten call could not be
    /// reconciled with the callee's signature.
    #[error("type mismatch at argument {arg_index}")]
    TypeMismatch { arg_index: usize },

    /// Machine-code generation or final symbol lookup failed.
    #[error("code generation failed: {0}")]
    CodegenFailure(String),
}
