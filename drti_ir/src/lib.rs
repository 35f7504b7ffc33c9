//! Typed intermediate representation for DRTI modules.
//!
//! Decorated translation units embed their IR in the binary bitcode
//! format defined here; the runtime re-materializes it, links caller
//! and callee together, rewrites the observed call site, and optimizes
//! the result before handing it to the back end.
//!
//! # Core Components
//!
//! - **Types** (`types.rs`): value types with nominal pointers
//! - **Module** (`module.rs`): globals, functions, blocks, instructions
//! - **Builder** (`builder.rs`): programmatic module construction
//! - **Bitcode** (`bitcode.rs`): binary serialization round-trip
//! - **Globals** (`globals.rs`): the listed-globals enumeration order
//! - **Link** (`link.rs`): link-only-needed module merging
//! - **Devirt** (`devirt.rs`): guarded direct-call rewrite
//! - **Opt** (`opt/`): inliner, simplifier, DCE, pipeline

pub mod bitcode;
pub mod builder;
pub mod devirt;
pub mod globals;
pub mod link;
pub mod module;
pub mod opt;
pub mod types;

pub use builder::{FunctionBuilder, ModuleBuilder};
pub use module::{
    Block, BlockId, BinOpKind, CmpKind, Function, Global, Inst, Linkage, Module, Terminator,
    ValueId,
};
pub use types::{Signature, Ty};
