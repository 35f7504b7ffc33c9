//! The DRTI runtime.
//!
//! Decorated code reports into the accounting graph through the
//! exported intrinsics; the first time a call chain's landing is
//! observed, [`inspect::drti_inspect`] re-materializes the caller's
//! and callee's embedded bitcode, links them, rewrites the observed
//! call site into a guarded direct call, recompiles the caller, and
//! swaps the freshly generated entry point into the chain's active
//! target. The original indirect path keeps working throughout; a
//! failed specialization simply leaves it in place.

pub mod inspect;
pub mod intrinsics;
pub mod resolver;
pub mod specialize;
pub mod tree;

pub use inspect::drti_inspect;
pub use tree::{LandingSite, NodeState, Reflect, StaticCallsite, Treenode};
