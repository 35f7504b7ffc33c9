//! Optimization passes.
//!
//! A deliberately small pipeline: the heavy lifting happened ahead of
//! time, and the one transformation that matters at specialization
//! time is embedding the observed callee into the caller. Inlining
//! with an aggressive threshold, constant/branch simplification, and
//! dead-code cleanup cover that.

pub mod dce;
pub mod inline;
pub mod pipeline;
pub mod simplify;

pub use inline::{inline_module, InlineConfig};
pub use pipeline::{optimize_function, optimize_module, PipelineConfig};
