//! x86-64 System V back end.
//!
//! Compiles DRTI IR modules to native code:
//! - slot-machine lowering (`minst`, `lower`)
//! - the caller-context carrier-register pass (`context_pass`)
//! - instruction encoding and code emission (`backend::x64`)
//! - executable memory and module assembly (`codegen`)
//!
//! Generated code uses the large code model: every cross-symbol
//! reference goes through a 64-bit absolute address, so code and the
//! data it touches may live arbitrarily far apart. That is what lets
//! JIT-compiled functions share globals with the ahead-of-time image.

pub mod backend;
pub mod codegen;
pub mod context_pass;
pub mod lower;
pub mod minst;

pub use codegen::{compile_module, CompiledModule, SymbolResolver};
pub use context_pass::CarrierAbi;
