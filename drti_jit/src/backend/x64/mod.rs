//! x86-64 code emission.

pub mod assembler;
pub mod encoder;
pub mod memory;
pub mod registers;

pub use assembler::{Assembler, Cond, Label};
pub use memory::ExecutableBuffer;
pub use registers::Gpr;
