//! Module, function, block and instruction definitions.
//!
//! The representation is SSA-shaped: every instruction defines at most
//! one value, identified by a function-local [`ValueId`]. Function
//! parameters occupy the first value ids. References between functions
//! and to globals are by symbol name, which keeps linking and
//! serialization free of cross-module id fixups.

use crate::types::{Signature, Ty};
use smallvec::SmallVec;
use std::fmt;

// =============================================================================
// Ids
// =============================================================================

/// Function-local SSA value id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueId(pub u32);

impl ValueId {
    pub const INVALID: ValueId = ValueId(u32::MAX);

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Function-local basic-block id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

impl BlockId {
    pub const ENTRY: BlockId = BlockId(0);

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

// =============================================================================
// Linkage
// =============================================================================

/// Symbol linkage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Linkage {
    /// Visible only inside the defining module.
    Internal,
    /// Visible to other modules; the definition is authoritative.
    External,
    /// Mergeable definition; any one copy may be picked and unused
    /// copies may be dropped.
    LinkOnce,
    /// The definition exists elsewhere at a known address; the body or
    /// initializer here is only for the optimizer's benefit and must
    /// not be emitted.
    AvailableExternally,
}

// =============================================================================
// Globals
// =============================================================================

/// A module-level global variable.
///
/// Initializers are raw words: the globals the accounting contract
/// cares about (counters, guards, pointers) are all scalar.
#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub name: String,
    pub ty: Ty,
    pub linkage: Linkage,
    pub is_const: bool,
    /// `None` marks a declaration.
    pub init: Option<u64>,
}

impl Global {
    #[inline]
    pub fn is_declaration(&self) -> bool {
        self.init.is_none()
    }
}

// =============================================================================
// Instructions
// =============================================================================

/// Integer binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
}

/// Integer/pointer comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpKind {
    Eq,
    Ne,
    Lt,
    Gt,
}

/// A non-terminator instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    /// Integer constant.
    ConstInt { ty: Ty, value: i64 },
    /// Pointer-typed constant (absolute address, or null).
    ConstPtr { ty: Ty, value: u64 },
    /// Address of a global by name.
    GlobalAddr { name: String },
    /// Typed load through a pointer.
    Load { ty: Ty, ptr: ValueId },
    /// Typed store through a pointer. Defines no value.
    Store { ptr: ValueId, value: ValueId },
    /// Integer arithmetic.
    BinOp {
        op: BinOpKind,
        ty: Ty,
        lhs: ValueId,
        rhs: ValueId,
    },
    /// Comparison producing an `i8` 0/1.
    ICmp {
        op: CmpKind,
        lhs: ValueId,
        rhs: ValueId,
    },
    /// Direct call by symbol name.
    Call {
        callee: String,
        sig: Signature,
        args: SmallVec<[ValueId; 4]>,
    },
    /// Call through an SSA pointer value.
    CallIndirect {
        callee: ValueId,
        sig: Signature,
        args: SmallVec<[ValueId; 4]>,
    },
    /// Reinterpreting cast between pointer and integer shapes.
    Cast { ty: Ty, value: ValueId },
    /// Merge node for values arriving from predecessor blocks.
    Phi {
        ty: Ty,
        incomings: SmallVec<[(BlockId, ValueId); 2]>,
    },
    /// Address of this instruction in the emitted code. Lets a
    /// function observe where it is executing, which is how tests and
    /// tooling detect recompilation.
    CodeAddr,
    /// Return address of the current frame, for stash validation.
    RetAddr,
}

impl Inst {
    /// The type of the value this instruction defines.
    pub fn result_ty(&self) -> Ty {
        match self {
            Inst::ConstInt { ty, .. } => ty.clone(),
            Inst::ConstPtr { ty, .. } => ty.clone(),
            Inst::GlobalAddr { .. } => Ty::raw_ptr(),
            Inst::Load { ty, .. } => ty.clone(),
            Inst::Store { .. } => Ty::Void,
            Inst::BinOp { ty, .. } => ty.clone(),
            Inst::ICmp { .. } => Ty::I8,
            Inst::Call { sig, .. } => sig.ret.clone(),
            Inst::CallIndirect { sig, .. } => sig.ret.clone(),
            Inst::Cast { ty, .. } => ty.clone(),
            Inst::Phi { ty, .. } => ty.clone(),
            Inst::CodeAddr => Ty::raw_ptr(),
            Inst::RetAddr => Ty::raw_ptr(),
        }
    }

    /// Whether the instruction must be kept even when its result is
    /// unused.
    #[inline]
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            Inst::Store { .. } | Inst::Call { .. } | Inst::CallIndirect { .. }
        )
    }

    /// Visit every value operand.
    pub fn for_each_operand(&self, mut f: impl FnMut(ValueId)) {
        match self {
            Inst::ConstInt { .. }
            | Inst::ConstPtr { .. }
            | Inst::GlobalAddr { .. }
            | Inst::CodeAddr
            | Inst::RetAddr => {}
            Inst::Load { ptr, .. } => f(*ptr),
            Inst::Store { ptr, value } => {
                f(*ptr);
                f(*value);
            }
            Inst::BinOp { lhs, rhs, .. } => {
                f(*lhs);
                f(*rhs);
            }
            Inst::ICmp { lhs, rhs, .. } => {
                f(*lhs);
                f(*rhs);
            }
            Inst::Call { args, .. } => args.iter().copied().for_each(f),
            Inst::CallIndirect { callee, args, .. } => {
                f(*callee);
                args.iter().copied().for_each(f);
            }
            Inst::Cast { value, .. } => f(*value),
            Inst::Phi { incomings, .. } => incomings.iter().for_each(|(_, v)| f(*v)),
        }
    }

    /// Visit every value operand mutably.
    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut ValueId)) {
        match self {
            Inst::ConstInt { .. }
            | Inst::ConstPtr { .. }
            | Inst::GlobalAddr { .. }
            | Inst::CodeAddr
            | Inst::RetAddr => {}
            Inst::Load { ptr, .. } => f(ptr),
            Inst::Store { ptr, value } => {
                f(ptr);
                f(value);
            }
            Inst::BinOp { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            Inst::ICmp { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            Inst::Call { args, .. } => args.iter_mut().for_each(f),
            Inst::CallIndirect { callee, args, .. } => {
                f(callee);
                args.iter_mut().for_each(f);
            }
            Inst::Cast { value, .. } => f(value),
            Inst::Phi { incomings, .. } => incomings.iter_mut().for_each(|(_, v)| f(v)),
        }
    }
}

// =============================================================================
// Terminators
// =============================================================================

/// A block terminator.
#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Ret {
        value: Option<ValueId>,
    },
    Br {
        target: BlockId,
    },
    CondBr {
        cond: ValueId,
        then_blk: BlockId,
        else_blk: BlockId,
    },
    /// Tail call through a pointer: the frame is torn down before the
    /// jump, so the callee returns directly to this function's caller.
    TailCall {
        callee: ValueId,
        sig: Signature,
        args: SmallVec<[ValueId; 4]>,
    },
}

impl Terminator {
    /// Visit every value operand.
    pub fn for_each_operand(&self, mut f: impl FnMut(ValueId)) {
        match self {
            Terminator::Ret { value } => {
                if let Some(v) = value {
                    f(*v);
                }
            }
            Terminator::Br { .. } => {}
            Terminator::CondBr { cond, .. } => f(*cond),
            Terminator::TailCall { callee, args, .. } => {
                f(*callee);
                args.iter().copied().for_each(f);
            }
        }
    }

    /// Visit every value operand mutably.
    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut ValueId)) {
        match self {
            Terminator::Ret { value } => {
                if let Some(v) = value {
                    f(v);
                }
            }
            Terminator::Br { .. } => {}
            Terminator::CondBr { cond, .. } => f(cond),
            Terminator::TailCall { callee, args, .. } => {
                f(callee);
                args.iter_mut().for_each(f);
            }
        }
    }

    /// Successor block ids.
    pub fn successors(&self) -> SmallVec<[BlockId; 2]> {
        match self {
            Terminator::Ret { .. } | Terminator::TailCall { .. } => SmallVec::new(),
            Terminator::Br { target } => SmallVec::from_slice(&[*target]),
            Terminator::CondBr {
                then_blk, else_blk, ..
            } => SmallVec::from_slice(&[*then_blk, *else_blk]),
        }
    }

    /// Visit every successor block id mutably.
    pub fn for_each_successor_mut(&mut self, mut f: impl FnMut(&mut BlockId)) {
        match self {
            Terminator::Ret { .. } | Terminator::TailCall { .. } => {}
            Terminator::Br { target } => f(target),
            Terminator::CondBr {
                then_blk, else_blk, ..
            } => {
                f(then_blk);
                f(else_blk);
            }
        }
    }
}

// =============================================================================
// Blocks and functions
// =============================================================================

/// A basic block: instructions plus one terminator.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// Instructions in execution order, each paired with the value it
    /// defines (`ValueId::INVALID` for void results).
    pub insts: Vec<(ValueId, Inst)>,
    pub term: Terminator,
}

impl Block {
    pub fn new() -> Self {
        Block {
            insts: Vec::new(),
            // Placeholder until the builder seals the block.
            term: Terminator::Ret { value: None },
        }
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::new()
    }
}

/// A function definition or declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub sig: Signature,
    pub linkage: Linkage,
    pub always_inline: bool,
    /// Empty for declarations. Block 0 is the entry.
    pub blocks: Vec<Block>,
    /// Number of SSA values; parameters occupy ids `0..params.len()`.
    pub next_value: u32,
}

impl Function {
    /// Create a declaration.
    pub fn declaration(name: &str, sig: Signature) -> Self {
        let next_value = sig.params.len() as u32;
        Function {
            name: name.to_string(),
            sig,
            linkage: Linkage::External,
            always_inline: false,
            blocks: Vec::new(),
            next_value,
        }
    }

    #[inline]
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Compiler-reserved functions that never resolve through the
    /// reflect address tables: `llvm.`-prefixed specials and the
    /// `_drti_` pseudo-intrinsics and runtime support symbols.
    #[inline]
    pub fn is_intrinsic(&self) -> bool {
        self.name.starts_with("llvm.") || self.name.starts_with("_drti_")
    }

    /// Value id of parameter `index`.
    #[inline]
    pub fn param_value(&self, index: usize) -> ValueId {
        debug_assert!(index < self.sig.params.len());
        ValueId(index as u32)
    }

    /// Allocate a fresh value id.
    #[inline]
    pub fn alloc_value(&mut self) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        id
    }

    /// Types of all values, indexed by value id. Void-result
    /// instructions and unassigned ids map to `Ty::Void`.
    pub fn value_types(&self) -> Vec<Ty> {
        let mut types = vec![Ty::Void; self.next_value as usize];
        for (i, p) in self.sig.params.iter().enumerate() {
            types[i] = p.clone();
        }
        for block in &self.blocks {
            for (id, inst) in &block.insts {
                if *id != ValueId::INVALID {
                    types[id.index()] = inst.result_ty();
                }
            }
        }
        types
    }

    /// Replace every use of `old` with `new`, except inside the
    /// instruction defining `skip` (used when redirecting a call
    /// result into the merge phi that consumes it).
    pub fn replace_uses(&mut self, old: ValueId, new: ValueId, skip: Option<ValueId>) {
        for block in &mut self.blocks {
            for (id, inst) in &mut block.insts {
                if Some(*id) == skip {
                    continue;
                }
                inst.for_each_operand_mut(|v| {
                    if *v == old {
                        *v = new;
                    }
                });
            }
            block.term.for_each_operand_mut(|v| {
                if *v == old {
                    *v = new;
                }
            });
        }
    }
}

// =============================================================================
// Module
// =============================================================================

/// A translation unit: globals plus functions.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub name: String,
    pub globals: Vec<Global>,
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new(name: &str) -> Self {
        Module {
            name: name.to_string(),
            globals: Vec::new(),
            functions: Vec::new(),
        }
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.iter_mut().find(|f| f.name == name)
    }

    pub fn global(&self, name: &str) -> Option<&Global> {
        self.globals.iter().find(|g| g.name == name)
    }

    pub fn global_mut(&mut self, name: &str) -> Option<&mut Global> {
        self.globals.iter_mut().find(|g| g.name == name)
    }

    /// All symbol names referenced by instruction operands anywhere in
    /// the module (call targets and global addresses).
    pub fn referenced_symbols(&self) -> rustc_hash::FxHashSet<String> {
        let mut refs = rustc_hash::FxHashSet::default();
        for func in &self.functions {
            for block in &func.blocks {
                for (_, inst) in &block.insts {
                    match inst {
                        Inst::Call { callee, .. } => {
                            refs.insert(callee.clone());
                        }
                        Inst::GlobalAddr { name } => {
                            refs.insert(name.clone());
                        }
                        _ => {}
                    }
                }
            }
        }
        refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declaration_has_param_values() {
        let sig = Signature::new(vec![Ty::I64, Ty::raw_ptr()], Ty::Void);
        let func = Function::declaration("callee", sig);
        assert!(func.is_declaration());
        assert_eq!(func.param_value(0), ValueId(0));
        assert_eq!(func.param_value(1), ValueId(1));
        assert_eq!(func.next_value, 2);
    }

    #[test]
    fn test_intrinsic_detection() {
        let sig = Signature::new(vec![], Ty::raw_ptr());
        assert!(Function::declaration("_drti_caller", sig.clone()).is_intrinsic());
        assert!(Function::declaration("llvm.lifetime.start", sig.clone()).is_intrinsic());
        assert!(!Function::declaration("memcpy_small", sig).is_intrinsic());
    }

    #[test]
    fn test_result_types() {
        assert_eq!(
            Inst::ConstInt {
                ty: Ty::I64,
                value: 7
            }
            .result_ty(),
            Ty::I64
        );
        assert_eq!(
            Inst::ICmp {
                op: CmpKind::Eq,
                lhs: ValueId(0),
                rhs: ValueId(1)
            }
            .result_ty(),
            Ty::I8
        );
        assert_eq!(Inst::CodeAddr.result_ty(), Ty::raw_ptr());
    }
}
