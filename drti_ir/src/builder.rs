//! Programmatic construction of modules and functions.
//!
//! The decorator is the production client; tests use the same API to
//! stand in for it.

use crate::module::{
    BinOpKind, Block, BlockId, CmpKind, Function, Global, Inst, Linkage, Module, Terminator,
    ValueId,
};
use crate::types::{Signature, Ty};
use smallvec::SmallVec;

// =============================================================================
// Module builder
// =============================================================================

/// Accumulates globals and functions into a [`Module`].
pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    pub fn new(name: &str) -> Self {
        ModuleBuilder {
            module: Module::new(name),
        }
    }

    /// Add a defined global with an initializer word.
    pub fn define_global(
        &mut self,
        name: &str,
        ty: Ty,
        linkage: Linkage,
        init: u64,
    ) -> &mut Self {
        self.module.globals.push(Global {
            name: name.to_string(),
            ty,
            linkage,
            is_const: false,
            init: Some(init),
        });
        self
    }

    /// Add a constant global. Constants keep their values at compile
    /// time and are never listed in reflect address tables.
    pub fn define_const_global(
        &mut self,
        name: &str,
        ty: Ty,
        linkage: Linkage,
        init: u64,
    ) -> &mut Self {
        self.module.globals.push(Global {
            name: name.to_string(),
            ty,
            linkage,
            is_const: true,
            init: Some(init),
        });
        self
    }

    /// Add a global declaration (defined in another module).
    pub fn declare_global(&mut self, name: &str, ty: Ty) -> &mut Self {
        self.module.globals.push(Global {
            name: name.to_string(),
            ty,
            linkage: Linkage::External,
            is_const: false,
            init: None,
        });
        self
    }

    /// Add a function declaration.
    pub fn declare_function(&mut self, name: &str, sig: Signature) -> &mut Self {
        self.module.functions.push(Function::declaration(name, sig));
        self
    }

    /// Add a finished function definition.
    pub fn add_function(&mut self, func: Function) -> &mut Self {
        debug_assert!(
            self.module.function(&func.name).is_none(),
            "duplicate function {}",
            func.name
        );
        self.module.functions.push(func);
        self
    }

    pub fn build(self) -> Module {
        self.module
    }
}

// =============================================================================
// Function builder
// =============================================================================

/// Builds one function, block by block.
pub struct FunctionBuilder {
    func: Function,
    cur: BlockId,
}

impl FunctionBuilder {
    pub fn new(name: &str, sig: Signature) -> Self {
        let next_value = sig.params.len() as u32;
        let func = Function {
            name: name.to_string(),
            sig,
            linkage: Linkage::External,
            always_inline: false,
            blocks: vec![Block::new()],
            next_value,
        };
        FunctionBuilder {
            func,
            cur: BlockId::ENTRY,
        }
    }

    pub fn with_linkage(mut self, linkage: Linkage) -> Self {
        self.func.linkage = linkage;
        self
    }

    pub fn with_always_inline(mut self) -> Self {
        self.func.always_inline = true;
        self
    }

    /// Value id of parameter `index`.
    #[inline]
    pub fn param(&self, index: usize) -> ValueId {
        self.func.param_value(index)
    }

    /// Append a fresh, unterminated block.
    pub fn create_block(&mut self) -> BlockId {
        let id = BlockId(self.func.blocks.len() as u32);
        self.func.blocks.push(Block::new());
        id
    }

    /// Redirect instruction insertion to `block`.
    pub fn switch_to(&mut self, block: BlockId) {
        debug_assert!(block.index() < self.func.blocks.len());
        self.cur = block;
    }

    fn push(&mut self, inst: Inst) -> ValueId {
        let id = if inst.result_ty().is_value() {
            self.func.alloc_value()
        } else {
            ValueId::INVALID
        };
        self.func.blocks[self.cur.index()].insts.push((id, inst));
        id
    }

    // -------------------------------------------------------------------------
    // Instructions
    // -------------------------------------------------------------------------

    pub fn const_int(&mut self, ty: Ty, value: i64) -> ValueId {
        self.push(Inst::ConstInt { ty, value })
    }

    pub fn const_ptr(&mut self, ty: Ty, value: u64) -> ValueId {
        self.push(Inst::ConstPtr { ty, value })
    }

    pub fn null_ptr(&mut self, ty: Ty) -> ValueId {
        self.const_ptr(ty, 0)
    }

    pub fn global_addr(&mut self, name: &str) -> ValueId {
        self.push(Inst::GlobalAddr {
            name: name.to_string(),
        })
    }

    pub fn load(&mut self, ty: Ty, ptr: ValueId) -> ValueId {
        self.push(Inst::Load { ty, ptr })
    }

    pub fn store(&mut self, ptr: ValueId, value: ValueId) {
        self.push(Inst::Store { ptr, value });
    }

    pub fn binop(&mut self, op: BinOpKind, ty: Ty, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.push(Inst::BinOp { op, ty, lhs, rhs })
    }

    pub fn icmp(&mut self, op: CmpKind, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.push(Inst::ICmp { op, lhs, rhs })
    }

    pub fn call(&mut self, callee: &str, sig: Signature, args: &[ValueId]) -> ValueId {
        self.push(Inst::Call {
            callee: callee.to_string(),
            sig,
            args: SmallVec::from_slice(args),
        })
    }

    pub fn call_indirect(&mut self, callee: ValueId, sig: Signature, args: &[ValueId]) -> ValueId {
        self.push(Inst::CallIndirect {
            callee,
            sig,
            args: SmallVec::from_slice(args),
        })
    }

    pub fn cast(&mut self, ty: Ty, value: ValueId) -> ValueId {
        self.push(Inst::Cast { ty, value })
    }

    pub fn phi(&mut self, ty: Ty, incomings: &[(BlockId, ValueId)]) -> ValueId {
        self.push(Inst::Phi {
            ty,
            incomings: SmallVec::from_slice(incomings),
        })
    }

    pub fn code_addr(&mut self) -> ValueId {
        self.push(Inst::CodeAddr)
    }

    pub fn ret_addr(&mut self) -> ValueId {
        self.push(Inst::RetAddr)
    }

    // -------------------------------------------------------------------------
    // Terminators
    // -------------------------------------------------------------------------

    fn terminate(&mut self, term: Terminator) {
        self.func.blocks[self.cur.index()].term = term;
    }

    pub fn ret(&mut self, value: Option<ValueId>) {
        self.terminate(Terminator::Ret { value });
    }

    pub fn br(&mut self, target: BlockId) {
        self.terminate(Terminator::Br { target });
    }

    pub fn cond_br(&mut self, cond: ValueId, then_blk: BlockId, else_blk: BlockId) {
        self.terminate(Terminator::CondBr {
            cond,
            then_blk,
            else_blk,
        });
    }

    pub fn tail_call(&mut self, callee: ValueId, sig: Signature, args: &[ValueId]) {
        self.terminate(Terminator::TailCall {
            callee,
            sig,
            args: SmallVec::from_slice(args),
        });
    }

    pub fn finish(self) -> Function {
        self.func
    }
}
