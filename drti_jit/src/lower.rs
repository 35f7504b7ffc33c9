//! IR → machine IR lowering.
//!
//! Baseline template lowering: every SSA value gets a frame slot,
//! every instruction loads its operands into scratch registers and
//! stores its result back. No register allocation — specialized code
//! wins by inlining the callee, not by shaving moves, and the simple
//! shape keeps the carrier pass's pattern matching exact.

use crate::backend::x64::assembler::{Cond, Width};
use crate::backend::x64::registers::SYSV_ARG_REGS;
use crate::backend::x64::Gpr;
use crate::minst::{MAluOp, MBlock, MFunction, MInst};
use drti_core::SpecializeError;
use drti_ir::module::{BinOpKind, BlockId, CmpKind, Function, Inst, Terminator, ValueId};
use drti_ir::types::Ty;

fn width_of(ty: &Ty) -> Result<Width, SpecializeError> {
    match ty.mem_size() {
        1 => Ok(Width::B1),
        4 => Ok(Width::B4),
        8 => Ok(Width::B8),
        _ => Err(SpecializeError::CodegenFailure(format!(
            "unsupported memory width for {}",
            ty
        ))),
    }
}

fn cond_of(op: CmpKind) -> Cond {
    match op {
        CmpKind::Eq => Cond::E,
        CmpKind::Ne => Cond::Ne,
        CmpKind::Lt => Cond::L,
        CmpKind::Gt => Cond::G,
    }
}

fn alu_of(op: BinOpKind) -> MAluOp {
    match op {
        BinOpKind::Add => MAluOp::Add,
        BinOpKind::Sub => MAluOp::Sub,
        BinOpKind::Mul => MAluOp::Mul,
        BinOpKind::And => MAluOp::And,
        BinOpKind::Or => MAluOp::Or,
        BinOpKind::Xor => MAluOp::Xor,
    }
}

struct LowerCtx<'f> {
    func: &'f Function,
    types: Vec<Ty>,
}

impl<'f> LowerCtx<'f> {
    fn load(&self, out: &mut MBlock, dst: Gpr, value: ValueId) {
        out.insts.push(MInst::LoadSlot { dst, slot: value.0 });
    }

    fn store(&self, out: &mut MBlock, id: ValueId, src: Gpr) {
        if id != ValueId::INVALID {
            out.insts.push(MInst::StoreSlot { slot: id.0, src });
        }
    }

    fn load_args(&self, out: &mut MBlock, args: &[ValueId]) -> Result<(), SpecializeError> {
        if args.len() > SYSV_ARG_REGS.len() {
            return Err(SpecializeError::CodegenFailure(format!(
                "{}: call with more than {} arguments",
                self.func.name,
                SYSV_ARG_REGS.len()
            )));
        }
        for (i, arg) in args.iter().enumerate() {
            self.load(out, SYSV_ARG_REGS[i], *arg);
        }
        Ok(())
    }

    fn lower_inst(
        &self,
        id: ValueId,
        inst: &Inst,
        out: &mut MBlock,
    ) -> Result<(), SpecializeError> {
        match inst {
            Inst::ConstInt { value, .. } => {
                out.insts.push(MInst::MovImm {
                    dst: Gpr::Rax,
                    value: *value as u64,
                });
                self.store(out, id, Gpr::Rax);
            }
            Inst::ConstPtr { value, .. } => {
                out.insts.push(MInst::MovImm {
                    dst: Gpr::Rax,
                    value: *value,
                });
                self.store(out, id, Gpr::Rax);
            }
            Inst::GlobalAddr { name } => {
                out.insts.push(MInst::MovSymAddr {
                    dst: Gpr::Rax,
                    sym: name.clone(),
                });
                self.store(out, id, Gpr::Rax);
            }
            Inst::Load { ty, ptr } => {
                self.load(out, Gpr::Rcx, *ptr);
                out.insts.push(MInst::Load {
                    dst: Gpr::Rax,
                    base: Gpr::Rcx,
                    disp: 0,
                    width: width_of(ty)?,
                });
                self.store(out, id, Gpr::Rax);
            }
            Inst::Store { ptr, value } => {
                let width = width_of(&self.types[value.index()])?;
                self.load(out, Gpr::Rcx, *ptr);
                self.load(out, Gpr::Rax, *value);
                out.insts.push(MInst::Store {
                    base: Gpr::Rcx,
                    disp: 0,
                    src: Gpr::Rax,
                    width,
                });
            }
            Inst::BinOp { op, ty, lhs, rhs } => {
                if matches!(ty, Ty::F64) {
                    return Err(SpecializeError::CodegenFailure(format!(
                        "{}: f64 arithmetic is not lowered",
                        self.func.name
                    )));
                }
                self.load(out, Gpr::Rax, *lhs);
                self.load(out, Gpr::Rcx, *rhs);
                out.insts.push(MInst::Alu {
                    op: alu_of(*op),
                    dst: Gpr::Rax,
                    src: Gpr::Rcx,
                });
                self.store(out, id, Gpr::Rax);
            }
            Inst::ICmp { op, lhs, rhs } => {
                self.load(out, Gpr::Rax, *lhs);
                self.load(out, Gpr::Rcx, *rhs);
                out.insts.push(MInst::CmpRR {
                    lhs: Gpr::Rax,
                    rhs: Gpr::Rcx,
                });
                out.insts.push(MInst::Setcc {
                    cc: cond_of(*op),
                    dst: Gpr::Rax,
                });
                self.store(out, id, Gpr::Rax);
            }
            Inst::Call { callee, sig, args } => {
                self.load_args(out, args)?;
                out.insts.push(MInst::CallSym {
                    sym: callee.clone(),
                    stash: false,
                });
                if sig.ret.is_value() {
                    self.store(out, id, Gpr::Rax);
                }
            }
            Inst::CallIndirect { callee, sig, args } => {
                // The target goes into R10 first; argument setup never
                // touches it.
                self.load(out, Gpr::R10, *callee);
                self.load_args(out, args)?;
                out.insts.push(MInst::CallReg {
                    reg: Gpr::R10,
                    stash: false,
                });
                if sig.ret.is_value() {
                    self.store(out, id, Gpr::Rax);
                }
            }
            Inst::Cast { value, .. } => {
                // Reinterpretation: a slot-to-slot move.
                self.load(out, Gpr::Rax, *value);
                self.store(out, id, Gpr::Rax);
            }
            Inst::Phi { .. } => {
                // Materialized by predecessor edge moves.
            }
            Inst::CodeAddr => {
                out.insts.push(MInst::CodeAddr { dst: Gpr::Rax });
                self.store(out, id, Gpr::Rax);
            }
            Inst::RetAddr => {
                out.insts.push(MInst::RetAddr { dst: Gpr::Rax });
                self.store(out, id, Gpr::Rax);
            }
        }
        Ok(())
    }

    /// Copies satisfying `succ`'s phis for the edge `pred → succ`.
    ///
    /// Each move goes through RAX one at a time; the transforms
    /// producing this IR never make a phi consume another phi of the
    /// same block.
    fn phi_moves(&self, pred: BlockId, succ: BlockId) -> Result<Vec<MInst>, SpecializeError> {
        let mut moves = Vec::new();
        for (id, inst) in &self.func.blocks[succ.index()].insts {
            if let Inst::Phi { incomings, .. } = inst {
                let (_, value) =
                    incomings
                        .iter()
                        .find(|(b, _)| *b == pred)
                        .ok_or_else(|| {
                            SpecializeError::CodegenFailure(format!(
                                "{}: phi in {} lacks incoming for {}",
                                self.func.name, succ, pred
                            ))
                        })?;
                moves.push(MInst::LoadSlot {
                    dst: Gpr::Rax,
                    slot: value.0,
                });
                moves.push(MInst::StoreSlot {
                    slot: id.0,
                    src: Gpr::Rax,
                });
            }
        }
        Ok(moves)
    }
}

/// Lower one defined function.
pub fn lower_function(func: &Function) -> Result<MFunction, SpecializeError> {
    debug_assert!(!func.is_declaration());
    if func.sig.params.len() > SYSV_ARG_REGS.len() {
        return Err(SpecializeError::CodegenFailure(format!(
            "{}: more than {} parameters",
            func.name,
            SYSV_ARG_REGS.len()
        )));
    }

    let ctx = LowerCtx {
        func,
        types: func.value_types(),
    };
    let nblocks = func.blocks.len();
    let mut main: Vec<MBlock> = Vec::with_capacity(nblocks);
    let mut edges: Vec<MBlock> = Vec::new();
    // Edge blocks land after the main blocks; their indices are only
    // known relative to how many edges exist so far.
    let edge_index = |edges: &mut Vec<MBlock>, moves: Vec<MInst>, target: u32| -> u32 {
        let mut block = MBlock { insts: moves };
        block.insts.push(MInst::Jmp { target });
        edges.push(block);
        (nblocks + edges.len() - 1) as u32
    };

    for (bidx, block) in func.blocks.iter().enumerate() {
        let cur = BlockId(bidx as u32);
        let mut out = MBlock::default();

        if bidx == 0 {
            for i in 0..func.sig.params.len() {
                out.insts.push(MInst::StoreSlot {
                    slot: i as u32,
                    src: SYSV_ARG_REGS[i],
                });
            }
        }

        for (id, inst) in &block.insts {
            ctx.lower_inst(*id, inst, &mut out)?;
        }

        match &block.term {
            Terminator::Ret { value } => {
                if let Some(v) = value {
                    ctx.load(&mut out, Gpr::Rax, *v);
                }
                out.insts.push(MInst::Epilogue);
                out.insts.push(MInst::Ret);
            }
            Terminator::Br { target } => {
                out.insts.extend(ctx.phi_moves(cur, *target)?);
                out.insts.push(MInst::Jmp { target: target.0 });
            }
            Terminator::CondBr {
                cond,
                then_blk,
                else_blk,
            } => {
                ctx.load(&mut out, Gpr::Rax, *cond);
                out.insts.push(MInst::TestRR {
                    lhs: Gpr::Rax,
                    rhs: Gpr::Rax,
                });
                // The taken edge may need phi moves; route it through
                // an edge block when it does.
                let then_moves = ctx.phi_moves(cur, *then_blk)?;
                let then_target = if then_moves.is_empty() {
                    then_blk.0
                } else {
                    edge_index(&mut edges, then_moves, then_blk.0)
                };
                out.insts.push(MInst::Jcc {
                    cc: Cond::Ne,
                    target: then_target,
                });
                // Fallthrough edge: moves can sit inline.
                out.insts.extend(ctx.phi_moves(cur, *else_blk)?);
                out.insts.push(MInst::Jmp { target: else_blk.0 });
            }
            Terminator::TailCall { callee, args, .. } => {
                ctx.load(&mut out, Gpr::R10, *callee);
                ctx.load_args(&mut out, args)?;
                out.insts.push(MInst::Epilogue);
                out.insts.push(MInst::JmpReg { reg: Gpr::R10 });
            }
        }

        main.push(out);
    }

    main.extend(edges);
    Ok(MFunction {
        name: func.name.clone(),
        blocks: main,
        nslots: func.next_value,
    })
}
