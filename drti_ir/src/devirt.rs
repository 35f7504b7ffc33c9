//! Guarded devirtualization of one observed call site.
//!
//! Splits the block containing the observed indirect call so that the
//! pointer is compared against the observed target and, on a match, a
//! direct (and therefore inlinable) call is taken instead:
//!
//! ```text
//! B1:                          B1:
//!   xxx                          xxx
//!   r = call value(...)          matches = value == known
//!   yyy                          br matches, B2, B3
//!                              B2:
//!                                r1 = call target(...)
//!                                br B4
//!                              B3:
//!                                r2 = call value(...)
//!                                br B4
//!                              B4:
//!                                r = phi [r1, B2], [r2, B3]
//!                                yyy
//! ```
//!
//! Argument types that differ from the target's parameters are routed
//! through a user-provided coercion function whose name contains the
//! `__drti_converter` token. Coercions are limited to the shapes
//! produced by polymorphic receivers and return-value optimization:
//! one per argument, at most two per call, never past parameter
//! index 1.

use crate::module::{CmpKind, Block, BlockId, Inst, Module, Terminator, ValueId};
use crate::types::{Signature, Ty};
use drti_core::SpecializeError;
use smallvec::SmallVec;

/// Name token identifying coercion helpers.
pub const CONVERTER_TOKEN: &str = "__drti_converter";

struct Converter {
    name: String,
    from: Ty,
    to: Ty,
}

fn find_converters(module: &Module) -> Vec<Converter> {
    module
        .functions
        .iter()
        .filter(|f| {
            f.name.contains(CONVERTER_TOKEN)
                && f.sig.params.len() == 2
                && f.sig.params[1] == f.sig.ret
        })
        .map(|f| Converter {
            name: f.name.clone(),
            from: f.sig.params[0].clone(),
            to: f.sig.ret.clone(),
        })
        .collect()
}

/// Rewrite call number `call_number` of `caller` into a guarded direct
/// call to `callee_name` when the observed pointer equals
/// `observed_target`.
///
/// Returns `Ok(false)` without touching the module when the call at
/// that ordinal is already direct (nothing to guard) or the ordinal is
/// not present.
pub fn rewrite_callsite(
    module: &mut Module,
    caller: &str,
    call_number: u32,
    observed_target: u64,
    callee_name: &str,
) -> Result<bool, SpecializeError> {
    let callee_sig = match module.function(callee_name) {
        Some(f) if !f.is_declaration() => f.sig.clone(),
        _ => {
            return Err(SpecializeError::SymbolNotFound {
                name: callee_name.to_string(),
            })
        }
    };
    let converters = find_converters(module);

    let func_idx = module
        .functions
        .iter()
        .position(|f| f.name == caller)
        .ok_or_else(|| SpecializeError::SymbolNotFound {
            name: caller.to_string(),
        })?;

    // Locate the call by ordinal, counting every call instruction the
    // way the decorator did when it recorded the number.
    let mut location = None;
    let mut ordinal = 0u32;
    'outer: for (bidx, block) in module.functions[func_idx].blocks.iter().enumerate() {
        for (iidx, (_, inst)) in block.insts.iter().enumerate() {
            match inst {
                Inst::Call { callee, .. } => {
                    log::trace!("drti: {} call_number {} {}", caller, ordinal, callee);
                    if ordinal == call_number {
                        // Already a direct reference; the decorator
                        // should have inlined it ahead of time.
                        log::info!(
                            "drti: {} call_number {} resolved to {}",
                            caller,
                            ordinal,
                            callee_name
                        );
                        return Ok(false);
                    }
                    ordinal += 1;
                }
                Inst::CallIndirect { .. } => {
                    log::trace!("drti: {} call_number {} pointer", caller, ordinal);
                    if ordinal == call_number {
                        location = Some((bidx, iidx));
                        break 'outer;
                    }
                    ordinal += 1;
                }
                _ => {}
            }
        }
    }
    let (call_bidx, call_iidx) = match location {
        Some(loc) => loc,
        None => {
            log::warn!(
                "drti: {} has no call instruction number {}",
                caller,
                call_number
            );
            return Ok(false);
        }
    };

    log::info!(
        "drti: {} call_number {} resolved to {}",
        caller,
        call_number,
        callee_name
    );

    let func = &mut module.functions[func_idx];
    let value_types = func.value_types();

    // Detach the call and everything after it from B1.
    let b1 = BlockId(call_bidx as u32);
    let mut tail_insts = func.blocks[call_bidx].insts.split_off(call_iidx + 1);
    let (call_vid, call_inst) = func.blocks[call_bidx]
        .insts
        .pop()
        .expect("located call instruction");
    let (ptr_val, call_sig, call_args) = match &call_inst {
        Inst::CallIndirect { callee, sig, args } => (*callee, sig.clone(), args.clone()),
        _ => unreachable!("ordinal matched a non-indirect call"),
    };
    let orig_term = std::mem::replace(
        &mut func.blocks[call_bidx].term,
        Terminator::Ret { value: None },
    );

    if call_args.len() != callee_sig.params.len() {
        log::error!(
            "drti: call with {} arguments resolved to {} which expects {}",
            call_args.len(),
            callee_name,
            callee_sig.params.len()
        );
        return Err(SpecializeError::TypeMismatch {
            arg_index: call_args.len().min(callee_sig.params.len()),
        });
    }
    if call_sig.ret != callee_sig.ret {
        log::error!(
            "drti: result type mismatch for call resolved to {} ({} but expecting {})",
            callee_name,
            call_sig.ret,
            callee_sig.ret
        );
        return Err(SpecializeError::TypeMismatch {
            arg_index: callee_sig.params.len(),
        });
    }

    let b2 = BlockId(func.blocks.len() as u32);
    let b3 = BlockId(func.blocks.len() as u32 + 1);
    let b4 = BlockId(func.blocks.len() as u32 + 2);

    // B1 tail: compare the pointer against the observed target.
    let cast_vid = func.alloc_value();
    let const_vid = func.alloc_value();
    let cmp_vid = func.alloc_value();
    {
        let block = &mut func.blocks[call_bidx];
        block.insts.push((
            cast_vid,
            Inst::Cast {
                ty: Ty::I64,
                value: ptr_val,
            },
        ));
        block.insts.push((
            const_vid,
            Inst::ConstInt {
                ty: Ty::I64,
                value: observed_target as i64,
            },
        ));
        block.insts.push((
            cmp_vid,
            Inst::ICmp {
                op: CmpKind::Eq,
                lhs: cast_vid,
                rhs: const_vid,
            },
        ));
        block.term = Terminator::CondBr {
            cond: cmp_vid,
            then_blk: b2,
            else_blk: b3,
        };
    }

    // B2: the direct call, with coerced arguments where needed.
    let mut b2_block = Block::new();
    let mut direct_args: SmallVec<[ValueId; 4]> = SmallVec::new();
    let mut coerced = 0usize;
    for (index, arg) in call_args.iter().enumerate() {
        let arg_ty = &value_types[arg.index()];
        let param_ty = &callee_sig.params[index];
        if arg_ty == param_ty {
            direct_args.push(*arg);
            continue;
        }
        // The polymorphic receiver cannot sit past the second
        // parameter, and a single virtual call never needs more than
        // two coercions; anything else is suspect.
        if coerced >= 2 || index > 1 {
            log_arg_mismatch(callee_name, index, arg_ty, param_ty);
            return Err(SpecializeError::TypeMismatch { arg_index: index });
        }
        let converter = converters
            .iter()
            .find(|c| &c.from == arg_ty && &c.to == param_ty);
        let converter = match converter {
            Some(c) => c,
            None => {
                log_arg_mismatch(callee_name, index, arg_ty, param_ty);
                return Err(SpecializeError::TypeMismatch { arg_index: index });
            }
        };
        let null_vid = func.alloc_value();
        b2_block.insts.push((
            null_vid,
            Inst::ConstPtr {
                ty: param_ty.clone(),
                value: 0,
            },
        ));
        let conv_vid = func.alloc_value();
        b2_block.insts.push((
            conv_vid,
            Inst::Call {
                callee: converter.name.clone(),
                sig: Signature::new(vec![arg_ty.clone(), param_ty.clone()], param_ty.clone()),
                args: SmallVec::from_slice(&[*arg, null_vid]),
            },
        ));
        direct_args.push(conv_vid);
        coerced += 1;
    }

    let direct_vid = if callee_sig.ret.is_value() {
        func.alloc_value()
    } else {
        ValueId::INVALID
    };
    b2_block.insts.push((
        direct_vid,
        Inst::Call {
            callee: callee_name.to_string(),
            sig: callee_sig.clone(),
            args: direct_args,
        },
    ));
    b2_block.term = Terminator::Br { target: b4 };

    // B3: the original indirect call, preserved.
    let mut b3_block = Block::new();
    b3_block.insts.push((call_vid, call_inst));
    b3_block.term = Terminator::Br { target: b4 };

    // B4: merge and the rest of the original block.
    let mut b4_block = Block::new();
    let phi_vid = if call_sig.ret.is_value() {
        let phi_vid = func.alloc_value();
        b4_block.insts.push((
            phi_vid,
            Inst::Phi {
                ty: call_sig.ret.clone(),
                incomings: SmallVec::from_slice(&[(b2, direct_vid), (b3, call_vid)]),
            },
        ));
        Some(phi_vid)
    } else {
        None
    };
    b4_block.insts.append(&mut tail_insts);
    b4_block.term = orig_term;

    func.blocks.push(b2_block);
    func.blocks.push(b3_block);
    func.blocks.push(b4_block);

    // Control now leaves the original block through B4, so phis in its
    // old successors must name B4 as the predecessor.
    for (bidx, block) in func.blocks.iter_mut().enumerate() {
        if bidx == b2.index() || bidx == b3.index() || bidx == b4.index() {
            continue;
        }
        for (_, inst) in &mut block.insts {
            if let Inst::Phi { incomings, .. } = inst {
                for (pred, _) in incomings.iter_mut() {
                    if *pred == b1 {
                        *pred = b4;
                    }
                }
            }
        }
    }

    if let Some(phi_vid) = phi_vid {
        func.replace_uses(call_vid, phi_vid, Some(phi_vid));
    }

    Ok(true)
}

fn log_arg_mismatch(callee: &str, index: usize, arg_ty: &Ty, param_ty: &Ty) {
    log::error!(
        "drti: type mismatch for call resolved to {} at argument {} ({} but expecting {})",
        callee,
        index,
        arg_ty,
        param_ty
    );
}
