//! Function inlining.
//!
//! Body-splicing inliner driven by a size cost model. The specializer
//! runs it with a threshold well above the default so the freshly
//! linked callee is embedded even when it is sizable; the
//! `always_inline` hint placed on that callee bypasses the model
//! entirely.

use crate::module::{Block, BlockId, Function, Inst, Module, Terminator, ValueId};
use smallvec::SmallVec;

/// Cost charged per instruction of the candidate callee.
const COST_PER_INST: i32 = 5;

/// Inliner configuration.
#[derive(Debug, Clone)]
pub struct InlineConfig {
    /// Inline callees whose cost does not exceed this.
    pub threshold: i32,
}

impl Default for InlineConfig {
    fn default() -> Self {
        InlineConfig { threshold: 225 }
    }
}

fn body_cost(func: &Function) -> i32 {
    let insts: usize = func.blocks.iter().map(|b| b.insts.len()).sum();
    insts as i32 * COST_PER_INST
}

fn inlinable(callee: &Function, cfg: &InlineConfig) -> bool {
    if callee.is_declaration() {
        return false;
    }
    // A body that inspects its own return address must keep its frame.
    let reads_frame = callee
        .blocks
        .iter()
        .any(|b| b.insts.iter().any(|(_, i)| matches!(i, Inst::RetAddr)));
    if reads_frame {
        return false;
    }
    callee.always_inline || body_cost(callee) <= cfg.threshold
}

/// Hard cap on inline steps per sweep; recursive cycles between small
/// functions would otherwise re-expose a call with every splice.
const MAX_INLINE_STEPS: usize = 64;

/// Inline eligible direct calls until none remain. Returns whether
/// anything changed.
pub fn inline_module(module: &mut Module, cfg: &InlineConfig) -> bool {
    let mut changed = false;
    for step in 0..MAX_INLINE_STEPS {
        let candidate = find_candidate(module, cfg);
        let (func_idx, block_idx, inst_idx) = match candidate {
            Some(c) => c,
            None => return changed,
        };
        inline_one(module, func_idx, block_idx, inst_idx);
        changed = true;
        if step + 1 == MAX_INLINE_STEPS {
            log::warn!("drti: inliner stopped after {} steps", MAX_INLINE_STEPS);
        }
    }
    changed
}

fn find_candidate(module: &Module, cfg: &InlineConfig) -> Option<(usize, usize, usize)> {
    for (fi, func) in module.functions.iter().enumerate() {
        for (bi, block) in func.blocks.iter().enumerate() {
            for (ii, (_, inst)) in block.insts.iter().enumerate() {
                let (callee, sig, args) = match inst {
                    Inst::Call { callee, sig, args } => (callee, sig, args),
                    _ => continue,
                };
                if callee == &func.name {
                    continue;
                }
                let target = match module.function(callee) {
                    Some(t) => t,
                    None => continue,
                };
                if !inlinable(target, cfg) {
                    continue;
                }
                if args.len() != target.sig.params.len() || sig.ret != target.sig.ret {
                    continue;
                }
                // A value-returning callee must actually return
                // somewhere for the result to have a definition.
                if sig.ret.is_value() && !has_returning_exit(target) {
                    continue;
                }
                return Some((fi, bi, ii));
            }
        }
    }
    None
}

fn has_returning_exit(func: &Function) -> bool {
    func.blocks.iter().any(|b| {
        matches!(
            b.term,
            Terminator::Ret { value: Some(_) } | Terminator::TailCall { .. }
        )
    })
}

fn inline_one(module: &mut Module, func_idx: usize, block_idx: usize, inst_idx: usize) {
    let callee_name = match &module.functions[func_idx].blocks[block_idx].insts[inst_idx].1 {
        Inst::Call { callee, .. } => callee.clone(),
        _ => unreachable!(),
    };
    let callee = module
        .function(&callee_name)
        .expect("candidate callee exists")
        .clone();
    log::trace!(
        "drti: inlining {} into {}",
        callee_name,
        module.functions[func_idx].name
    );
    let func = &mut module.functions[func_idx];

    // Detach the call and the rest of its block.
    let split_block = BlockId(block_idx as u32);
    let mut tail_insts = func.blocks[block_idx].insts.split_off(inst_idx + 1);
    let (call_vid, call_inst) = func.blocks[block_idx].insts.pop().expect("call present");
    let (sig, args) = match call_inst {
        Inst::Call { sig, args, .. } => (sig, args),
        _ => unreachable!(),
    };
    let orig_term = std::mem::replace(
        &mut func.blocks[block_idx].term,
        Terminator::Ret { value: None },
    );

    let base = func.blocks.len() as u32;
    let cont = BlockId(base + callee.blocks.len() as u32);

    // Map callee values into the caller: parameters become the call
    // arguments, everything else gets fresh ids.
    let nparams = callee.sig.params.len();
    let mut vmap = vec![ValueId::INVALID; callee.next_value as usize];
    for (i, arg) in args.iter().enumerate() {
        vmap[i] = *arg;
    }
    for slot in vmap.iter_mut().skip(nparams) {
        *slot = func.alloc_value();
    }
    let remap = |v: ValueId, vmap: &[ValueId]| -> ValueId { vmap[v.index()] };

    // Splice the callee's blocks, rewriting returns into jumps to the
    // continuation.
    let mut returns: Vec<(BlockId, Option<ValueId>)> = Vec::new();
    for (cbi, cblock) in callee.blocks.iter().enumerate() {
        let this_block = BlockId(base + cbi as u32);
        let mut nb = Block::new();
        for (id, inst) in &cblock.insts {
            let mut ni = inst.clone();
            ni.for_each_operand_mut(|v| *v = remap(*v, &vmap));
            if let Inst::Phi { incomings, .. } = &mut ni {
                for (pred, _) in incomings.iter_mut() {
                    *pred = BlockId(base + pred.0);
                }
            }
            let nid = if *id == ValueId::INVALID {
                ValueId::INVALID
            } else {
                remap(*id, &vmap)
            };
            nb.insts.push((nid, ni));
        }
        nb.term = match cblock.term.clone() {
            Terminator::Ret { value } => {
                returns.push((this_block, value.map(|v| remap(v, &vmap))));
                Terminator::Br { target: cont }
            }
            Terminator::Br { target } => Terminator::Br {
                target: BlockId(base + target.0),
            },
            Terminator::CondBr {
                cond,
                then_blk,
                else_blk,
            } => Terminator::CondBr {
                cond: remap(cond, &vmap),
                then_blk: BlockId(base + then_blk.0),
                else_blk: BlockId(base + else_blk.0),
            },
            Terminator::TailCall {
                callee: tc_callee,
                sig: tc_sig,
                args: tc_args,
            } => {
                // Inside an inlined body a tail call degenerates into
                // an ordinary call followed by the continuation.
                let result = if tc_sig.ret.is_value() {
                    func.alloc_value()
                } else {
                    ValueId::INVALID
                };
                let mapped_args: SmallVec<[ValueId; 4]> =
                    tc_args.iter().map(|v| remap(*v, &vmap)).collect();
                nb.insts.push((
                    result,
                    Inst::CallIndirect {
                        callee: remap(tc_callee, &vmap),
                        sig: tc_sig.clone(),
                        args: mapped_args,
                    },
                ));
                returns.push((
                    this_block,
                    if tc_sig.ret.is_value() {
                        Some(result)
                    } else {
                        None
                    },
                ));
                Terminator::Br { target: cont }
            }
        };
        func.blocks.push(nb);
    }

    // Continuation: merge return values, then the original tail.
    let mut cont_block = Block::new();
    if sig.ret.is_value() {
        let incomings: SmallVec<[(BlockId, ValueId); 2]> = returns
            .iter()
            .map(|(b, v)| (*b, v.expect("returning exit carries a value")))
            .collect();
        let phi_vid = func.alloc_value();
        cont_block.insts.push((
            phi_vid,
            Inst::Phi {
                ty: sig.ret.clone(),
                incomings,
            },
        ));
        cont_block.insts.append(&mut tail_insts);
        cont_block.term = orig_term;
        func.blocks.push(cont_block);
        func.replace_uses(call_vid, phi_vid, Some(phi_vid));
    } else {
        cont_block.insts.append(&mut tail_insts);
        cont_block.term = orig_term;
        func.blocks.push(cont_block);
    }

    // Phis in the split block's old successors now receive control
    // from the continuation.
    for block in &mut func.blocks {
        for (_, inst) in &mut block.insts {
            if let Inst::Phi { incomings, .. } = inst {
                for (pred, _) in incomings.iter_mut() {
                    if *pred == split_block {
                        *pred = cont;
                    }
                }
            }
        }
    }
}
