//! Local simplification: constant folding, branch folding, degenerate
//! phi elimination, unreachable-block removal.

use crate::module::{BinOpKind, BlockId, CmpKind, Function, Inst, Module, Terminator, ValueId};
use crate::types::Ty;
use rustc_hash::FxHashMap;

/// Simplify every defined function. Returns whether anything changed.
pub fn simplify_module(module: &mut Module) -> bool {
    let mut changed = false;
    for func in &mut module.functions {
        if !func.is_declaration() {
            changed |= simplify_function(func);
        }
    }
    changed
}

/// One simplification sweep over a single function.
pub fn simplify_function(func: &mut Function) -> bool {
    let mut changed = false;
    changed |= fold_constants(func);
    changed |= fold_branches(func);
    changed |= collapse_trivial_phis(func);
    changed |= remove_unreachable_blocks(func);
    changed
}

/// Known integer constants by value id.
fn constant_map(func: &Function) -> FxHashMap<ValueId, i64> {
    let mut consts = FxHashMap::default();
    for block in &func.blocks {
        for (id, inst) in &block.insts {
            match inst {
                Inst::ConstInt { value, .. } => {
                    consts.insert(*id, *value);
                }
                Inst::ConstPtr { value, .. } => {
                    consts.insert(*id, *value as i64);
                }
                _ => {}
            }
        }
    }
    consts
}

fn fold_constants(func: &mut Function) -> bool {
    let consts = constant_map(func);
    let mut changed = false;
    for block in &mut func.blocks {
        for (_, inst) in &mut block.insts {
            match inst {
                Inst::BinOp { op, ty, lhs, rhs } => {
                    if let (Some(&a), Some(&b)) = (consts.get(lhs), consts.get(rhs)) {
                        let value = match op {
                            BinOpKind::Add => a.wrapping_add(b),
                            BinOpKind::Sub => a.wrapping_sub(b),
                            BinOpKind::Mul => a.wrapping_mul(b),
                            BinOpKind::And => a & b,
                            BinOpKind::Or => a | b,
                            BinOpKind::Xor => a ^ b,
                        };
                        *inst = Inst::ConstInt {
                            ty: ty.clone(),
                            value,
                        };
                        changed = true;
                    }
                }
                Inst::ICmp { op, lhs, rhs } => {
                    if let (Some(&a), Some(&b)) = (consts.get(lhs), consts.get(rhs)) {
                        let value = match op {
                            CmpKind::Eq => a == b,
                            CmpKind::Ne => a != b,
                            CmpKind::Lt => a < b,
                            CmpKind::Gt => a > b,
                        } as i64;
                        *inst = Inst::ConstInt { ty: Ty::I8, value };
                        changed = true;
                    }
                }
                Inst::Cast { ty, value } => {
                    if let Some(&bits) = consts.get(value) {
                        *inst = if ty.is_ptr() {
                            Inst::ConstPtr {
                                ty: ty.clone(),
                                value: bits as u64,
                            }
                        } else {
                            Inst::ConstInt {
                                ty: ty.clone(),
                                value: bits,
                            }
                        };
                        changed = true;
                    }
                }
                _ => {}
            }
        }
    }
    changed
}

fn fold_branches(func: &mut Function) -> bool {
    let consts = constant_map(func);
    let mut folded: Vec<(usize, BlockId, BlockId)> = Vec::new();
    for (bidx, block) in func.blocks.iter().enumerate() {
        if let Terminator::CondBr {
            cond,
            then_blk,
            else_blk,
        } = &block.term
        {
            if let Some(&c) = consts.get(cond) {
                let (taken, dropped) = if c != 0 {
                    (*then_blk, *else_blk)
                } else {
                    (*else_blk, *then_blk)
                };
                folded.push((bidx, taken, dropped));
            }
        }
    }
    for (bidx, taken, dropped) in &folded {
        func.blocks[*bidx].term = Terminator::Br { target: *taken };
        // The dropped edge disappears; its phi incomings go with it
        // when the block becomes unreachable, or here if it stays
        // reachable through other predecessors.
        let pred = BlockId(*bidx as u32);
        if let Some(block) = func.blocks.get_mut(dropped.index()) {
            for (_, inst) in &mut block.insts {
                if let Inst::Phi { incomings, .. } = inst {
                    incomings.retain(|(b, _)| *b != pred);
                }
            }
        }
    }
    !folded.is_empty()
}

fn collapse_trivial_phis(func: &mut Function) -> bool {
    let mut replacements: Vec<(ValueId, ValueId)> = Vec::new();
    for block in &func.blocks {
        for (id, inst) in &block.insts {
            if let Inst::Phi { incomings, .. } = inst {
                if incomings.is_empty() {
                    continue;
                }
                let first = incomings[0].1;
                if incomings.iter().all(|(_, v)| *v == first) && first != *id {
                    replacements.push((*id, first));
                }
            }
        }
    }
    for (old, new) in &replacements {
        func.replace_uses(*old, *new, None);
        // The phi itself is now dead; DCE collects it.
    }
    !replacements.is_empty()
}

fn remove_unreachable_blocks(func: &mut Function) -> bool {
    let nblocks = func.blocks.len();
    let mut reachable = vec![false; nblocks];
    let mut stack = vec![BlockId::ENTRY];
    while let Some(block) = stack.pop() {
        if reachable[block.index()] {
            continue;
        }
        reachable[block.index()] = true;
        for succ in func.blocks[block.index()].term.successors() {
            stack.push(succ);
        }
    }
    if reachable.iter().all(|r| *r) {
        return false;
    }

    // Compact the block vector and renumber every reference.
    let mut remap = vec![BlockId(u32::MAX); nblocks];
    let mut kept = Vec::with_capacity(nblocks);
    for (idx, block) in func.blocks.drain(..).enumerate() {
        if reachable[idx] {
            remap[idx] = BlockId(kept.len() as u32);
            kept.push(block);
        }
    }
    func.blocks = kept;

    for block in &mut func.blocks {
        block.term.for_each_successor_mut(|b| *b = remap[b.index()]);
        for (_, inst) in &mut block.insts {
            if let Inst::Phi { incomings, .. } = inst {
                incomings.retain(|(pred, _)| reachable[pred.index()]);
                for (pred, _) in incomings.iter_mut() {
                    *pred = remap[pred.index()];
                }
            }
        }
    }
    true
}
