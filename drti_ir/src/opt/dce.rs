//! Dead-code elimination.
//!
//! Value-level: instructions without side effects whose results are
//! never used are dropped. Module-level: non-external definitions that
//! nothing references are dropped — after inlining this is what
//! deletes the spliced-in callee body and its converter helpers.

use crate::module::{Function, Inst, Linkage, Module, ValueId};
use rustc_hash::FxHashSet;

/// Remove dead instructions from one function.
pub fn dce_function(func: &mut Function) -> bool {
    let nvalues = func.next_value as usize;
    let mut live = vec![false; nvalues];

    // Roots: side-effecting instructions and terminators.
    for block in &func.blocks {
        for (_, inst) in &block.insts {
            if inst.has_side_effects() {
                inst.for_each_operand(|v| live[v.index()] = true);
            }
        }
        block.term.for_each_operand(|v| live[v.index()] = true);
    }

    // Propagate through defining instructions to a fixed point.
    loop {
        let mut grew = false;
        for block in &func.blocks {
            for (id, inst) in &block.insts {
                if *id != ValueId::INVALID && live[id.index()] {
                    inst.for_each_operand(|v| {
                        if !live[v.index()] {
                            live[v.index()] = true;
                            grew = true;
                        }
                    });
                }
            }
        }
        if !grew {
            break;
        }
    }

    let mut changed = false;
    for block in &mut func.blocks {
        let before = block.insts.len();
        block
            .insts
            .retain(|(id, inst)| inst.has_side_effects() || live[id.index()]);
        changed |= block.insts.len() != before;
    }
    changed
}

/// Remove dead instructions everywhere, then drop unreferenced
/// non-external definitions.
pub fn dce_module(module: &mut Module) -> bool {
    let mut changed = false;
    for func in &mut module.functions {
        if !func.is_declaration() {
            changed |= dce_function(func);
        }
    }

    let referenced: FxHashSet<String> = module.referenced_symbols();

    let before = module.functions.len();
    module.functions.retain(|f| {
        f.linkage == Linkage::External || referenced.contains(&f.name)
    });
    changed |= module.functions.len() != before;

    let before = module.globals.len();
    module.globals.retain(|g| {
        g.linkage == Linkage::External || referenced.contains(&g.name)
    });
    changed |= module.globals.len() != before;

    changed
}

/// True when the function still contains a call to `name`; used by
/// tests asserting that inline+DCE fully absorbed a callee.
pub fn calls_symbol(func: &Function, name: &str) -> bool {
    func.blocks.iter().any(|b| {
        b.insts
            .iter()
            .any(|(_, i)| matches!(i, Inst::Call { callee, .. } if callee == name))
    })
}
