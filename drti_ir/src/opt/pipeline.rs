//! Pass ordering and fixed-point iteration.
//!
//! Module level: inline → simplify → DCE until nothing changes or the
//! iteration cap is hit. Function level: simplify + DCE on one
//! function, used on the rewritten caller only — the callee is assumed
//! already optimized ahead of time.

use super::dce::{dce_function, dce_module};
use super::inline::{inline_module, InlineConfig};
use super::simplify::{simplify_function, simplify_module};
use crate::module::Module;

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Inliner cost threshold.
    pub inline_threshold: i32,
    /// Cap on module-level iterations.
    pub max_iterations: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            inline_threshold: 225,
            max_iterations: 8,
        }
    }
}

impl PipelineConfig {
    /// The specializer's configuration: inline a lot.
    pub fn aggressive() -> Self {
        PipelineConfig {
            inline_threshold: 1000,
            ..Default::default()
        }
    }
}

/// Run the module pipeline to a fixed point.
pub fn optimize_module(module: &mut Module, config: &PipelineConfig) {
    let inline_cfg = InlineConfig {
        threshold: config.inline_threshold,
    };
    for iteration in 0..config.max_iterations {
        let mut changed = false;
        changed |= inline_module(module, &inline_cfg);
        changed |= simplify_module(module);
        changed |= dce_module(module);
        if !changed {
            log::trace!(
                "drti: module pipeline converged after {} iteration(s)",
                iteration + 1
            );
            break;
        }
    }
}

/// Run the function-level passes on a single function.
pub fn optimize_function(module: &mut Module, name: &str) {
    if let Some(func) = module.function_mut(name) {
        if !func.is_declaration() {
            loop {
                let mut changed = false;
                changed |= simplify_function(func);
                changed |= dce_function(func);
                if !changed {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{FunctionBuilder, ModuleBuilder};
    use crate::module::{BinOpKind, Inst, Linkage};
    use crate::opt::dce::calls_symbol;
    use crate::types::{Signature, Ty};

    /// An end-to-end shrink: after inlining, constants fold, the
    /// callee body disappears.
    #[test]
    fn test_pipeline_absorbs_linkonce_callee() {
        let mut cb = FunctionBuilder::new("callee", Signature::new(vec![], Ty::I64));
        let a = cb.const_int(Ty::I64, 40);
        let b = cb.const_int(Ty::I64, 2);
        let sum = cb.binop(BinOpKind::Add, Ty::I64, a, b);
        cb.ret(Some(sum));
        let mut callee = cb.finish();
        callee.linkage = Linkage::LinkOnce;
        callee.always_inline = true;

        let mut fb = FunctionBuilder::new("caller", Signature::new(vec![], Ty::I64));
        let r = fb.call("callee", Signature::new(vec![], Ty::I64), &[]);
        fb.ret(Some(r));

        let mut mb = ModuleBuilder::new("m");
        mb.add_function(callee).add_function(fb.finish());
        let mut module = mb.build();

        optimize_module(&mut module, &PipelineConfig::aggressive());

        let caller = module.function("caller").unwrap();
        assert!(!calls_symbol(caller, "callee"));
        assert!(module.function("callee").is_none(), "absorbed and dropped");

        // The merged function returns a constant.
        let all_insts: Vec<&Inst> = caller
            .blocks
            .iter()
            .flat_map(|b| b.insts.iter().map(|(_, i)| i))
            .collect();
        assert!(all_insts
            .iter()
            .any(|i| matches!(i, Inst::ConstInt { value: 42, .. })));
    }

    #[test]
    fn test_function_pass_only_touches_named_function() {
        let mut fa = FunctionBuilder::new("a", Signature::new(vec![], Ty::I64));
        let x = fa.const_int(Ty::I64, 1);
        let y = fa.const_int(Ty::I64, 2);
        let s = fa.binop(BinOpKind::Add, Ty::I64, x, y);
        fa.ret(Some(s));

        let mut fbuild = FunctionBuilder::new("b", Signature::new(vec![], Ty::I64));
        let x = fbuild.const_int(Ty::I64, 3);
        let y = fbuild.const_int(Ty::I64, 4);
        let s = fbuild.binop(BinOpKind::Add, Ty::I64, x, y);
        fbuild.ret(Some(s));

        let mut mb = ModuleBuilder::new("m");
        mb.add_function(fa.finish()).add_function(fbuild.finish());
        let mut module = mb.build();

        optimize_function(&mut module, "a");

        let folded = |f: &crate::module::Function| {
            f.blocks[0]
                .insts
                .iter()
                .any(|(_, i)| matches!(i, Inst::ConstInt { value: 3, .. } | Inst::ConstInt { value: 7, .. }))
        };
        assert!(folded(module.function("a").unwrap()));
        // "b" still has its unfolded add.
        assert!(module.function("b").unwrap().blocks[0]
            .insts
            .iter()
            .any(|(_, i)| matches!(i, Inst::BinOp { .. })));
    }
}
