//! The caller-context carrier-register pass.
//!
//! Decorated code carries a hidden `Treenode*` from caller to callee
//! without touching the public ABI — similar to the Swift calling
//! convention's context parameter, but with no custom convention and
//! fully optional at both ends. The decorator emits two pseudo
//! intrinsics as ordinary external calls; this pass, running on
//! machine IR before emission, rewrites them into traffic through a
//! callee-saved register the ABI never uses for arguments (R14 on
//! x86-64 System V):
//!
//! - `_drti_caller()`: the first subsequent read of the return
//!   register is redirected to the carrier, and the call disappears.
//!   The carrier is live-in at entry; the prologue's save keeps it
//!   intact for this function's own caller.
//! - `_drti_set_caller(node)`: the next call in the block is the sink
//!   that receives the context. A copy from the first-argument
//!   register into the carrier replaces the pseudo call (the argument
//!   register provably holds the node there), and the sink is flagged
//!   for stash alignment so the context remains recoverable from its
//!   return address. The sink must not be tail-called away or the
//!   return address — and the stash with it — disappears.
//!
//! Failures here mean the compilation pipeline upstream is broken, not
//! that runtime data is bad, so both are process-fatal.

use crate::backend::x64::registers::SYSV_CARRIER;
use crate::backend::x64::Gpr;
use crate::minst::{MFunction, MInst};

/// Symbol of the "read current caller context" pseudo-intrinsic.
pub const READ_CALLER_SYMBOL: &str = "_drti_caller";

/// Symbol of the "set caller context for the next call"
/// pseudo-intrinsic.
pub const SET_CALLER_SYMBOL: &str = "_drti_set_caller";

/// The target-specific registers the pass needs. Porting to another
/// architecture means providing another instance: a callee-saved
/// register that takes no part in argument passing.
#[derive(Debug, Clone, Copy)]
pub struct CarrierAbi {
    /// Carries the caller context across the call.
    pub carrier: Gpr,
    /// The ABI return register the read intrinsic's result lands in.
    pub return_reg: Gpr,
    /// The ABI first-argument register holding the set intrinsic's
    /// argument.
    pub first_arg: Gpr,
}

impl CarrierAbi {
    /// x86-64 System V.
    pub const fn system_v() -> Self {
        CarrierAbi {
            carrier: SYSV_CARRIER,
            return_reg: Gpr::Rax,
            first_arg: Gpr::Rdi,
        }
    }
}

impl Default for CarrierAbi {
    fn default() -> Self {
        Self::system_v()
    }
}

fn is_pseudo_call<'i>(inst: &'i MInst) -> Option<&'i str> {
    match inst {
        MInst::CallSym { sym, .. }
            if sym == READ_CALLER_SYMBOL || sym == SET_CALLER_SYMBOL =>
        {
            Some(sym.as_str())
        }
        _ => None,
    }
}

/// Rewrite both pseudo-intrinsics in a lowered function.
pub fn run_context_pass(func: &mut MFunction, abi: &CarrierAbi) {
    log::trace!("drti: context pass on {}", func.name);
    for block_idx in 0..func.blocks.len() {
        let mut i = 0;
        while i < func.blocks[block_idx].insts.len() {
            let pseudo = is_pseudo_call(&func.blocks[block_idx].insts[i]).map(str::to_owned);
            match pseudo.as_deref() {
                Some(READ_CALLER_SYMBOL) => {
                    resolve_caller(func, abi, block_idx, i);
                    // The pseudo call was removed; the rewritten use
                    // now sits at index i.
                }
                Some(SET_CALLER_SYMBOL) => {
                    resolve_set_caller(func, abi, block_idx, i);
                    i += 1;
                }
                _ => i += 1,
            }
        }
    }
}

/// Redirect the first use of the return register after the pseudo call
/// to the carrier, then drop the call.
fn resolve_caller(func: &mut MFunction, abi: &CarrierAbi, block_idx: usize, call_idx: usize) {
    let block = &mut func.blocks[block_idx];
    let mut replaced = false;
    for inst in block.insts.iter_mut().skip(call_idx + 1) {
        if inst.replace_reg_use(abi.return_reg, abi.carrier) {
            replaced = true;
            break;
        }
    }
    if !replaced {
        // A broken decorator, not bad runtime data.
        panic!(
            "context pass: no use of {} in block after {}",
            abi.return_reg, READ_CALLER_SYMBOL
        );
    }
    block.insts.remove(call_idx);
}

/// Replace the pseudo call with a copy into the carrier and flag the
/// sink call for stash alignment.
fn resolve_set_caller(func: &mut MFunction, abi: &CarrierAbi, block_idx: usize, call_idx: usize) {
    let block = &mut func.blocks[block_idx];
    let mut sink = None;
    for (j, inst) in block.insts.iter().enumerate().skip(call_idx + 1) {
        if inst.is_call() {
            sink = Some(j);
            break;
        }
    }
    let sink = match sink {
        Some(j) => j,
        None => panic!(
            "context pass: no call found in block after {}",
            SET_CALLER_SYMBOL
        ),
    };
    match &mut block.insts[sink] {
        MInst::CallSym { stash, .. } | MInst::CallReg { stash, .. } => *stash = true,
        _ => unreachable!(),
    }
    // The first-argument register holds the node exactly where the
    // pseudo call sat; the sink's own argument setup comes later and
    // may clobber it.
    block.insts[call_idx] = MInst::MovRR {
        dst: abi.carrier,
        src: abi.first_arg,
    };
}
