//! Instrumentation intrinsics called from decorated code.
//!
//! The decorator contract, per decorated function:
//! - the prologue reads the raw carrier value, validates it against
//!   the call-site stash through [`_drti_validate_caller`], and
//!   reports the entry through [`_drti_landed`];
//! - every instrumented call site obtains its treenode through
//!   [`_drti_call_from`], dispatches through the node's active
//!   target, and threads the node to the callee as the new caller
//!   context.
//!
//! All three are exported with C linkage so generated code can resolve
//! them through the process-symbol registry.

use crate::inspect::drti_inspect;
use crate::tree::{LandingSite, StaticCallsite, Treenode};
use drti_core::config::ABI_VERSION;
use drti_core::stash::validate_return_address;
use std::sync::atomic::Ordering;

/// Count a call at `site` and find or create the treenode for the
/// (caller, target) pair. The returned node's chain counter is
/// incremented. Null callers are allowed and create tree roots.
///
/// # Safety
/// `site` must point to an immortal callsite record; `caller` must be
/// null or a pointer previously returned from this function.
#[no_mangle]
pub unsafe extern "C" fn _drti_call_from(
    site: *mut StaticCallsite,
    caller: *mut Treenode,
    target: *const u8,
) -> *mut Treenode {
    let site: &'static StaticCallsite = unsafe { &*site };
    site.total_calls.fetch_add(1, Ordering::Relaxed);

    let mut nodes = site.nodes.lock();
    // Linear scan: the node count is bounded by the site's observed
    // polymorphic fan-out, which stays small.
    for node in nodes.iter() {
        if node.parent == caller as *const Treenode && node.target == target {
            node.chain_calls.fetch_add(1, Ordering::Relaxed);
            return &**node as *const Treenode as *mut Treenode;
        }
    }

    if !caller.is_null() {
        debug_assert_eq!(unsafe { (*caller).caller_abi_version }, ABI_VERSION);
    }

    nodes.push(Box::new(Treenode::new(site, caller, target)));
    let node = nodes.last().expect("just pushed");
    node.chain_calls.fetch_add(1, Ordering::Relaxed);
    &**node as *const Treenode as *mut Treenode
}

/// Count an entry at `site`. The first time a caller context lands
/// here, record the landing on it and hand it to the runtime — the
/// single latch that triggers specialization.
///
/// # Safety
/// `site` must point to an immortal landing record; `caller` must be
/// null or a valid treenode pointer.
#[no_mangle]
pub unsafe extern "C" fn _drti_landed(site: *mut LandingSite, caller: *mut Treenode) {
    let site: &'static LandingSite = unsafe { &*site };
    site.total_called.fetch_add(1, Ordering::Relaxed);

    if caller.is_null() {
        return;
    }
    let node: &Treenode = unsafe { &*caller };

    if let Some(existing) = node.landing() {
        // One landing per target address, absent thunks that change
        // destination.
        debug_assert!(std::ptr::eq(existing, site));
    } else if node.caller_abi_version == ABI_VERSION && node.try_latch(site) {
        drti_inspect(caller);
    }
}

/// Filter a raw carrier value against the call-site stash: the
/// context is only trusted when the magic word sits `RETALIGN` bytes
/// before the (aligned) return address. Contexts arriving from
/// undecorated callers fail the check and become null roots.
///
/// # Safety
/// `return_address` must be a return address into mapped code whose
/// preceding `RETALIGN` bytes are readable.
#[no_mangle]
pub unsafe extern "C" fn _drti_validate_caller(
    ctx: *mut Treenode,
    return_address: *const u8,
) -> *mut Treenode {
    if ctx.is_null() {
        return std::ptr::null_mut();
    }
    if unsafe { validate_return_address(return_address as usize) } {
        ctx
    } else {
        std::ptr::null_mut()
    }
}
