//! The runtime's single public entry point.
//!
//! `drti_inspect` is handed every freshly latched treenode: it checks
//! the ABI version, logs the observed chain, and — for nodes with a
//! known caller — kicks off specialization. Every specialization
//! failure is absorbed here; the node goes to `Failed` and the
//! original indirect path keeps running.

use crate::specialize;
use crate::tree::{NodeState, Treenode};
use drti_core::config::ABI_VERSION;

fn abi_ok(caller_abi: u32) -> bool {
    if caller_abi != ABI_VERSION {
        log::error!(
            "drti: ABI mismatch client {} != runtime {}",
            caller_abi,
            ABI_VERSION
        );
        false
    } else {
        true
    }
}

fn log_treenode(node: &Treenode) {
    if log::log_enabled!(log::Level::Info) {
        let parent_desc = match unsafe { node.parent.as_ref() } {
            Some(parent) => {
                let landing = parent.location.landing;
                format!(
                    "{} * {} via {:p}",
                    landing.total_called.load(std::sync::atomic::Ordering::Relaxed),
                    landing.global_name,
                    parent.target,
                )
            }
            None => "(unknown)".to_string(),
        };
        let own_landing = node.location.landing;
        let landed_desc = match node.landing() {
            Some(landing) => format!(
                "{} * {} ({} total)",
                node.chain_calls.load(std::sync::atomic::Ordering::Relaxed),
                landing.function_name,
                landing.total_called.load(std::sync::atomic::Ordering::Relaxed),
            ),
            None => "(no landing)".to_string(),
        };
        log::info!(
            "drti: {} -> {} * {} {} visits via {:p} -> {}",
            parent_desc,
            own_landing.total_called.load(std::sync::atomic::Ordering::Relaxed),
            own_landing.function_name,
            node.location.total_calls.load(std::sync::atomic::Ordering::Relaxed),
            node.target,
            landed_desc,
        );
    }
}

/// Inspect a treenode that may be of interest. Called by the
/// instrumentation on the landing latch; safe to call from tooling
/// with any immortal treenode.
#[no_mangle]
pub extern "C" fn drti_inspect(node: *mut Treenode) {
    let node: &'static Treenode = match unsafe { node.as_ref() } {
        Some(node) => node,
        None => return,
    };

    if !abi_ok(node.caller_abi_version) {
        return;
    }

    log_treenode(node);

    // Roots have no caller to recompile.
    if node.parent.is_null() {
        return;
    }

    if let Err(err) = specialize::compile_treenode(node) {
        node.set_state(NodeState::Failed);
        log::error!(
            "drti: {} specialization failed: {}",
            node.location.landing.function_name,
            err
        );
    }
}
