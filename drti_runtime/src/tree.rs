//! The accounting graph.
//!
//! Record layouts and field orderings here are part of the ABI with
//! decorated code; everything is `#[repr(C)]` and the offsets the
//! decorator bakes into dispatch sequences are exported as constants.
//!
//! The graph is process-global, append-only and never freed. Nodes are
//! boxed so their addresses stay stable while the per-callsite vector
//! grows; raw back-references are safe because nothing ever moves or
//! dies.

use drti_core::config::ABI_VERSION;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicU8, Ordering};

// =============================================================================
// Reflect records
// =============================================================================

/// Runtime access to a decorated translation unit's bitcode: the
/// embedded module bytes and the parallel array of runtime addresses
/// for its listed globals and external declarations.
#[repr(C)]
pub struct Reflect {
    /// Pointer to the bitcode for the containing module.
    pub module: *const u8,
    /// Size of the bitcode.
    pub module_size: usize,
    /// Addresses of the globals referenced by the bitcode, in the
    /// decorator's enumeration order.
    pub globals: *const usize,
    /// Number of stored addresses.
    pub globals_size: usize,
}

impl Reflect {
    /// The embedded bitcode bytes.
    ///
    /// # Safety
    /// The record must have been emitted by the decorator: pointers
    /// valid for the stated lengths, alive for the process lifetime.
    pub unsafe fn bitcode(&self) -> &'static [u8] {
        unsafe { std::slice::from_raw_parts(self.module, self.module_size) }
    }

    /// The stored address table.
    ///
    /// # Safety
    /// Same requirements as [`Reflect::bitcode`].
    pub unsafe fn address_table(&self) -> &'static [usize] {
        unsafe { std::slice::from_raw_parts(self.globals, self.globals_size) }
    }
}

unsafe impl Send for Reflect {}
unsafe impl Sync for Reflect {}

// =============================================================================
// Landing sites
// =============================================================================

/// Function entry point accounting.
#[repr(C)]
pub struct LandingSite {
    /// Total number of times this entry point was hit.
    pub total_called: AtomicI64,
    /// Name of the global variable referencing this landing site.
    pub global_name: &'static str,
    /// Name of the unique function that references the global.
    pub function_name: &'static str,
    /// Link to the bitcode for the containing module.
    pub reflect: &'static Reflect,
}

impl LandingSite {
    pub const fn new(
        global_name: &'static str,
        function_name: &'static str,
        reflect: &'static Reflect,
    ) -> Self {
        LandingSite {
            total_called: AtomicI64::new(0),
            global_name,
            function_name,
            reflect,
        }
    }
}

// =============================================================================
// Static callsites
// =============================================================================

/// Static information about a call site, unique to the calling
/// location.
#[repr(C)]
pub struct StaticCallsite {
    /// Total calls emanating from this site, regardless of caller and
    /// callee.
    pub total_calls: AtomicI64,
    /// The entry point of the function containing this call site.
    pub landing: &'static LandingSite,
    /// The ordinal of the call instruction within the calling
    /// function, counting from zero. Iterating the function's IR at
    /// run time gives the same sequence as when this number was
    /// recorded ahead of time.
    pub call_number: u32,
    /// One node per call chain passing through this site. Boxes keep
    /// node addresses stable as the vector grows.
    pub nodes: Mutex<Vec<Box<Treenode>>>,
}

impl StaticCallsite {
    pub const fn new(landing: &'static LandingSite, call_number: u32) -> Self {
        StaticCallsite {
            total_calls: AtomicI64::new(0),
            landing,
            call_number,
            nodes: Mutex::new(Vec::new()),
        }
    }
}

unsafe impl Send for StaticCallsite {}
unsafe impl Sync for StaticCallsite {}

// =============================================================================
// Treenodes
// =============================================================================

/// Specialization progress of a treenode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeState {
    /// Created; no landing observed yet.
    Observed = 0,
    /// Landing recorded, specialization scheduled.
    Latched = 1,
    /// Specialization succeeded; the active target was swapped.
    Resolved = 2,
    /// Specialization failed; the original target stays active.
    Failed = 3,
}

/// A node in a call tree: one (caller-context, observed-target) pair
/// at one static callsite. The unit of specialization.
#[repr(C)]
pub struct Treenode {
    /// For runtime detection of ABI mismatch between caller and
    /// landing.
    pub caller_abi_version: u32,
    state: AtomicU8,
    /// Call count for this (parent, target) pair.
    pub chain_calls: AtomicI64,
    /// The static location of the callsite for this node.
    pub location: &'static StaticCallsite,
    /// Upwards in the chain; null for roots observed from undecorated
    /// callers.
    pub parent: *const Treenode,
    /// The function address the caller used.
    pub target: *const u8,
    /// Either the original target or a JIT-compiled version of the
    /// function it addresses. Written once by the specializer; read
    /// without synchronization by dispatch code, which tolerates the
    /// stale (still valid) value.
    resolved_target: AtomicPtr<u8>,
    /// The landing this chain was observed to arrive at. Set at most
    /// once; the absent-then-set transition is the specialization
    /// latch.
    landing: AtomicPtr<LandingSite>,
}

/// Byte offset of the active-target word, for dispatch sequences the
/// decorator emits.
pub const TREENODE_RESOLVED_TARGET_OFFSET: usize =
    std::mem::offset_of!(Treenode, resolved_target);

impl Treenode {
    pub fn new(
        location: &'static StaticCallsite,
        parent: *const Treenode,
        target: *const u8,
    ) -> Self {
        Self::with_abi_version(ABI_VERSION, location, parent, target)
    }

    /// Construct with an explicit ABI version. Real nodes carry the
    /// compiled-in version; mismatch-handling tests and tooling make
    /// stale ones.
    pub fn with_abi_version(
        abi_version: u32,
        location: &'static StaticCallsite,
        parent: *const Treenode,
        target: *const u8,
    ) -> Self {
        Treenode {
            caller_abi_version: abi_version,
            state: AtomicU8::new(NodeState::Observed as u8),
            chain_calls: AtomicI64::new(0),
            location,
            parent,
            target,
            resolved_target: AtomicPtr::new(target as *mut u8),
            landing: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    #[inline]
    pub fn state(&self) -> NodeState {
        match self.state.load(Ordering::Acquire) {
            0 => NodeState::Observed,
            1 => NodeState::Latched,
            2 => NodeState::Resolved,
            _ => NodeState::Failed,
        }
    }

    pub(crate) fn set_state(&self, state: NodeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// The address the guarded dispatch currently uses. Never null.
    #[inline]
    pub fn resolved_target(&self) -> *const u8 {
        self.resolved_target.load(Ordering::Relaxed)
    }

    /// Swap in a freshly compiled entry point. Called exactly once,
    /// by the specializer, on the parent of the latched node.
    pub(crate) fn install_resolved(&self, addr: *const u8) {
        self.resolved_target.store(addr as *mut u8, Ordering::Release);
    }

    /// The landing recorded for this chain, if any.
    #[inline]
    pub fn landing(&self) -> Option<&'static LandingSite> {
        let ptr = self.landing.load(Ordering::Acquire);
        unsafe { ptr.as_ref() }
    }

    /// Record the landing if none is recorded yet. Returns whether
    /// this call performed the transition.
    pub(crate) fn try_latch(&self, site: &'static LandingSite) -> bool {
        let won = self
            .landing
            .compare_exchange(
                std::ptr::null_mut(),
                site as *const LandingSite as *mut LandingSite,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            self.set_state(NodeState::Latched);
        }
        won
    }
}

unsafe impl Send for Treenode {}
unsafe impl Sync for Treenode {}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaked_landing() -> &'static LandingSite {
        let reflect = Box::leak(Box::new(Reflect {
            module: std::ptr::null(),
            module_size: 0,
            globals: std::ptr::null(),
            globals_size: 0,
        }));
        Box::leak(Box::new(LandingSite::new("__drti_local_f", "f", reflect)))
    }

    #[test]
    fn test_new_node_dispatches_to_observed_target() {
        let landing = leaked_landing();
        let site = Box::leak(Box::new(StaticCallsite::new(landing, 0)));
        let node = Treenode::new(site, std::ptr::null(), 0x1234 as *const u8);

        assert_eq!(node.caller_abi_version, ABI_VERSION);
        assert_eq!(node.state(), NodeState::Observed);
        assert_eq!(node.resolved_target(), 0x1234 as *const u8);
        assert!(node.landing().is_none());
    }

    #[test]
    fn test_latch_fires_once() {
        let landing = leaked_landing();
        let site = Box::leak(Box::new(StaticCallsite::new(landing, 0)));
        let node = Treenode::new(site, std::ptr::null(), 0x1234 as *const u8);

        assert!(node.try_latch(landing));
        assert_eq!(node.state(), NodeState::Latched);
        assert!(!node.try_latch(landing));
        assert!(std::ptr::eq(node.landing().unwrap(), landing));
    }

    #[test]
    fn test_install_swaps_active_target() {
        let landing = leaked_landing();
        let site = Box::leak(Box::new(StaticCallsite::new(landing, 0)));
        let node = Treenode::new(site, std::ptr::null(), 0x1234 as *const u8);

        node.install_resolved(0x9999 as *const u8);
        assert_eq!(node.resolved_target(), 0x9999 as *const u8);
        // The observed target is still remembered.
        assert_eq!(node.target, 0x1234 as *const u8);
    }

    #[test]
    fn test_resolved_target_offset_is_stable() {
        // The dispatch sequence reads the active target at this
        // offset; changing the layout is an ABI break.
        let landing = leaked_landing();
        let site = Box::leak(Box::new(StaticCallsite::new(landing, 0)));
        let node = Treenode::new(site, std::ptr::null(), 0x4242 as *const u8);

        let base = &node as *const Treenode as usize;
        let cell = (base + TREENODE_RESOLVED_TARGET_OFFSET) as *const *const u8;
        assert_eq!(unsafe { cell.read() }, 0x4242 as *const u8);
    }
}
