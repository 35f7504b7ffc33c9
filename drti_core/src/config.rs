//! Compile-time configuration shared between decorated code and the
//! runtime.
//!
//! These values are part of the ABI: decorated binaries bake them into
//! their call-site stashes and treenodes, and the runtime rejects
//! anything that disagrees.

/// ABI version embedded in every treenode and in the stash magic word.
pub const ABI_VERSION: u32 = 1;

/// Alignment of the return address at every decorated call site.
/// Must be a power of two.
pub const RETALIGN: usize = 32;

/// Size of the stash word placed `RETALIGN` bytes before the return
/// address.
pub const STASH_BYTES: usize = 8;

const _: () = assert!(RETALIGN.is_power_of_two());
const _: () = assert!(STASH_BYTES <= RETALIGN);

/// The magic word written into every call-site stash.
#[inline]
pub const fn stash_magic() -> u64 {
    0xd511 | ((ABI_VERSION as u64) << 16)
}

/// Select the process-wide log level.
///
/// The runtime logs through the `log` facade and never installs a
/// logger itself; the embedding application provides one and picks the
/// level here. The original six levels map onto `log`'s five, with
/// `fatal` reserved for the process-aborting conditions in the
/// back-end pass.
pub fn set_log_level(level: log::LevelFilter) {
    log::set_max_level(level);
}
