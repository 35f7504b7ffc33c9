//! Call-site stash layout.
//!
//! Every decorated indirect call site aligns its return address to
//! [`RETALIGN`](crate::config::RETALIGN) bytes and places an 8-byte
//! little-endian magic word exactly `RETALIGN` bytes before it. The
//! bytes between the stash and the call instruction are `0x90` (NOP)
//! padding that execution jumps over.
//!
//! Anything holding only a return address into decorated code — an
//! unwinder, a sampling profiler, or the landing-site validation in
//! the instrumentation itself — can recover and verify the caller's
//! identity through this word.

use crate::config::{stash_magic, RETALIGN};

/// Address of the stash word for a given return address.
#[inline]
pub fn stash_address(return_address: usize) -> usize {
    (return_address & !(RETALIGN - 1)).wrapping_sub(RETALIGN)
}

/// Read the stash word in front of `return_address`.
///
/// # Safety
/// `stash_address(return_address)` must be readable. For a return
/// address into mapped code this holds whenever the preceding
/// `RETALIGN` bytes are part of the same mapping, which the emitter
/// guarantees for decorated call sites.
#[inline]
pub unsafe fn read_stash(return_address: usize) -> u64 {
    let addr = stash_address(return_address) as *const u64;
    unsafe { addr.read_unaligned() }
}

/// Check whether `return_address` points just past a decorated call.
///
/// # Safety
/// Same requirements as [`read_stash`].
#[inline]
pub unsafe fn validate_return_address(return_address: usize) -> bool {
    unsafe { read_stash(return_address) == stash_magic() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stash_address_alignment() {
        // An aligned return address looks back exactly RETALIGN bytes.
        assert_eq!(stash_address(0x1000), 0x1000 - RETALIGN);
        // An unaligned one is masked down first.
        assert_eq!(stash_address(0x1007), 0x1000 - RETALIGN);
    }

    #[test]
    fn test_validate_against_in_memory_stash() {
        // Lay out [magic][RETALIGN bytes of padding/"call"] in a buffer
        // and validate the simulated return address at the end.
        let mut buf = vec![0u8; RETALIGN * 4];
        let base = buf.as_ptr() as usize;
        let aligned = (base + RETALIGN * 2) & !(RETALIGN - 1);
        let stash_at = aligned - RETALIGN;
        let offset = stash_at - base;
        buf[offset..offset + 8].copy_from_slice(&stash_magic().to_le_bytes());

        assert!(unsafe { validate_return_address(aligned) });
        assert!(!unsafe { validate_return_address(aligned + RETALIGN) });
    }
}
