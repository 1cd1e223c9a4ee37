//! seL4 Platform Adapter Layer
//!
//! Provides a unified API by re-exporting the active backend together with
//! a few helpers for checking invocation results.

// ========== Mock Mode ==========
#[cfg(feature = "mock")]
pub use sel4_mock_sys::*;

// ========== Type Aliases ==========

#[cfg(feature = "mock")]
pub type Error = sel4_mock_sys::seL4_Error;

// ========== Helper Functions ==========

#[inline]
pub fn is_ok(err: Error) -> bool {
    err == seL4_NoError
}

#[inline]
pub fn is_err(err: Error) -> bool {
    !is_ok(err)
}

/// Depth argument for CNode invocations, which take it as a byte
#[inline]
pub fn depth(bits: usize) -> u8 {
    bits.min(seL4_WordBits) as u8
}
