//! # seL4 Platform Abstraction Layer
//!
//! This crate gives the KaaL allocators a single import path for seL4
//! types, constants and invocations, independent of the backend that
//! provides them.
//!
//! ## Usage
//!
//! ```rust
//! use sel4_platform::adapter as sel4;
//!
//! let error = unsafe { sel4::seL4_CNode_Delete(sel4::seL4_CapInitThreadCNode, 100, 64) };
//! assert!(sel4::is_ok(error));
//! ```
//!
//! ## Build Modes
//!
//! ```bash
//! # Mock (default, host development and tests)
//! cargo build
//! ```

#![no_std]

#[cfg(not(feature = "mock"))]
compile_error!("No seL4 platform backend selected. Enable the 'mock' feature.");

/// Unified seL4 adapter - provides consistent API across all modes
///
/// This is the main module KaaL crates should use.
pub mod adapter;

/// Platform configuration and detection
pub mod config {
    /// Detect which seL4 mode is active at compile time
    pub fn platform_mode() -> &'static str {
        "mock"
    }

    /// Check if we're in mock mode (testing)
    pub const fn is_mock() -> bool {
        cfg!(feature = "mock")
    }

    /// Word size of the configured kernel, in bits
    pub const fn word_bits() -> usize {
        crate::adapter::seL4_WordBits
    }
}

// Re-export adapter as the primary interface
pub use adapter as sel4;
