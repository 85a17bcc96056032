//! EVSE Core Property-Based Tests
//!
//! Standalone test suite using proptest for protocol invariants.
//! This project is isolated from the main evse-core crate.
//!
//! # Usage
//!
//! ```bash
//! cargo test -p evse-property-tests                     # Run all property tests
//! cargo test -p evse-property-tests --test prop_engine  # Only the engine suite
//! PROPTEST_CASES=1000 cargo test -p evse-property-tests # More test cases
//! ```
//!
//! # Test Modules
//!
//! - `timeout`: Fixed, Suppressed and Hybrid expiry rules
//! - `engine`: every operation resolves through exactly one listener
//! - `session`: idTag bounds, one active transaction, boot gating

// Re-export for convenience in tests
pub use evse_core::*;
