//! Integration test crate for the GridPulse data plane.
//!
//! All tests live under `tests/`; they wire the real pipeline components
//! to the in-memory bus, channel, and sink implementations.
