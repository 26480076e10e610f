//! Integration test entry point for whisper-probe.
//!
//! Run with: cargo test -p whisper-probe --test integration

mod client;
mod lifecycle;
mod scenario;
