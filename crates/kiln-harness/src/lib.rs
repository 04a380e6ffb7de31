//! Harness: the provider seam between kiln's orchestration logic and the
//! language-model vendors.
//!
//! This crate provides:
//! - The [`provider::ModelProvider`] trait, its options and typed errors
//! - Per-build cooperative cancellation ([`cancel::CancelToken`])
//! - A scripted, call-recording provider for tests ([`mock::ScriptedProvider`])

pub mod cancel;
pub mod mock;
pub mod provider;
