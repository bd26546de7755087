//! LLM provider implementations and the resilience layer for Sleuth.
//!
//! All transports implement the `sleuth_core::Provider` trait. The
//! [`FallbackChain`] wraps them with per-provider retry and cross-provider
//! fallback; the router builds both from configuration.

pub mod openai_compat;
pub mod resilience;
pub mod router;

pub use openai_compat::OpenAiCompatProvider;
pub use resilience::{ChainResponse, ExponentialBackoff, FallbackChain};
pub use router::{ProviderRouter, build_chain_from_config, build_from_config};
