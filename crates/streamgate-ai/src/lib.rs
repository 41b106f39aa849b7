//! Streamgate AI - token source backends.
//!
//! Implementations of [`streamgate_core::TokenSourceFactory`]:
//! - [`MockBackend`]: echoes the query back, fragment by fragment
//! - [`OpenAiBackend`]: any OpenAI-compatible `/chat/completions` endpoint
//!
//! [`build_backend`] picks one from a [`BackendConfig`]. [`ScriptedTokenSource`]
//! replays a fixed script and is the building block for tests that need
//! exact control over fragment timing and failures.

pub mod factory;
pub mod mock;
pub mod openai;

pub use factory::{BackendConfig, ProviderKind, build_backend};
pub use mock::{MockBackend, MockStep, MockStepKind, ScriptedTokenSource};
pub use openai::{OpenAiBackend, OpenAiTokenSource};
