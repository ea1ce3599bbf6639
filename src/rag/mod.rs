//! Retrieval-augmented generation on top of [`RetrievalEngine`](crate::engine::RetrievalEngine).

pub mod history;
pub mod prompt;
pub mod provider;
pub mod session;

pub use history::{ChatHistory, DEFAULT_MAX_TURNS, Role, Turn};
pub use prompt::{Persona, build_system_prompt};
pub use provider::{
    CompletionProvider, ProviderConfig, ProviderKind, RetryPolicy, SamplingParams, connect,
};
pub use session::RagSession;
