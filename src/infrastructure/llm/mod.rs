//! LLM provider implementations.

mod echo;

pub use echo::EchoLlmProvider;
