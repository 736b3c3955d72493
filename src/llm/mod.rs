//! Model gateway: a uniform wrapper around OpenAI-compatible chat endpoints.

pub mod client;
pub mod models;

pub use client::{ChatGateway, OpenAiCompatClient};
pub use models::{ChatMessage, ChatReply, ModelSpec, Role, SamplingParams, Usage};
