use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

fn default_seed() -> u64 {
    42
}

/// One configured model: which provider serves it and the base sampling seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub provider: String,
    #[serde(rename = "model")]
    pub model_name: String,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl ModelSpec {
    pub fn new(provider: impl Into<String>, model_name: impl Into<String>, seed: u64) -> Self {
        Self {
            provider: provider.into(),
            model_name: model_name.into(),
            seed,
        }
    }

    /// Identifier written into `model_name_or_path` of prediction records.
    pub fn qualified_name(&self) -> String {
        format!("{}:{}", self.provider, self.model_name)
    }

    /// Seed for a given retry: distinct per attempt, reproducible across runs.
    pub fn derived_seed(&self, attempt_index: usize) -> u64 {
        self.seed.wrapping_add(attempt_index as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn of a chat transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling controls forwarded to the provider on every call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub seed: Option<u64>,
}

impl SamplingParams {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_output_tokens: 2000,
            seed: None,
        }
    }
}

/// Token and timing accounting. Additive across calls within one attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    /// Wall time spent inside provider round-trips, in seconds.
    #[serde(default)]
    pub elapsed_s: f64,
    /// Tool calls dispatched by the edit agent.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub calls: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl Usage {
    pub fn merge(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.elapsed_s += other.elapsed_s;
        self.calls += other.calls;
        if other.error.is_some() {
            self.error = other.error.clone();
        }
    }
}

impl AddAssign<&Usage> for Usage {
    fn add_assign(&mut self, rhs: &Usage) {
        self.merge(rhs);
    }
}

/// Text plus accounting for one completed gateway call.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub text: String,
    pub usage: Usage,
}
