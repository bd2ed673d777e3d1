use serde::{Deserialize, Serialize};

use crate::conversation::ConversationTurn;

#[derive(Debug, Deserialize)]
pub struct MessageDto {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default)]
    pub history: Option<Vec<MessageDto>>,
    /// Accepted for API parity; the service runs a single model.
    #[serde(default)]
    pub model: Option<String>,
}

impl GenerateRequest {
    pub fn history_turns(&self) -> Vec<ConversationTurn> {
        self.history
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|msg| ConversationTurn::new(msg.role.clone(), msg.content.clone()))
            .collect()
    }
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub response: String,
    pub tokens: usize,
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingRequest {
    #[allow(dead_code)]
    pub text: String,
    #[serde(default)]
    #[allow(dead_code)]
    pub model: Option<String>,
}
