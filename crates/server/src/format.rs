//! OpenAI-compatible response shapes

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Identity shared by every object produced for one request
#[derive(Debug, Clone)]
pub struct ResponseContext {
    pub id: String,
    pub created: u64,
    pub model: String,
}

impl ResponseContext {
    /// Fresh `chatcmpl-<uuid>` id stamped with the current time
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            created: unix_now(),
            model: model.into(),
        }
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Approximate token count: one token per four characters.
///
/// Clients treat usage as informational; this is not a tokenizer count.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct ChatChoice {
    pub index: usize,
    pub message: AssistantMessage,
    pub finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
pub struct AssistantMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    pub fn estimate(prompt: &str, completion: &str) -> Self {
        let prompt_tokens = estimate_tokens(prompt);
        let completion_tokens = estimate_tokens(completion);
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Serialize)]
pub struct ChunkChoice {
    pub index: usize,
    pub delta: ChunkDelta,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Serialize, Default)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelCard>,
}

#[derive(Debug, Serialize)]
pub struct ModelCard {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub owned_by: &'static str,
}

/// Full (non-streaming) completion object
pub fn completion(ctx: &ResponseContext, prompt: &str, content: String) -> ChatCompletionResponse {
    let usage = Usage::estimate(prompt, &content);
    ChatCompletionResponse {
        id: ctx.id.clone(),
        object: "chat.completion",
        created: ctx.created,
        model: ctx.model.clone(),
        choices: vec![ChatChoice {
            index: 0,
            message: AssistantMessage {
                role: "assistant",
                content,
            },
            finish_reason: "stop",
        }],
        usage,
    }
}

/// Incremental chunk carrying one fragment
pub fn content_chunk(ctx: &ResponseContext, fragment: &str) -> ChatCompletionChunk {
    chunk(
        ctx,
        ChunkDelta {
            content: Some(fragment.to_string()),
        },
        None,
    )
}

/// Last chunk before `[DONE]`
pub fn final_chunk(ctx: &ResponseContext) -> ChatCompletionChunk {
    chunk(ctx, ChunkDelta::default(), Some("stop"))
}

fn chunk(
    ctx: &ResponseContext,
    delta: ChunkDelta,
    finish_reason: Option<&'static str>,
) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: ctx.id.clone(),
        object: "chat.completion.chunk",
        created: ctx.created,
        model: ctx.model.clone(),
        choices: vec![ChunkChoice {
            index: 0,
            delta,
            finish_reason,
        }],
    }
}

/// Inline error object for streams
pub fn error_body(message: &str) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "message": message,
            "type": "generation_error",
        }
    })
}

/// One-entry model list for `/v1/models`
pub fn model_list(model: String) -> ModelList {
    ModelList {
        object: "list",
        data: vec![ModelCard {
            id: model,
            object: "model",
            created: unix_now(),
            owned_by: "user",
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn is_completion_id(id: &str) -> bool {
        let Some(rest) = id.strip_prefix("chatcmpl-") else {
            return false;
        };
        rest.len() == 36 && rest.chars().all(|c| c.is_ascii_hexdigit() || c == '-')
    }

    #[test]
    fn test_ids_are_well_formed_and_unique() {
        let ids: HashSet<String> = (0..500).map(|_| ResponseContext::new("m").id).collect();
        assert_eq!(ids.len(), 500);
        assert!(ids.iter().all(|id| is_completion_id(id)));
    }

    #[test]
    fn test_usage_is_quarter_of_chars() {
        let usage = Usage::estimate("Hello there", "Hi");
        assert_eq!(usage.prompt_tokens, 2);
        assert_eq!(usage.completion_tokens, 0);
        assert_eq!(usage.total_tokens, 2);

        // Characters, not bytes
        assert_eq!(estimate_tokens("ééééééééé"), 2);
    }

    #[test]
    fn test_completion_shape() {
        let ctx = ResponseContext::new("gemma");
        let json = serde_json::to_value(completion(&ctx, "2+2=", "4".to_string())).unwrap();

        assert_eq!(json["object"], "chat.completion");
        assert_eq!(json["model"], "gemma");
        assert_eq!(json["choices"][0]["index"], 0);
        assert_eq!(json["choices"][0]["message"]["role"], "assistant");
        assert_eq!(json["choices"][0]["message"]["content"], "4");
        assert_eq!(json["choices"][0]["finish_reason"], "stop");
        assert_eq!(json["usage"]["prompt_tokens"], 1);
        assert_eq!(json["usage"]["total_tokens"], 1);
    }

    #[test]
    fn test_chunk_shapes() {
        let ctx = ResponseContext::new("gemma");

        let content = serde_json::to_value(content_chunk(&ctx, "4")).unwrap();
        assert_eq!(content["object"], "chat.completion.chunk");
        assert_eq!(content["id"], ctx.id.as_str());
        assert_eq!(content["choices"][0]["delta"]["content"], "4");
        assert!(content["choices"][0]["finish_reason"].is_null());

        let last = serde_json::to_value(final_chunk(&ctx)).unwrap();
        assert!(last["choices"][0]["delta"].get("content").is_none());
        assert_eq!(last["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn test_model_list_has_one_entry() {
        let json = serde_json::to_value(model_list("gemma-3n".to_string())).unwrap();
        assert_eq!(json["object"], "list");
        assert_eq!(json["data"].as_array().unwrap().len(), 1);
        assert_eq!(json["data"][0]["id"], "gemma-3n");
        assert_eq!(json["data"][0]["object"], "model");
        assert_eq!(json["data"][0]["owned_by"], "user");
    }
}
