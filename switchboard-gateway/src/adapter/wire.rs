//! Wire formats for each [`ResponseShape`].

use serde::Deserialize;
use serde_json::json;

use super::message::{CatalogPage, ChatMessage, Completion, Usage};
use crate::registry::{ProviderConfig, ResponseShape};
use crate::types::Model;

/// Context window assumed when a listing does not report one.
const DEFAULT_CONTEXT_WINDOW: u32 = 8192;

// ────────────────────────────────────────────────────────────────────────────
// chat-message-array
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ArrayChatResponse {
    choices: Vec<ArrayChoice>,
    #[serde(default)]
    usage: Option<ArrayUsage>,
}

#[derive(Debug, Deserialize)]
struct ArrayChoice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct ArrayUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ArrayModelList {
    data: Vec<ArrayModel>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    last_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ArrayModel {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    context_window: Option<u32>,
    #[serde(default)]
    capabilities: Vec<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// single-completion-object
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ObjectChatResponse {
    message: WireMessage,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ObjectTags {
    models: Vec<ObjectModel>,
}

#[derive(Debug, Deserialize)]
struct ObjectModel {
    name: String,
    #[serde(default)]
    details: Option<ObjectModelDetails>,
}

#[derive(Debug, Default, Deserialize)]
struct ObjectModelDetails {
    #[serde(default)]
    context_length: Option<u32>,
    #[serde(default)]
    families: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: String,
}

/// Path of the chat endpoint, relative to the base URL.
pub(crate) fn chat_path(shape: ResponseShape) -> &'static str {
    match shape {
        ResponseShape::ChatMessageArray => "chat/completions",
        ResponseShape::SingleCompletionObject => "api/chat",
    }
}

/// Path of the model listing endpoint, relative to the base URL.
pub(crate) fn catalog_path(shape: ResponseShape) -> &'static str {
    match shape {
        ResponseShape::ChatMessageArray => "models",
        ResponseShape::SingleCompletionObject => "api/tags",
    }
}

/// Query parameter carrying the pagination cursor, if the shape paginates.
pub(crate) fn cursor_param(shape: ResponseShape) -> Option<&'static str> {
    match shape {
        ResponseShape::ChatMessageArray => Some("after"),
        ResponseShape::SingleCompletionObject => None,
    }
}

pub(crate) fn chat_body(
    shape: ResponseShape,
    model_id: &str,
    messages: &[ChatMessage],
) -> serde_json::Value {
    match shape {
        ResponseShape::ChatMessageArray => json!({
            "model": model_id,
            "messages": messages,
        }),
        ResponseShape::SingleCompletionObject => json!({
            "model": model_id,
            "messages": messages,
            "stream": false,
        }),
    }
}

/// Parse a chat response. The error is a human-readable reason.
pub(crate) fn parse_chat(shape: ResponseShape, body: &[u8]) -> Result<Completion, String> {
    match shape {
        ResponseShape::ChatMessageArray => {
            let response: ArrayChatResponse =
                serde_json::from_slice(body).map_err(|e| e.to_string())?;
            let choice = response
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| "response contained no choices".to_string())?;
            let usage = response
                .usage
                .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens))
                .unwrap_or_default();
            Ok(Completion {
                content: choice.message.content,
                usage,
            })
        }
        ResponseShape::SingleCompletionObject => {
            let response: ObjectChatResponse =
                serde_json::from_slice(body).map_err(|e| e.to_string())?;
            Ok(Completion {
                content: response.message.content,
                usage: Usage::new(
                    response.prompt_eval_count.unwrap_or(0),
                    response.eval_count.unwrap_or(0),
                ),
            })
        }
    }
}

/// Parse one page of a model listing into [`Model`]s tiered per the config.
pub(crate) fn parse_catalog(config: &ProviderConfig, body: &[u8]) -> Result<CatalogPage, String> {
    match config.response_shape {
        ResponseShape::ChatMessageArray => {
            let list: ArrayModelList = serde_json::from_slice(body).map_err(|e| e.to_string())?;
            let next_cursor = if list.has_more {
                let cursor = list
                    .last_id
                    .clone()
                    .or_else(|| list.data.last().map(|m| m.id.clone()));
                if cursor.is_none() {
                    return Err("has_more set on an empty page".to_string());
                }
                cursor
            } else {
                None
            };
            let models = list
                .data
                .into_iter()
                .map(|m| {
                    let mut builder = Model::builder(&config.id, &m.id)
                        .context_window(m.context_window.unwrap_or(DEFAULT_CONTEXT_WINDOW))
                        .tier(config.tier_for(&m.id));
                    if let Some(name) = m.display_name {
                        builder = builder.display_name(name);
                    }
                    for tag in m.capabilities {
                        builder = builder.tag(tag);
                    }
                    builder.build()
                })
                .collect();
            Ok(CatalogPage {
                models,
                next_cursor,
            })
        }
        ResponseShape::SingleCompletionObject => {
            let tags: ObjectTags = serde_json::from_slice(body).map_err(|e| e.to_string())?;
            let models = tags
                .models
                .into_iter()
                .map(|m| {
                    let details = m.details.unwrap_or_default();
                    let mut builder = Model::builder(&config.id, &m.name)
                        .context_window(details.context_length.unwrap_or(DEFAULT_CONTEXT_WINDOW))
                        .tier(config.tier_for(&m.name))
                        .tag("chat");
                    for family in details.families {
                        builder = builder.tag(family);
                    }
                    builder.build()
                })
                .collect();
            Ok(CatalogPage {
                models,
                next_cursor: None,
            })
        }
    }
}
