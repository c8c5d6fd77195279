//! Request decoding for `POST /v1/chat/completions`
//!
//! Reads the body (length-bounded when `Content-Length` is present), parses
//! the OpenAI-style request and resolves the prompt from the last user turn.
//! Earlier turns are ignored: the session is stateful and already holds them.

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap};
use base64::Engine as _;
use futures_util::StreamExt;
use inference::constants::limits;
use inference::{Prompt, PromptImage};
use serde::Deserialize;

use crate::error::ApiError;

/// Chat completion request (OpenAI-compatible)
#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub max_tokens: Option<i64>,
    /// Newer name for `max_tokens`, used when the former is absent
    #[serde(default)]
    pub max_completion_tokens: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

/// Plain string content or an ordered list of parts
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// Everything the handler needs from a request
#[derive(Debug)]
pub struct DecodedRequest {
    pub model: Option<String>,
    pub prompt: Prompt,
    pub stream: bool,
    /// `None` means unlimited
    pub max_tokens: Option<u32>,
}

/// Read the request body.
///
/// With `Content-Length`, data frames are pulled until exactly that many
/// bytes arrived (a short body keeps what was read). Without it, the whole
/// body is collected up to [`limits::MAX_BODY_BYTES`].
pub async fn read_body(headers: &HeaderMap, body: Body) -> Result<Bytes, ApiError> {
    match content_length(headers)? {
        Some(len) => read_exact_len(body, len).await,
        None => axum::body::to_bytes(body, limits::MAX_BODY_BYTES)
            .await
            .map_err(|e| ApiError::BadRequest(format!("Failed to read body: {}", e))),
    }
}

fn content_length(headers: &HeaderMap) -> Result<Option<usize>, ApiError> {
    let Some(value) = headers.get(header::CONTENT_LENGTH) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .map(Some)
        .ok_or_else(|| ApiError::BadRequest("Invalid Content-Length".to_string()))
}

async fn read_exact_len(body: Body, len: usize) -> Result<Bytes, ApiError> {
    if len > limits::MAX_BODY_BYTES {
        return Err(ApiError::BadRequest(format!(
            "Request body too large ({} bytes)",
            len
        )));
    }

    let mut buf: Vec<u8> = Vec::with_capacity(len);
    let mut frames = body.into_data_stream();
    while buf.len() < len {
        match frames.next().await {
            Some(Ok(chunk)) => {
                let take = (len - buf.len()).min(chunk.len());
                buf.extend_from_slice(&chunk[..take]);
            }
            Some(Err(e)) => {
                return Err(ApiError::Internal(format!("Failed to read body: {}", e)));
            }
            None => break,
        }
    }
    Ok(Bytes::from(buf))
}

/// Parse a chat completion request body
pub fn decode_request(body: &[u8]) -> Result<DecodedRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::BadRequest("Missing request body".to_string()));
    }

    let request: ChatCompletionRequest = serde_json::from_slice(body)?;

    let max_tokens = request
        .max_tokens
        .or(request.max_completion_tokens)
        .filter(|n| *n > 0)
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX));

    Ok(DecodedRequest {
        model: request.model,
        prompt: resolve_prompt(&request.messages),
        stream: request.stream.unwrap_or(false),
        max_tokens,
    })
}

/// Text and images of the last user message
pub fn resolve_prompt(messages: &[ChatMessage]) -> Prompt {
    let Some(content) = messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .and_then(|m| m.content.as_ref())
    else {
        return Prompt::default();
    };

    match content {
        MessageContent::Text(text) => Prompt::text(text.clone()),
        MessageContent::Parts(parts) => {
            let mut prompt = Prompt::default();
            for part in parts {
                match part {
                    ContentPart::Text { text } => prompt.text.push_str(text),
                    ContentPart::ImageUrl { image_url } => {
                        if let Some(image) = decode_data_uri(&image_url.url) {
                            prompt.images.push(image);
                        }
                    }
                    ContentPart::Unsupported => {}
                }
            }
            prompt
        }
    }
}

/// Decode a `data:image/...;base64,` URI into an RGBA bitmap.
///
/// Remote URLs and malformed data are skipped, never fatal.
pub fn decode_data_uri(url: &str) -> Option<PromptImage> {
    let Some((meta, data)) = url.strip_prefix("data:").and_then(|s| s.split_once(',')) else {
        log::debug!("Skipping image that is not a data URI");
        return None;
    };
    if !meta.ends_with(";base64") {
        log::debug!("Skipping data URI without base64 payload");
        return None;
    }

    let bytes = match base64::engine::general_purpose::STANDARD.decode(data.trim()) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::debug!("Skipping image with invalid base64: {}", e);
            return None;
        }
    };

    match image::load_from_memory(&bytes) {
        Ok(decoded) => {
            let rgba = decoded.to_rgba8();
            Some(PromptImage {
                width: rgba.width(),
                height: rgba.height(),
                rgba: rgba.into_raw(),
            })
        }
        Err(e) => {
            log::debug!("Skipping undecodable image: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::io::Cursor;

    fn png_data_uri() -> String {
        let image = image::RgbaImage::from_pixel(2, 3, image::Rgba([10, 20, 30, 255]));
        let mut png = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(image)
            .write_to(&mut png, image::ImageFormat::Png)
            .unwrap();
        format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(png.into_inner())
        )
    }

    #[test]
    fn test_plain_string_content() {
        let req = decode_request(
            br#"{"model":"m","messages":[{"role":"user","content":"Hello"}],"stream":false,"max_tokens":128}"#,
        )
        .unwrap();
        assert_eq!(req.model.as_deref(), Some("m"));
        assert_eq!(req.prompt.text, "Hello");
        assert!(req.prompt.images.is_empty());
        assert!(!req.stream);
        assert_eq!(req.max_tokens, Some(128));
    }

    #[test]
    fn test_only_last_user_turn_is_used() {
        let req = decode_request(
            br#"{"messages":[
                {"role":"system","content":"be brief"},
                {"role":"user","content":"first"},
                {"role":"assistant","content":"answer"},
                {"role":"user","content":"second"},
                {"role":"assistant","content":null}
            ]}"#,
        )
        .unwrap();
        assert_eq!(req.prompt.text, "second");
    }

    #[test]
    fn test_no_user_turn_gives_empty_prompt() {
        let req = decode_request(br#"{"messages":[{"role":"system","content":"x"}]}"#).unwrap();
        assert_eq!(req.prompt, Prompt::default());
    }

    #[test]
    fn test_parts_with_image() {
        let body = serde_json::json!({
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "What is "},
                    {"type": "image_url", "image_url": {"url": png_data_uri()}},
                    {"type": "text", "text": "this?"},
                    {"type": "input_audio", "input_audio": {}}
                ]
            }]
        });
        let req = decode_request(body.to_string().as_bytes()).unwrap();

        assert_eq!(req.prompt.text, "What is this?");
        assert_eq!(req.prompt.images.len(), 1);
        let image = &req.prompt.images[0];
        assert_eq!((image.width, image.height), (2, 3));
        assert_eq!(image.rgba.len(), 2 * 3 * 4);
        assert_eq!(&image.rgba[..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn test_bad_images_are_skipped() {
        assert!(decode_data_uri("https://example.com/cat.png").is_none());
        assert!(decode_data_uri("data:image/png;base64,!!!not-base64!!!").is_none());
        assert!(decode_data_uri("data:image/png;base64,aGVsbG8=").is_none());
        assert!(decode_data_uri("data:text/plain,hello").is_none());

        let body = serde_json::json!({
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "hi"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,%%%"}}
                ]
            }]
        });
        let req = decode_request(body.to_string().as_bytes()).unwrap();
        assert_eq!(req.prompt.text, "hi");
        assert!(req.prompt.images.is_empty());
    }

    #[test]
    fn test_stream_flag_and_budget_rules() {
        let req = decode_request(br#"{"messages":[],"stream":true}"#).unwrap();
        assert!(req.stream);
        assert_eq!(req.max_tokens, None);

        let req = decode_request(br#"{"messages":[],"max_completion_tokens":7}"#).unwrap();
        assert_eq!(req.max_tokens, Some(7));

        let req =
            decode_request(br#"{"messages":[],"max_tokens":3,"max_completion_tokens":7}"#).unwrap();
        assert_eq!(req.max_tokens, Some(3));

        let req = decode_request(br#"{"messages":[],"max_tokens":0}"#).unwrap();
        assert_eq!(req.max_tokens, None);

        let req = decode_request(br#"{"messages":[],"max_tokens":-5}"#).unwrap();
        assert_eq!(req.max_tokens, None);

        let req = decode_request(br#"{"messages":[],"stream":null}"#).unwrap();
        assert!(!req.stream);
    }

    #[test]
    fn test_invalid_or_missing_body_is_bad_request() {
        assert!(matches!(decode_request(b""), Err(ApiError::BadRequest(_))));
        assert!(matches!(decode_request(b"  \n"), Err(ApiError::BadRequest(_))));
        assert!(matches!(
            decode_request(b"{not json"),
            Err(ApiError::BadRequest(_))
        ));
        assert!(matches!(
            decode_request(br#"{"model":"m"}"#),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_read_body_stops_at_content_length() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("5"));

        let bytes = read_body(&headers, Body::from("hello world")).await.unwrap();
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn test_read_body_across_frames() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("11"));

        let frames = futures_util::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"hel")),
            Ok(Bytes::from_static(b"lo ")),
            Ok(Bytes::from_static(b"world")),
        ]);
        let bytes = read_body(&headers, Body::from_stream(frames)).await.unwrap();
        assert_eq!(&bytes[..], b"hello world");
    }

    #[tokio::test]
    async fn test_read_body_without_length_falls_back() {
        let bytes = read_body(&HeaderMap::new(), Body::from("{}")).await.unwrap();
        assert_eq!(&bytes[..], b"{}");
    }

    #[tokio::test]
    async fn test_read_body_rejects_oversized_length() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&(limits::MAX_BODY_BYTES + 1).to_string()).unwrap(),
        );
        let err = read_body(&headers, Body::empty()).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));

        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("abc"));
        let err = read_body(&headers, Body::empty()).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }
}
