use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::utils::json_path::{read_int_by_path, read_text_by_path};
use crate::utils::sse::normalize_sse_line;

use super::instance::ModelInstance;

const DEFAULT_REQUEST_ID_PATH: &str = "id";
const DEFAULT_CONTENT_PATH: &str = "choices.0.delta.content";
const DEFAULT_SEQ_PATH: &str = "choices.0.index";

/// Uniform chunk shape emitted to clients in mapped mode.
#[derive(Debug, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Serialize)]
pub struct ChunkChoice {
    pub index: i64,
    pub delta: ChunkDelta,
}

#[derive(Debug, Serialize)]
pub struct ChunkDelta {
    pub content: String,
}

/// Builds the downstream request body for an instance.
///
/// A configured template is parsed and every placeholder string in it is
/// replaced from the caller's request; without a usable template the minimal
/// streaming payload is built instead. The instance's model name always wins
/// the `model` field.
pub fn render_payload(instance: &ModelInstance, request: &Value, idempotency_key: &str) -> Value {
    let template = instance.config().request_template.trim();
    let mut payload = if template.is_empty() {
        default_payload(request)
    } else {
        match serde_json::from_str::<Value>(template) {
            Ok(mut parsed) if parsed.is_object() => {
                rewrite_placeholders(&mut parsed, instance, request, idempotency_key);
                parsed
            }
            Ok(_) | Err(_) => {
                tracing::warn!(
                    instance = %instance.name(),
                    "invalid request template, falling back to default payload"
                );
                default_payload(request)
            }
        }
    };

    if let Value::Object(map) = &mut payload {
        map.insert(
            "model".to_string(),
            Value::String(instance.config().model_name.clone()),
        );
    }
    payload
}

fn default_payload(request: &Value) -> Value {
    json!({
        "stream": true,
        "messages": messages_for(request),
        "model": Value::Null,
    })
}

/// The caller's messages array, or the legacy `message` field wrapped as a
/// single user turn.
fn messages_for(request: &Value) -> Value {
    if let Some(messages) = request.get("messages").filter(|value| value.is_array()) {
        return messages.clone();
    }
    let content = request
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    json!([{ "role": "user", "content": content }])
}

fn field<'a>(request: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| request.get(*key))
}

/// Recursive rewrite over the JSON tree: any string value matching a known
/// placeholder is replaced in place; everything else is walked.
fn rewrite_placeholders(
    node: &mut Value,
    instance: &ModelInstance,
    request: &Value,
    idempotency_key: &str,
) {
    match node {
        Value::Object(map) => {
            for (_key, child) in map.iter_mut() {
                rewrite_child(child, instance, request, idempotency_key);
            }
        }
        Value::Array(items) => {
            for child in items.iter_mut() {
                rewrite_child(child, instance, request, idempotency_key);
            }
        }
        _ => {}
    }
}

fn rewrite_child(child: &mut Value, instance: &ModelInstance, request: &Value, idempotency_key: &str) {
    if let Value::String(text) = child {
        if let Some(replacement) = resolve_placeholder(text, instance, request, idempotency_key) {
            *child = replacement;
            return;
        }
    }
    rewrite_placeholders(child, instance, request, idempotency_key);
}

fn resolve_placeholder(
    text: &str,
    instance: &ModelInstance,
    request: &Value,
    idempotency_key: &str,
) -> Option<Value> {
    if !text.starts_with('$') {
        return None;
    }
    let copied = |keys: &[&str]| field(request, keys).cloned().unwrap_or(Value::Null);
    let value = match text {
        "$model" => match field(request, &["model"]).and_then(Value::as_str) {
            Some(model) => Value::String(model.to_string()),
            None => Value::String(instance.config().model_name.clone()),
        },
        "$messages" => messages_for(request),
        "$stream" => field(request, &["stream"]).cloned().unwrap_or(Value::Bool(true)),
        "$temperature" => copied(&["temperature"]),
        "$max_tokens" => copied(&["max_tokens", "maxTokens"]),
        "$top_p" => copied(&["top_p", "topP"]),
        "$frequency_penalty" => copied(&["frequency_penalty", "frequencyPenalty"]),
        "$presence_penalty" => copied(&["presence_penalty", "presencePenalty"]),
        "$user" => copied(&["user"]),
        "$stop" => copied(&["stop"]),
        "$extra" => field(request, &["extra"])
            .cloned()
            .unwrap_or(Value::Object(Map::new())),
        "$idempotency_key" => field(request, &["idempotency_key", "idempotencyKey"])
            .cloned()
            .unwrap_or(Value::String(idempotency_key.to_string())),
        _ => return None,
    };
    Some(value)
}

/// Per-request transform from raw upstream SSE slices to client lines.
///
/// Order is preserved; malformed JSON lines are dropped. The sequence counter
/// backs chunks whose configured seq path yields nothing.
pub struct StreamTransform {
    model_name: String,
    raw_enabled: bool,
    request_id_path: String,
    content_path: String,
    seq_path: String,
    default_request_id: String,
    seq_counter: AtomicI64,
}

impl StreamTransform {
    pub fn new(instance: &ModelInstance, default_request_id: impl Into<String>) -> Self {
        let config = instance.config();
        Self {
            model_name: config.model_name.clone(),
            raw_enabled: config.response_raw_enabled,
            request_id_path: path_or_default(&config.response_request_id_path, DEFAULT_REQUEST_ID_PATH),
            content_path: path_or_default(&config.response_content_path, DEFAULT_CONTENT_PATH),
            seq_path: path_or_default(&config.response_seq_path, DEFAULT_SEQ_PATH),
            default_request_id: default_request_id.into(),
            seq_counter: AtomicI64::new(0),
        }
    }

    /// Normalizes every line of the chunk and maps each surviving payload.
    pub fn transform_chunk(&self, chunk: &str) -> Vec<String> {
        let mut outputs = Vec::new();
        for line in chunk.split('\n') {
            let Some(payload) = normalize_sse_line(line) else {
                continue;
            };
            if self.raw_enabled {
                outputs.push(payload.to_string());
                continue;
            }
            if payload == "[DONE]" {
                outputs.push("[DONE]".to_string());
                continue;
            }
            match serde_json::from_str::<Value>(payload) {
                Ok(root) => {
                    if let Some(mapped) = self.map_payload(&root) {
                        outputs.push(mapped);
                    }
                }
                Err(err) => {
                    tracing::debug!(error = %err, "dropping unparseable SSE payload");
                }
            }
        }
        outputs
    }

    fn map_payload(&self, root: &Value) -> Option<String> {
        let request_id = read_text_by_path(root, &self.request_id_path)
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| self.default_request_id.clone());
        let content = read_text_by_path(root, &self.content_path).unwrap_or_default();
        let seq = read_int_by_path(root, &self.seq_path)
            .unwrap_or_else(|| self.seq_counter.fetch_add(1, Ordering::Relaxed) + 1);

        let chunk = ChatCompletionChunk {
            id: request_id,
            object: "chat.completion.chunk",
            model: self.model_name.clone(),
            choices: vec![ChunkChoice {
                index: seq,
                delta: ChunkDelta { content },
            }],
        };
        serde_json::to_string(&chunk).ok()
    }
}

fn path_or_default(path: &str, default: &str) -> String {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        default.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::instance::InstanceConfig;

    fn instance_with(template: &str, raw: bool) -> ModelInstance {
        ModelInstance::new(
            InstanceConfig {
                id: 1,
                provider_name: "openai".to_string(),
                model_name: "gpt-4o-mini".to_string(),
                url: "http://localhost/v1".to_string(),
                api_key: "k".to_string(),
                request_template: template.to_string(),
                response_request_id_path: String::new(),
                response_content_path: String::new(),
                response_seq_path: String::new(),
                response_raw_enabled: raw,
                rpm_limit: 0,
                tpm_limit: 0,
                max_qps: 0,
                pool_key: String::new(),
                active: true,
            },
            0,
        )
    }

    #[test]
    fn default_payload_wraps_legacy_message() {
        let instance = instance_with("", false);
        let request = serde_json::json!({"message": "hello"});
        let payload = render_payload(&instance, &request, "key-1");
        assert_eq!(payload["stream"], true);
        assert_eq!(payload["model"], "gpt-4o-mini");
        assert_eq!(payload["messages"][0]["role"], "user");
        assert_eq!(payload["messages"][0]["content"], "hello");
    }

    #[test]
    fn template_placeholders_are_replaced_recursively() {
        let template = r#"{
            "model": "$model",
            "input": {"messages": "$messages", "stream": "$stream"},
            "options": ["$temperature", "$max_tokens"],
            "request_ref": "$idempotency_key"
        }"#;
        let instance = instance_with(template, false);
        let request = serde_json::json!({
            "message": "hi",
            "temperature": 0.7,
            "maxTokens": 256
        });
        let payload = render_payload(&instance, &request, "key-9");

        assert_eq!(payload["model"], "gpt-4o-mini");
        assert_eq!(payload["input"]["stream"], true);
        assert_eq!(payload["input"]["messages"][0]["content"], "hi");
        assert_eq!(payload["options"][0], 0.7);
        assert_eq!(payload["options"][1], 256);
        assert_eq!(payload["request_ref"], "key-9");
    }

    #[test]
    fn caller_messages_array_wins_over_legacy_field() {
        let instance = instance_with(r#"{"messages": "$messages"}"#, false);
        let request = serde_json::json!({
            "message": "legacy",
            "messages": [{"role": "system", "content": "s"}, {"role": "user", "content": "u"}]
        });
        let payload = render_payload(&instance, &request, "k");
        assert_eq!(payload["messages"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn invalid_template_falls_back_to_default() {
        let instance = instance_with("not json {", false);
        let request = serde_json::json!({"message": "hello"});
        let payload = render_payload(&instance, &request, "k");
        assert_eq!(payload["stream"], true);
        assert_eq!(payload["model"], "gpt-4o-mini");
    }

    #[test]
    fn model_is_always_overwritten_last() {
        let instance = instance_with(r#"{"model": "template-fixed"}"#, false);
        let request = serde_json::json!({"message": "hello", "model": "caller-model"});
        let payload = render_payload(&instance, &request, "k");
        assert_eq!(payload["model"], "gpt-4o-mini");
    }

    #[test]
    fn mapped_mode_emits_uniform_chunks() {
        let instance = instance_with("", false);
        let transform = StreamTransform::new(&instance, "fallback-id");
        let chunk = "data: {\"id\":\"x\",\"choices\":[{\"index\":3,\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n";
        let outputs = transform.transform_chunk(chunk);
        assert_eq!(outputs.len(), 2);

        let first: Value = serde_json::from_str(&outputs[0]).unwrap();
        assert_eq!(first["id"], "x");
        assert_eq!(first["object"], "chat.completion.chunk");
        assert_eq!(first["model"], "gpt-4o-mini");
        assert_eq!(first["choices"][0]["index"], 3);
        assert_eq!(first["choices"][0]["delta"]["content"], "hi");
        assert_eq!(outputs[1], "[DONE]");
    }

    #[test]
    fn missing_fields_use_fallbacks_and_counter() {
        let instance = instance_with("", false);
        let transform = StreamTransform::new(&instance, "fallback-id");
        let outputs = transform.transform_chunk("data: {\"noise\":1}\ndata: {\"noise\":2}\n");
        assert_eq!(outputs.len(), 2);

        let first: Value = serde_json::from_str(&outputs[0]).unwrap();
        let second: Value = serde_json::from_str(&outputs[1]).unwrap();
        assert_eq!(first["id"], "fallback-id");
        assert_eq!(first["choices"][0]["delta"]["content"], "");
        assert_eq!(first["choices"][0]["index"], 1);
        assert_eq!(second["choices"][0]["index"], 2);
    }

    #[test]
    fn raw_mode_passes_payloads_untouched() {
        let instance = instance_with("", true);
        let transform = StreamTransform::new(&instance, "k");
        let outputs = transform.transform_chunk("data: {\"anything\":true}\ndata: [DONE]\nnoise\n");
        assert_eq!(outputs, vec!["{\"anything\":true}", "[DONE]"]);
    }

    #[test]
    fn unparseable_json_lines_are_dropped() {
        let instance = instance_with("", false);
        let transform = StreamTransform::new(&instance, "k");
        let outputs = transform.transform_chunk("data: {broken\ndata: {\"id\":\"ok\"}\n");
        assert_eq!(outputs.len(), 1);
    }

    #[test]
    fn custom_paths_extract_alternate_shapes() {
        let mut config_instance = instance_with("", false);
        // Rebuild with custom paths.
        let mut cfg = config_instance.config().clone();
        cfg.response_request_id_path = "meta.rid".to_string();
        cfg.response_content_path = "delta.text".to_string();
        cfg.response_seq_path = "meta.n".to_string();
        config_instance = ModelInstance::new(cfg, 0);

        let transform = StreamTransform::new(&config_instance, "k");
        let outputs = transform
            .transform_chunk("data: {\"meta\":{\"rid\":\"r1\",\"n\":\"7\"},\"delta\":{\"text\":\"t\"}}\n");
        let parsed: Value = serde_json::from_str(&outputs[0]).unwrap();
        assert_eq!(parsed["id"], "r1");
        assert_eq!(parsed["choices"][0]["index"], 7);
        assert_eq!(parsed["choices"][0]["delta"]["content"], "t");
    }
}
