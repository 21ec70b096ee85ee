use relay_llm::gateway::pipeline::{render_payload, StreamTransform};
use relay_llm::gateway::{InstanceConfig, ModelInstance};
use relay_llm::utils::json_path::{read_int_by_path, read_text_by_path};
use relay_llm::utils::sse::{normalize_sse_chunk, normalize_sse_line};
use serde_json::{json, Value};

fn instance(template: &str, raw: bool) -> ModelInstance {
    ModelInstance::new(
        InstanceConfig {
            id: 1,
            provider_name: "openai".to_string(),
            model_name: "gpt-4o-mini".to_string(),
            url: "http://localhost/v1/chat/completions".to_string(),
            api_key: "sk-test".to_string(),
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
fn normalization_is_idempotent_over_arbitrary_chunks() {
    let chunks = [
        "data: {\"id\":\"a\"}\ndata: [DONE]\n",
        "data:data: {\"nested\":true}\n",
        "event: ping\n: comment\n{\"bare\":1}\n",
        "DATA: [done]\n",
    ];
    for chunk in chunks {
        let once = normalize_sse_chunk(chunk);
        let renormalized: Vec<&str> = once
            .iter()
            .filter_map(|line| normalize_sse_line(line))
            .collect();
        assert_eq!(once, renormalized, "chunk {chunk:?}");
    }
}

#[test]
fn repeated_data_prefixes_match_single_prefix_output() {
    let single = normalize_sse_chunk("data: {\"x\":1}\n");
    let double = normalize_sse_chunk("data: data: {\"x\":1}\n");
    assert_eq!(single, double);
}

#[test]
fn default_paths_extract_the_openai_chunk_shape() {
    let root = json!({"choices":[{"delta":{"content":"abc"},"index":7}]});
    assert_eq!(
        read_text_by_path(&root, "choices.0.delta.content").as_deref(),
        Some("abc")
    );
    assert_eq!(read_int_by_path(&root, "choices.0.index"), Some(7));
}

#[test]
fn end_to_end_chunk_transform_matches_the_contract() {
    let transform = StreamTransform::new(&instance("", false), "fallback");
    let upstream =
        "data: {\"id\":\"x\",\"choices\":[{\"index\":3,\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n";
    let outputs = transform.transform_chunk(upstream);
    assert_eq!(outputs.len(), 2);

    let chunk: Value = serde_json::from_str(&outputs[0]).unwrap();
    assert_eq!(
        chunk,
        json!({
            "id": "x",
            "object": "chat.completion.chunk",
            "model": "gpt-4o-mini",
            "choices": [{"index": 3, "delta": {"content": "hi"}}]
        })
    );
    assert_eq!(outputs[1], "[DONE]");
}

#[test]
fn done_passes_through_exactly_once_per_occurrence() {
    let transform = StreamTransform::new(&instance("", false), "fallback");
    let outputs = transform.transform_chunk("data: [DONE]\ndata: [DONE]\n");
    assert_eq!(outputs, vec!["[DONE]", "[DONE]"]);
}

#[test]
fn ordering_is_preserved_within_a_stream() {
    let transform = StreamTransform::new(&instance("", false), "fallback");
    let mut upstream = String::new();
    for i in 0..20 {
        upstream.push_str(&format!(
            "data: {{\"id\":\"r\",\"choices\":[{{\"index\":{i},\"delta\":{{\"content\":\"c{i}\"}}}}]}}\n"
        ));
    }
    let outputs = transform.transform_chunk(&upstream);
    assert_eq!(outputs.len(), 20);
    for (i, line) in outputs.iter().enumerate() {
        let parsed: Value = serde_json::from_str(line).unwrap();
        assert_eq!(parsed["choices"][0]["index"], i as i64);
    }
}

#[test]
fn template_and_default_rendering_agree_on_model_ownership() {
    let request = json!({"message": "hola", "model": "caller-pick"});
    let templated = render_payload(
        &instance(r#"{"model":"$model","messages":"$messages"}"#, false),
        &request,
        "k",
    );
    let defaulted = render_payload(&instance("", false), &request, "k");
    assert_eq!(templated["model"], "gpt-4o-mini");
    assert_eq!(defaulted["model"], "gpt-4o-mini");
    assert_eq!(templated["messages"][0]["content"], "hola");
}

#[test]
fn raw_mode_and_mapped_mode_share_normalization() {
    let noisy = "event: ping\ndata: {\"id\":\"z\"}\n: comment\ndata: [DONE]\n";
    let raw = StreamTransform::new(&instance("", true), "k").transform_chunk(noisy);
    assert_eq!(raw, vec!["{\"id\":\"z\"}", "[DONE]"]);

    let mapped = StreamTransform::new(&instance("", false), "k").transform_chunk(noisy);
    assert_eq!(mapped.len(), 2);
    let first: Value = serde_json::from_str(&mapped[0]).unwrap();
    assert_eq!(first["id"], "z");
}
