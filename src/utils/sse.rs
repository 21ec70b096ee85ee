//! Normalization of raw SSE slices into payload lines.
//!
//! Upstream chunks arrive as arbitrary slices of a `text/event-stream` body:
//! zero or more newline-separated lines, each possibly carrying one or more
//! `data:` prefixes. Normalization keeps only JSON objects and the `[DONE]`
//! terminator; comments, event names and partial noise are dropped.

const DONE_MARKER: &str = "[DONE]";

/// Reduces one SSE line to its payload.
///
/// Returns the JSON object text, the literal `[DONE]`, or `None` when the
/// line carries nothing usable. Repeated `data:` prefixes are stripped, so
/// normalizing an already-normalized line is a no-op.
pub fn normalize_sse_line(line: &str) -> Option<&str> {
    let mut rest = line.trim();

    loop {
        let Some(stripped) = strip_data_prefix(rest) else {
            break;
        };
        rest = stripped.trim_start();
    }

    if rest.is_empty() {
        return None;
    }
    if rest.starts_with('{') && rest.ends_with('}') {
        return Some(rest);
    }
    if rest.eq_ignore_ascii_case(DONE_MARKER) {
        return Some(DONE_MARKER);
    }
    None
}

fn strip_data_prefix(line: &str) -> Option<&str> {
    if line.len() >= 5 && line[..5].eq_ignore_ascii_case("data:") {
        Some(&line[5..])
    } else {
        None
    }
}

/// Splits a chunk into lines and normalizes each one, preserving order.
pub fn normalize_sse_chunk(chunk: &str) -> Vec<&str> {
    chunk.split('\n').filter_map(normalize_sse_line).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_single_data_prefix() {
        assert_eq!(normalize_sse_line("data: {\"a\":1}"), Some("{\"a\":1}"));
    }

    #[test]
    fn strips_repeated_data_prefixes() {
        assert_eq!(
            normalize_sse_line("data: data:  {\"a\":1}"),
            Some("{\"a\":1}")
        );
    }

    #[test]
    fn done_marker_is_case_insensitive_and_canonical() {
        assert_eq!(normalize_sse_line("data: [done]"), Some("[DONE]"));
        assert_eq!(normalize_sse_line("  [DONE]  "), Some("[DONE]"));
    }

    #[test]
    fn drops_event_names_comments_and_fragments() {
        assert_eq!(normalize_sse_line("event: message"), None);
        assert_eq!(normalize_sse_line(": keep-alive"), None);
        assert_eq!(normalize_sse_line("data:"), None);
        assert_eq!(normalize_sse_line("{\"truncated\":"), None);
        assert_eq!(normalize_sse_line(""), None);
    }

    #[test]
    fn normalization_is_idempotent() {
        let inputs = [
            "data: {\"id\":\"x\"}",
            "data: data: [DONE]",
            "  {\"a\":1}  ",
            "noise",
        ];
        for input in inputs {
            let once = normalize_sse_line(input);
            let twice = once.and_then(normalize_sse_line);
            assert_eq!(once, twice, "input {input:?}");
        }
    }

    #[test]
    fn chunk_with_multiple_lines_keeps_order() {
        let chunk = "data: {\"seq\":0}\n\ndata: {\"seq\":1}\n\ndata: [DONE]\n\n";
        assert_eq!(
            normalize_sse_chunk(chunk),
            vec!["{\"seq\":0}", "{\"seq\":1}", "[DONE]"]
        );
    }
}
