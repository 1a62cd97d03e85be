use kuro_api::payload::ToolCallEnvelope;
use serde_json::Value;

/// Literal marker opening an embedded tool directive in generated text.
pub const TOOL_CALL_MARKER: &str = "{\"kuro_tool_call\"";

/// A well-formed tool directive found in the cumulative generated text.
/// `start..end` is the byte span of the raw JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallSpan {
    pub start: usize,
    pub end: usize,
    pub call: ToolCallEnvelope,
}

/// Opaque marker substituted for a not-yet-resolved tool call's raw text.
pub fn placeholder_for(id: &str) -> String {
    format!("\u{27e6}kuro:tool:{id}\u{27e7}")
}

/// Scan cumulative generated text for embedded tool directives.
///
/// Pure function over the string: finds each marker, matches the closing
/// brace with a string-aware depth counter, and parses the span as JSON.
/// Malformed or incomplete matches are skipped silently and their text left
/// untouched; generation is probabilistic and partial matches are expected.
pub fn scan_tool_calls(text: &str) -> Vec<ToolCallSpan> {
    let mut spans = Vec::new();
    let mut from = 0;

    while let Some(offset) = text[from..].find(TOOL_CALL_MARKER) {
        let start = from + offset;
        let Some(end) = matching_brace(text, start) else {
            // Unterminated: the directive is still streaming in.
            break;
        };

        match parse_directive(&text[start..end]) {
            Some(call) => {
                spans.push(ToolCallSpan { start, end, call });
                from = end;
            }
            None => from = start + TOOL_CALL_MARKER.len(),
        }
    }

    spans
}

/// Byte offset one past the brace matching the `{` at `open`, ignoring
/// braces inside quoted strings and honoring backslash escapes.
fn matching_brace(text: &str, open: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    debug_assert_eq!(bytes.get(open), Some(&b'{'));

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (index, &byte) in bytes.iter().enumerate().skip(open) {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }

        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(index + 1);
                }
            }
            _ => {}
        }
    }

    None
}

fn parse_directive(raw: &str) -> Option<ToolCallEnvelope> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let inner = value.get("kuro_tool_call")?;
    let call: ToolCallEnvelope = serde_json::from_value(inner.clone()).ok()?;
    if call.id.trim().is_empty() || call.name.trim().is_empty() {
        return None;
    }
    Some(call)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scan_finds_directive_and_parses_envelope() {
        let text = r#"Sure, {"kuro_tool_call":{"id":"t1","name":"echo","args":{}}} done"#;
        let spans = scan_tool_calls(text);

        assert_eq!(spans.len(), 1);
        assert_eq!(&text[spans[0].start..spans[0].end],
            r#"{"kuro_tool_call":{"id":"t1","name":"echo","args":{}}}"#);
        assert_eq!(spans[0].call.id, "t1");
        assert_eq!(spans[0].call.name, "echo");
        assert_eq!(spans[0].call.args, json!({}));
    }

    #[test]
    fn braces_inside_quoted_strings_do_not_close_the_directive() {
        let text = r#"{"kuro_tool_call":{"id":"t2","name":"fmt","args":{"tpl":"a } b \" c {"}}}"#;
        let spans = scan_tool_calls(text);

        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].end, text.len());
        assert_eq!(spans[0].call.args["tpl"], "a } b \" c {");
    }

    #[test]
    fn unterminated_directive_is_left_for_a_later_scan() {
        let text = r#"start {"kuro_tool_call":{"id":"t3","name":"echo","args":{"#;
        assert!(scan_tool_calls(text).is_empty());
    }

    #[test]
    fn malformed_directive_is_skipped_without_error() {
        // Balanced braces but invalid envelope (no id).
        let text = r#"{"kuro_tool_call":{"name":"echo"}} and {"kuro_tool_call":{"id":"t4","name":"echo","args":{}}}"#;
        let spans = scan_tool_calls(text);

        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].call.id, "t4");
    }

    #[test]
    fn multiple_directives_are_found_in_order() {
        let text = concat!(
            r#"{"kuro_tool_call":{"id":"a","name":"one","args":{}}}"#,
            " mid ",
            r#"{"kuro_tool_call":{"id":"b","name":"two","args":{"n":1}}}"#,
        );
        let spans = scan_tool_calls(text);

        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].call.id, "a");
        assert_eq!(spans[1].call.id, "b");
        assert!(spans[0].end <= spans[1].start);
    }

    #[test]
    fn placeholder_embeds_the_tool_id() {
        assert_eq!(placeholder_for("t9"), "⟦kuro:tool:t9⟧");
    }
}
