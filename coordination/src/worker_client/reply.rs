//! Parsing the child process's stdout into a `Reply`.

use crate::data_model::{Reply, Usage};

/// Prefers the first top-level JSON object in `stdout`; falls back to
/// stripping ANSI/box-drawing artifacts and returning the raw text when
/// nothing parses.
pub fn parse_reply(stdout: &str, duration_ms: u64) -> Reply {
    if let Some(value) = first_json_object(stdout) {
        return reply_from_json(value, duration_ms);
    }
    Reply {
        text: strip_terminal_artifacts(stdout),
        session_id: None,
        structured_output: None,
        tool_calls: Vec::new(),
        usage: Usage {
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            cache_read: 0,
            cache_create: 0,
        },
        duration_ms,
        permission_denials: Vec::new(),
    }
}

fn first_json_object(stdout: &str) -> Option<serde_json::Value> {
    let start = stdout.find('{')?;
    // Scan for the matching closing brace, tracking string literals so a
    // `}` inside quoted text isn't mistaken for the end of the object.
    let bytes = stdout.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return serde_json::from_str(&stdout[start..=i]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

fn reply_from_json(value: serde_json::Value, duration_ms: u64) -> Reply {
    let text = value
        .get("result")
        .or_else(|| value.get("response"))
        .or_else(|| value.get("content"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let session_id = value
        .get("session_id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let structured_output = value.get("structured_output").cloned();
    let usage_val = value.get("usage");
    let usage = Usage {
        tokens_in: usage_val
            .and_then(|u| u.get("tokens_in"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        tokens_out: usage_val
            .and_then(|u| u.get("tokens_out"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        cost_usd: value
            .get("total_cost_usd")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0),
        cache_read: usage_val
            .and_then(|u| u.get("cache_read"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        cache_create: usage_val
            .and_then(|u| u.get("cache_create"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
    };
    let tool_calls = value
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    let permission_denials = value
        .get("permission_denials")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).map(String::from).collect())
        .unwrap_or_default();
    Reply {
        text,
        session_id,
        structured_output,
        tool_calls,
        usage,
        duration_ms,
        permission_denials,
    }
}

fn strip_terminal_artifacts(raw: &str) -> String {
    // Strip ANSI escape sequences (ESC [ ... letter) and common box-drawing
    // glyphs that leak through from interactive TUI output.
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            if chars.peek() == Some(&'[') {
                chars.next();
                while let Some(&c) = chars.peek() {
                    chars.next();
                    if c.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
            continue;
        }
        if matches!(c, '│' | '─' | '┌' | '┐' | '└' | '┘' | '├' | '┤' | '╭' | '╮' | '╰' | '╯') {
            continue;
        }
        out.push(c);
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_reply() {
        let stdout = r#"some preamble
{"result": "done", "session_id": "sess-1", "usage": {"tokens_in": 10, "tokens_out": 20}, "total_cost_usd": 0.05}
trailer"#;
        let reply = parse_reply(stdout, 1200);
        assert_eq!(reply.text, "done");
        assert_eq!(reply.session_id.as_deref(), Some("sess-1"));
        assert_eq!(reply.usage.tokens_in, 10);
        assert_eq!(reply.usage.tokens_out, 20);
        assert_eq!(reply.usage.cost_usd, 0.05);
    }

    #[test]
    fn falls_back_to_stripped_raw_text_on_parse_failure() {
        let stdout = "\u{1b}[32mnot json at all\u{1b}[0m";
        let reply = parse_reply(stdout, 500);
        assert_eq!(reply.text, "not json at all");
        assert!(reply.session_id.is_none());
    }

    #[test]
    fn reply_parse_round_trip_preserves_text_session_and_usage() {
        let source = serde_json::json!({
            "result": "the answer",
            "session_id": "abc",
            "usage": {"tokens_in": 5, "tokens_out": 6},
        });
        let reply = reply_from_json(source.clone(), 10);
        assert_eq!(reply.text, source["result"]);
        assert_eq!(reply.session_id.unwrap(), source["session_id"]);
        assert_eq!(reply.usage.tokens_in, 5);
        assert_eq!(reply.usage.tokens_out, 6);
    }
}
