// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stream-JSON dialect spoken over the agent child's stdio.
//!
//! Both directions are newline-delimited JSON. Outbound user messages wrap
//! the tell text in a `user` frame; inbound lines are parsed into
//! [`StreamMessage`]s and inspected for the two sentinels that drive the
//! transport state machine: `system/init` (warm-up finished) and `result`
//! (end of the current request's reply).

use serde::Serialize;
use serde_json::Value;

/// One parsed message from the agent's stdout stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamMessage {
    /// Epoch millis at parse time.
    pub timestamp: u64,
    /// The dialect's `type` field (`system`, `assistant`, `result`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    /// The full parsed JSON as received.
    pub raw: Value,
}

impl StreamMessage {
    /// Parse one newline-delimited token. Returns `None` for tokens that
    /// are not JSON objects carrying a string `type`; callers log and drop
    /// those.
    pub fn parse(line: &str) -> Option<Self> {
        let raw: Value = serde_json::from_str(line.trim()).ok()?;
        let kind = raw.get("type")?.as_str()?.to_owned();
        let subtype = raw.get("subtype").and_then(|v| v.as_str()).map(str::to_owned);
        Some(Self { timestamp: epoch_ms(), kind, subtype, raw })
    }

    /// `system/init`: the child has finished warm-up.
    pub fn is_init(&self) -> bool {
        self.kind == "system" && self.subtype.as_deref() == Some("init")
    }

    /// `result`: the end of the current request's reply.
    pub fn is_result(&self) -> bool {
        self.kind == "result"
    }
}

/// Build the outbound user frame for a tell, newline-terminated.
pub fn user_frame(text: &str) -> String {
    let frame = serde_json::json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{"type": "text", "text": text}],
        },
    });
    let mut line = frame.to_string();
    line.push('\n');
    line
}

/// Byte written to stdin for a best-effort cancel (ESC).
pub const CANCEL_BYTE: u8 = 0x1b;

/// Extract the concatenated text content from an assistant message.
///
/// Returns `None` for non-assistant entries or assistant messages with no
/// `type: "text"` blocks.
pub fn extract_assistant_text(json: &Value) -> Option<String> {
    if json.get("type").and_then(|v| v.as_str()) != Some("assistant") {
        return None;
    }
    let content = json.get("message")?.get("content")?.as_array()?;
    let texts: Vec<&str> = content
        .iter()
        .filter(|b| b.get("type").and_then(|v| v.as_str()) == Some("text"))
        .filter_map(|b| b.get("text").and_then(|v| v.as_str()))
        .collect();
    if texts.is_empty() {
        return None;
    }
    Some(texts.join("\n"))
}

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
