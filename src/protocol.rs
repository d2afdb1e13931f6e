//! Wire protocol between the server and viewers.
//!
//! All messages are JSON with a `type` tag.
//!
//! Server → viewer:
//! - `connected`: greeting sent right after the handshake
//! - `result`: one compile result per compile-and-deliver cycle
//!
//! Viewer → server:
//! - `options`: replace the session's compile options and recompile once

use serde::{Deserialize, Serialize};

use crate::compile::CompileResult;

/// Message pushed from the server to a viewer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Connection established
    Connected {
        /// Server version for compatibility check
        version: String,
    },

    /// Compile result for the subscribed file
    Result {
        success: bool,
        output: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        error: String,
        source_code: String,
        language: String,
    },
}

impl ServerMessage {
    /// Create a connected message
    pub fn connected() -> Self {
        Self::Connected {
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Create a result message from a compile result
    pub fn result(result: &CompileResult) -> Self {
        Self::Result {
            success: result.success,
            output: result.output.clone(),
            error: result.error.clone(),
            source_code: result.source_code.clone(),
            language: result.language.clone(),
        }
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"connected"}"#.to_string())
    }
}

/// Message received from a viewer while its session is active.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Replace the session's compile options; unset fields fall back to
    /// the file-extension defaults.
    Options {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        compiler: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_kind: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        flags: Option<Vec<String>>,
    },
}

impl ClientMessage {
    /// Parse from JSON string
    pub fn from_json(s: &str) -> Option<Self> {
        serde_json::from_str(s).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_serialization() {
        let result = CompileResult {
            success: true,
            output: "define i32 @main()".into(),
            error: String::new(),
            source_code: "int main() {}".into(),
            language: "c".into(),
        };
        let json = ServerMessage::result(&result).to_json();

        assert!(json.contains(r#""type":"result""#));
        assert!(json.contains(r#""success":true"#));
        assert!(json.contains(r#""language":"c""#));
        // empty error is omitted from the wire
        assert!(!json.contains(r#""error""#));
    }

    #[test]
    fn test_failed_result_keeps_error() {
        let result = CompileResult::failure("expected ';'", "int main( {}", "c");
        let json = ServerMessage::result(&result).to_json();

        assert!(json.contains(r#""success":false"#));
        assert!(json.contains(r#""error":"expected ';'""#));
    }

    #[test]
    fn test_connected_message() {
        let json = ServerMessage::connected().to_json();
        assert!(json.contains(r#""type":"connected""#));
        assert!(json.contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_options_parse_partial() {
        let msg = ClientMessage::from_json(r#"{"type":"options","output_kind":"asm"}"#).unwrap();
        let ClientMessage::Options {
            compiler,
            output_kind,
            flags,
        } = msg;
        assert_eq!(compiler, None);
        assert_eq!(output_kind.as_deref(), Some("asm"));
        assert_eq!(flags, None);
    }

    #[test]
    fn test_options_parse_full() {
        let msg = ClientMessage::from_json(
            r#"{"type":"options","compiler":"clang","output_kind":"llvm-ir","flags":["-O2"]}"#,
        )
        .unwrap();
        let ClientMessage::Options { flags, .. } = msg;
        assert_eq!(flags, Some(vec!["-O2".to_string()]));
    }

    #[test]
    fn test_unknown_message_rejected() {
        assert!(ClientMessage::from_json(r#"{"type":"page","path":"/x"}"#).is_none());
        assert!(ClientMessage::from_json("not json").is_none());
    }
}
