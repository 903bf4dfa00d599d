//! Checker wire protocol: newline-delimited JSON over stdin/stdout.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::diagnostics::{Diagnostic, DiagnosticSource, Severity};

/// Requests written to a checker worker, one JSON object per line.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CheckerRequest {
    #[serde(rename_all = "camelCase")]
    Analyze {
        uri: SmolStr,
        content: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        flags: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    TypeInfo {
        uri: SmolStr,
        content: String,
        line: u32,
        column: u32,
    },
    #[serde(rename_all = "camelCase")]
    Completions {
        uri: SmolStr,
        content: String,
        line: u32,
        column: u32,
    },
    Health,
    Shutdown,
}

impl CheckerRequest {
    pub fn uri(&self) -> Option<&SmolStr> {
        match self {
            CheckerRequest::Analyze { uri, .. }
            | CheckerRequest::TypeInfo { uri, .. }
            | CheckerRequest::Completions { uri, .. } => Some(uri),
            CheckerRequest::Health | CheckerRequest::Shutdown => None,
        }
    }

    /// Serializes the request as a single newline-terminated JSON line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Responses read back from a worker, one JSON object per line.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CheckerResponse {
    #[serde(rename_all = "camelCase")]
    Result {
        #[serde(default)]
        uri: Option<SmolStr>,
        #[serde(default)]
        diagnostics: Vec<RawCheckerDiagnostic>,
        #[serde(default)]
        type_info: Option<TypeInfo>,
        #[serde(default)]
        completions: Vec<Completion>,
        #[serde(default)]
        duration_ms: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default)]
        uri: Option<SmolStr>,
        #[serde(default)]
        error: Option<String>,
    },
}

/// Diagnostic as emitted by the checker binary.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCheckerDiagnostic {
    #[serde(default)]
    pub file: Option<SmolStr>,
    pub line: u32,
    pub column: u32,
    #[serde(default)]
    pub end_line: Option<u32>,
    #[serde(default)]
    pub end_column: Option<u32>,
    pub message: String,
    pub severity: String,
    #[serde(default)]
    pub code: Option<SmolStr>,
    #[serde(default)]
    pub category: Option<String>,
}

impl RawCheckerDiagnostic {
    /// Canonicalizes the raw record; unknown severities fall back to warning.
    pub fn into_diagnostic(self, fallback_file: &str, compute_time_ms: u64) -> Diagnostic {
        Diagnostic {
            file: self.file.unwrap_or_else(|| SmolStr::new(fallback_file)),
            line: self.line,
            column: self.column,
            end_line: self.end_line,
            end_column: self.end_column,
            message: self.message,
            severity: Severity::from_checker_raw(&self.severity).unwrap_or(Severity::Warning),
            source: DiagnosticSource::Checker,
            code: self.code,
            compute_time_ms,
            attachment: None,
        }
        .normalized()
    }
}

/// Hover-style type information for a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeInfo {
    /// Rendered type text.
    pub display: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
}

/// A completion item for a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert_text: Option<String>,
}

/// Incremental newline splitter for a worker's stdout.
///
/// Reads arrive in arbitrary chunks; complete lines come out, and a trailing
/// incomplete fragment is retained for the next read.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every newline-terminated line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            match String::from_utf8(line) {
                Ok(text) => {
                    if !text.trim().is_empty() {
                        lines.push(text);
                    }
                }
                Err(_) => continue,
            }
        }
        lines
    }

    /// Bytes buffered past the last newline.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_serialize_with_type_tags() {
        let request = CheckerRequest::Analyze {
            uri: SmolStr::new("file:///a.ts"),
            content: "let x = 1;".to_string(),
            flags: vec!["--strict".to_string()],
        };
        let line = request.to_line().expect("serialize");
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim()).expect("round trip");
        assert_eq!(value["type"], "analyze");
        assert_eq!(value["flags"][0], "--strict");

        let health = CheckerRequest::Health.to_line().expect("serialize");
        assert_eq!(health.trim(), r#"{"type":"health"}"#);

        let type_info = CheckerRequest::TypeInfo {
            uri: SmolStr::new("file:///a.ts"),
            content: String::new(),
            line: 3,
            column: 7,
        };
        let value: serde_json::Value =
            serde_json::from_str(type_info.to_line().expect("serialize").trim()).expect("parse");
        assert_eq!(value["type"], "typeInfo");
    }

    #[test]
    fn responses_parse_both_shapes() {
        let result: CheckerResponse = serde_json::from_str(
            r#"{"type":"result","uri":"file:///a.ts","diagnostics":[{"line":2,"column":5,"message":"oops","severity":"error"}],"durationMs":12}"#,
        )
        .expect("parse result");
        match result {
            CheckerResponse::Result { diagnostics, duration_ms, .. } => {
                assert_eq!(diagnostics.len(), 1);
                assert_eq!(duration_ms, Some(12));
            }
            CheckerResponse::Error { .. } => panic!("expected result"),
        }

        let error: CheckerResponse =
            serde_json::from_str(r#"{"type":"error","error":"worker busy"}"#).expect("parse error");
        match error {
            CheckerResponse::Error { error, .. } => {
                assert_eq!(error.as_deref(), Some("worker busy"));
            }
            CheckerResponse::Result { .. } => panic!("expected error"),
        }
    }

    #[test]
    fn raw_diagnostic_canonicalizes() {
        let raw = RawCheckerDiagnostic {
            file: None,
            line: 0,
            column: 3,
            end_line: None,
            end_column: None,
            message: "m".to_string(),
            severity: "suggestion".to_string(),
            code: Some(SmolStr::new("TS1234")),
            category: None,
        };
        let diagnostic = raw.into_diagnostic("file:///fallback.ts", 9);
        assert_eq!(diagnostic.file, "file:///fallback.ts");
        assert_eq!(diagnostic.line, 1);
        assert_eq!(diagnostic.severity, Severity::Hint);
        assert_eq!(diagnostic.compute_time_ms, 9);
    }

    #[test]
    fn decoder_splits_multi_chunk_reads() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(b"{\"type\":\"res").is_empty());
        assert_eq!(decoder.pending(), 12);
        let lines = decoder.push(b"ult\"}\n{\"type\":");
        assert_eq!(lines, vec![r#"{"type":"result"}"#.to_string()]);
        let lines = decoder.push(b"\"error\"}\n");
        assert_eq!(lines, vec![r#"{"type":"error"}"#.to_string()]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn decoder_yields_multiple_lines_from_one_chunk() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.push(b"a\nb\r\nc\n\n");
        assert_eq!(lines, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[test]
    fn decoder_retains_trailing_fragment() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.push(b"complete\npartial");
        assert_eq!(lines, vec!["complete".to_string()]);
        assert_eq!(decoder.pending(), 7);
        assert_eq!(decoder.push(b"\n"), vec!["partial".to_string()]);
    }
}
