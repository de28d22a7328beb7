//! Executor event stream (spec §3 "Event") and agent chat-stream chunks
//! (spec §4.9). Both are discriminated, tagged enums so they serialize as
//! `{"type": "...", ...}` over SSE/ndjson the way an external HTTP layer
//! would forward them to a client.

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// One event produced by an [`Executor`](crate) during a single `execute`
/// call. Exactly one terminator (`StreamComplete` or `Error`/`ExecuteError`)
/// is ever produced per session — see spec §3 invariant and §8 property 2.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Stream {
        name: StreamName,
        text: String,
    },
    DisplayData {
        data: HashMap<String, Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<HashMap<String, Value>>,
    },
    ExecuteResult {
        data: HashMap<String, Value>,
    },
    ExecuteError {
        ename: String,
        evalue: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        traceback: Option<Vec<String>>,
    },
    Error {
        ename: String,
        evalue: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        traceback: Option<Vec<String>>,
    },
    StreamStart {
        message: String,
    },
    StreamComplete {
        message: String,
        output_count: usize,
    },
}

impl Event {
    /// True for the two event kinds that legally terminate a session's
    /// stream (spec §3 invariant: "exactly one terminator per session").
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::StreamComplete { .. } | Event::ExecuteError { .. } | Event::Error { .. }
        )
    }

    pub fn error(ename: impl Into<String>, evalue: impl Into<String>) -> Self {
        Event::Error {
            ename: ename.into(),
            evalue: evalue.into(),
            traceback: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// One chunk of an agent's `chat`/`statelessChat` stream (spec §4.9).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatChunk {
    TextChunk {
        delta: String,
    },
    FunctionCall {
        name: String,
        arguments: Value,
    },
    FunctionCallOutput {
        name: String,
        content: String,
    },
    Complete,
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_terminal_variants_report_terminal() {
        assert!(!Event::StreamStart { message: "go".into() }.is_terminal());
        assert!(
            !Event::Stream {
                name: StreamName::Stdout,
                text: "hi".into()
            }
            .is_terminal()
        );
        assert!(
            Event::StreamComplete {
                message: "done".into(),
                output_count: 1
            }
            .is_terminal()
        );
        assert!(Event::error("NameError", "x undefined").is_terminal());
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let ev = Event::Stream {
            name: StreamName::Stdout,
            text: "hi\n".into(),
        };
        let json = serde_json::to_value(&ev).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(json["type"], "stream");
        assert_eq!(json["name"], "stdout");
    }
}
