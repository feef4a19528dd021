//! Line protocol between the editor front-end and the bridge.
//!
//! One JSON object per line: commands arrive on stdin, events leave on
//! stdout. Both sides are tagged enums discriminated by a `type` field.
//! Anything that is not a protocol event (logs, panics) must go to stderr.

use std::io::Write;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;

/// A command sent by the front-end, one per input line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Command {
    /// Establish a session: sync transport plus optional awareness channel.
    Connect {
        sync_url: String,
        #[serde(default)]
        awareness_url: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        color: Option<String>,
    },
    /// Tear the session down. Idempotent.
    Disconnect,
    /// Create a fresh document and make it current.
    Create,
    /// Open an existing document by id.
    Open { doc_id: String },
    /// Merge new local content into the current document.
    Edit { content: String },
    /// Release the current document.
    Close,
    /// Update the local display name (absent or empty resets the default).
    SetName {
        #[serde(default)]
        name: Option<String>,
    },
    /// Update the local cursor color (absent or empty resets the default).
    SetColor {
        #[serde(default)]
        color: Option<String>,
    },
    /// Report the local cursor or selection.
    Cursor {
        #[serde(default)]
        offset: Option<u32>,
        #[serde(default)]
        selection: Option<SelectionSpec>,
    },
    /// Ask for a session status snapshot.
    Info,
}

/// Selection payload of the `cursor` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionSpec {
    #[serde(default)]
    pub anchor: u32,
    #[serde(default)]
    pub head: Option<u32>,
}

/// An event emitted to the front-end, one per output line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Event {
    Connected {
        user_id: String,
    },
    Disconnected,
    Created {
        doc_id: String,
    },
    Opened {
        doc_id: String,
        content: String,
    },
    /// The current document changed underneath the editor.
    Changed {
        content: String,
    },
    Closed,
    NameSet {
        name: String,
    },
    ColorSet {
        color: String,
    },
    /// A peer moved their cursor.
    Cursor {
        user_id: String,
        name: String,
        color: String,
        anchor: Option<u32>,
        head: Option<u32>,
    },
    Info {
        connected: bool,
        doc_id: Option<String>,
        user_id: Option<String>,
        user_name: String,
    },
    Error {
        message: String,
    },
}

/// Trait abstracting event emission so the session actor can be tested
/// without a real stdout.
pub trait EventSink: Clone + Send + Sync + 'static {
    /// Emit a single protocol event.
    fn emit(&self, event: &Event);
}

/// Production implementation: one JSON line per event on stdout.
#[derive(Debug, Clone, Default)]
pub struct StdoutSink;

impl EventSink for StdoutSink {
    fn emit(&self, event: &Event) {
        match serde_json::to_string(event) {
            Ok(line) => {
                let stdout = std::io::stdout();
                let mut out = stdout.lock();
                if writeln!(out, "{line}").and_then(|()| out.flush()).is_err() {
                    tracing::warn!("stdout closed, dropping event");
                }
            }
            Err(e) => tracing::error!(?e, "failed to serialize event"),
        }
    }
}

/// Read newline-delimited commands from `reader` and feed them into the
/// session queue until EOF.
///
/// Blank lines are skipped. A line that does not parse yields exactly one
/// `error` event and processing continues with the next line.
pub async fn pump_commands<R, E>(reader: R, commands: mpsc::Sender<Command>, sink: E)
where
    R: AsyncBufRead + Unpin,
    E: EventSink,
{
    let mut lines = reader.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(?e, "failed to read input line");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Command>(line) {
            Ok(command) => {
                if commands.send(command).await.is_err() {
                    tracing::debug!("session actor gone, stopping input pump");
                    break;
                }
            }
            Err(e) => sink.emit(&Event::Error {
                message: format!("invalid command: {e}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_parses_camel_case_fields() {
        let json = r#"{"type":"connect","syncUrl":"ws://s","awarenessUrl":"ws://a","name":"nils"}"#;
        let cmd: Command = serde_json::from_str(json).unwrap();
        assert_eq!(
            cmd,
            Command::Connect {
                sync_url: "ws://s".into(),
                awareness_url: Some("ws://a".into()),
                name: Some("nils".into()),
                color: None,
            }
        );
    }

    #[test]
    fn connect_optional_fields_default() {
        let cmd: Command =
            serde_json::from_str(r#"{"type":"connect","syncUrl":"ws://s"}"#).unwrap();
        match cmd {
            Command::Connect {
                awareness_url,
                name,
                color,
                ..
            } => {
                assert!(awareness_url.is_none());
                assert!(name.is_none());
                assert!(color.is_none());
            }
            other => panic!("expected Connect, got {other:?}"),
        }
    }

    #[test]
    fn cursor_with_selection() {
        let json = r#"{"type":"cursor","selection":{"anchor":3,"head":7}}"#;
        let cmd: Command = serde_json::from_str(json).unwrap();
        assert_eq!(
            cmd,
            Command::Cursor {
                offset: None,
                selection: Some(SelectionSpec {
                    anchor: 3,
                    head: Some(7),
                }),
            }
        );
    }

    #[test]
    fn unknown_type_is_an_error() {
        assert!(serde_json::from_str::<Command>(r#"{"type":"frobnicate"}"#).is_err());
    }

    #[test]
    fn missing_required_field_is_an_error() {
        assert!(serde_json::from_str::<Command>(r#"{"type":"open"}"#).is_err());
    }

    #[test]
    fn connected_event_shape() {
        let json = serde_json::to_string(&Event::Connected {
            user_id: "beam-ab12cd34".into(),
        })
        .unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["type"], "connected");
        assert_eq!(v["userId"], "beam-ab12cd34");
    }

    #[test]
    fn cursor_event_serializes_null_offsets() {
        let json = serde_json::to_string(&Event::Cursor {
            user_id: "beam-x".into(),
            name: "unknown".into(),
            color: "#888888".into(),
            anchor: None,
            head: None,
        })
        .unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(v["anchor"].is_null());
        assert!(v["head"].is_null());
    }

    #[test]
    fn info_event_shape() {
        let json = serde_json::to_string(&Event::Info {
            connected: true,
            doc_id: Some("beam:123".into()),
            user_id: Some("beam-x".into()),
            user_name: "beam-user".into(),
        })
        .unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["type"], "info");
        assert_eq!(v["docId"], "beam:123");
        assert_eq!(v["userName"], "beam-user");
    }

    #[derive(Clone)]
    struct VecSink(std::sync::Arc<std::sync::Mutex<Vec<Event>>>);

    impl EventSink for VecSink {
        fn emit(&self, event: &Event) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[tokio::test]
    async fn pump_skips_blank_lines_and_recovers_from_garbage() {
        let input = b"\n{\"type\":\"info\"}\nnot json\n{\"type\":\"close\"}\n" as &[u8];
        let (tx, mut rx) = mpsc::channel(8);
        let events = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        pump_commands(input, tx, VecSink(events.clone())).await;

        assert_eq!(rx.recv().await, Some(Command::Info));
        assert_eq!(rx.recv().await, Some(Command::Close));
        assert_eq!(rx.recv().await, None);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::Error { .. }));
    }
}
