//! Presence client for the awareness service.
//!
//! Maintains the local presence state (user id, display name, color, current
//! document, cursor) and mirrors every change to the service as a JSON text
//! frame. Inbound peer cursor frames are forwarded through a channel; the
//! client's own frames echoed back by the server are dropped.

use error_stack::Report;
use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::transport::TransportError;

/// JSON frame on the awareness wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
enum WireFrame {
    /// Full local presence state, resent on every change.
    State {
        user_id: String,
        name: String,
        color: String,
        document_id: String,
        anchor: Option<u32>,
        head: Option<u32>,
    },
    /// Sent once when the client goes away.
    Leave { user_id: String },
    /// A peer's cursor, broadcast by the server.
    Cursor {
        user_id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        color: Option<String>,
        #[serde(default)]
        anchor: Option<u32>,
        #[serde(default)]
        head: Option<u32>,
    },
}

/// Initial local presence state.
#[derive(Debug, Clone)]
pub struct PresenceProfile {
    pub user_id: String,
    pub name: String,
    pub color: String,
    pub document_id: String,
}

/// A change to the local presence state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceUpdate {
    Cursor { anchor: u32 },
    Selection { anchor: u32, head: u32 },
    DocumentId(String),
    Name(String),
    Color(String),
}

/// A peer's cursor as received from the service, unresolved fallbacks and all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCursor {
    pub user_id: String,
    pub name: Option<String>,
    pub color: Option<String>,
    pub anchor: Option<u32>,
    pub head: Option<u32>,
}

/// Handle to a running presence connection.
///
/// Updates are fire-and-forget: a full or closed channel drops the update
/// with a log line, never an error. Dropping the client tears the
/// connection down.
pub struct PresenceClient {
    updates: mpsc::Sender<PresenceUpdate>,
    cancel: CancellationToken,
}

impl PresenceClient {
    /// Build a client around an existing update channel, without any
    /// connection. Used by in-memory connectors in tests.
    #[must_use]
    pub fn from_parts(updates: mpsc::Sender<PresenceUpdate>) -> Self {
        PresenceClient {
            updates,
            cancel: CancellationToken::new(),
        }
    }

    pub fn update_cursor(&self, anchor: u32) {
        self.push(PresenceUpdate::Cursor { anchor });
    }

    pub fn update_selection(&self, anchor: u32, head: u32) {
        self.push(PresenceUpdate::Selection { anchor, head });
    }

    pub fn set_document_id(&self, document_id: String) {
        self.push(PresenceUpdate::DocumentId(document_id));
    }

    pub fn set_name(&self, name: String) {
        self.push(PresenceUpdate::Name(name));
    }

    pub fn set_color(&self, color: String) {
        self.push(PresenceUpdate::Color(color));
    }

    /// Stop the connection task. Idempotent.
    pub fn destroy(&self) {
        self.cancel.cancel();
    }

    fn push(&self, update: PresenceUpdate) {
        if self.updates.try_send(update).is_err() {
            tracing::debug!("presence channel unavailable, dropping update");
        }
    }
}

impl Drop for PresenceClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Connect to the awareness service at `url`.
///
/// Inbound peer cursors are delivered through `peers`. The connection task
/// announces the initial profile immediately and sends a leave frame when
/// destroyed.
///
/// # Errors
/// Fails if the websocket handshake does not complete.
pub async fn connect(
    url: &str,
    profile: PresenceProfile,
    peers: mpsc::Sender<PeerCursor>,
) -> Result<PresenceClient, Report<TransportError>> {
    let (stream, _response) = connect_async(url)
        .await
        .map_err(|e| Report::new(TransportError).attach_printable(format!("{url}: {e}")))?;
    tracing::info!(url, user_id = %profile.user_id, "awareness connection established");
    let (mut write, mut read) = stream.split();

    let (tx, mut rx) = mpsc::channel::<PresenceUpdate>(64);
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();

    tokio::spawn(async move {
        let mut state = LocalState::from(profile);
        if !send_frame(&mut write, &state.frame()).await {
            return;
        }
        loop {
            tokio::select! {
                biased;

                () = task_cancel.cancelled() => {
                    let leave = WireFrame::Leave {
                        user_id: state.user_id.clone(),
                    };
                    let _ = send_frame(&mut write, &leave).await;
                    break;
                }

                update = rx.recv() => {
                    let Some(update) = update else { break };
                    state.apply(update);
                    if !send_frame(&mut write, &state.frame()).await {
                        break;
                    }
                }

                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<WireFrame>(text.as_str()) {
                            Ok(WireFrame::Cursor { user_id, name, color, anchor, head }) => {
                                // The server echoes our own state back.
                                if user_id == state.user_id {
                                    continue;
                                }
                                let peer = PeerCursor { user_id, name, color, anchor, head };
                                if peers.send(peer).await.is_err() {
                                    break;
                                }
                            }
                            Ok(_) => {}
                            Err(e) => tracing::debug!(?e, "undecodable awareness frame ignored"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("awareness connection closed by server");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(?e, "awareness read failed, closing");
                        break;
                    }
                }
            }
        }
    });

    Ok(PresenceClient { updates: tx, cancel })
}

struct LocalState {
    user_id: String,
    name: String,
    color: String,
    document_id: String,
    anchor: Option<u32>,
    head: Option<u32>,
}

impl From<PresenceProfile> for LocalState {
    fn from(profile: PresenceProfile) -> Self {
        LocalState {
            user_id: profile.user_id,
            name: profile.name,
            color: profile.color,
            document_id: profile.document_id,
            anchor: None,
            head: None,
        }
    }
}

impl LocalState {
    fn apply(&mut self, update: PresenceUpdate) {
        match update {
            PresenceUpdate::Cursor { anchor } => {
                self.anchor = Some(anchor);
                self.head = None;
            }
            PresenceUpdate::Selection { anchor, head } => {
                self.anchor = Some(anchor);
                self.head = Some(head);
            }
            PresenceUpdate::DocumentId(document_id) => self.document_id = document_id,
            PresenceUpdate::Name(name) => self.name = name,
            PresenceUpdate::Color(color) => self.color = color,
        }
    }

    fn frame(&self) -> WireFrame {
        WireFrame::State {
            user_id: self.user_id.clone(),
            name: self.name.clone(),
            color: self.color.clone(),
            document_id: self.document_id.clone(),
            anchor: self.anchor,
            head: self.head,
        }
    }
}

async fn send_frame<S>(write: &mut S, frame: &WireFrame) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Debug,
{
    let json = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(?e, "failed to encode awareness frame");
            return true;
        }
    };
    match write.send(Message::Text(json.into())).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(?e, "awareness write failed, closing");
            false
        }
    }
}
