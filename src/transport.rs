//! Websocket link to the sync server.
//!
//! Frames are postcard-encoded binary messages. The link runs a writer task
//! draining an outgoing channel and a reader task decoding inbound frames;
//! both stop on cancellation or when the connection drops. A dropped
//! connection mid-session is logged, never fatal.

use error_stack::Report;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

/// Error type for transport operations.
#[derive(Debug)]
pub struct TransportError;

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sync transport error")
    }
}

impl std::error::Error for TransportError {}

/// A frame exchanged with the sync server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncFrame {
    /// Subscribe to a document's update stream.
    Announce { doc_id: String },
    /// A yrs update for one document, in either direction.
    Update { doc_id: String, update: Vec<u8> },
}

/// Sending half of an established sync connection.
#[derive(Clone)]
pub struct SyncLink {
    outgoing: mpsc::Sender<SyncFrame>,
}

impl SyncLink {
    /// Queue a frame for the server. Backpressure overflow and a closed
    /// connection both drop the frame with a log line.
    pub async fn send(&self, frame: SyncFrame) {
        if self.outgoing.send(frame).await.is_err() {
            tracing::debug!("sync link closed, dropping frame");
        }
    }
}

/// Connect to the sync server at `url`.
///
/// Returns the sending half and the stream of inbound frames. The spawned
/// reader and writer tasks stop when `cancel` fires.
///
/// # Errors
/// Fails if the websocket handshake does not complete.
pub async fn connect(
    url: &str,
    cancel: CancellationToken,
) -> Result<(SyncLink, mpsc::Receiver<SyncFrame>), Report<TransportError>> {
    let (stream, _response) = connect_async(url)
        .await
        .map_err(|e| Report::new(TransportError).attach_printable(format!("{url}: {e}")))?;
    tracing::info!(url, "sync connection established");
    let (mut write, mut read) = stream.split();

    let (out_tx, mut out_rx) = mpsc::channel::<SyncFrame>(64);
    let (in_tx, in_rx) = mpsc::channel::<SyncFrame>(64);

    let writer_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                () = writer_cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }

                frame = out_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let bytes = match postcard::to_allocvec(&frame) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            tracing::error!(?e, "failed to encode sync frame");
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Binary(bytes.into())).await {
                        tracing::warn!(?e, "sync write failed, closing link");
                        break;
                    }
                }
            }
        }
    });

    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                message = read.next() => match message {
                    Some(Ok(Message::Binary(data))) => {
                        match postcard::from_bytes::<SyncFrame>(&data) {
                            Ok(frame) => {
                                if in_tx.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::warn!(?e, "undecodable sync frame ignored"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("sync connection closed by server");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(?e, "sync read failed, closing link");
                        break;
                    }
                }
            }
        }
    });

    Ok((SyncLink { outgoing: out_tx }, in_rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_round_trips_through_postcard() {
        let frame = SyncFrame::Announce {
            doc_id: "beam:123".into(),
        };
        let bytes = postcard::to_allocvec(&frame).unwrap();
        assert_eq!(postcard::from_bytes::<SyncFrame>(&bytes).unwrap(), frame);
    }

    #[test]
    fn update_round_trips_through_postcard() {
        let frame = SyncFrame::Update {
            doc_id: "beam:123".into(),
            update: vec![1, 2, 3, 255, 0],
        };
        let bytes = postcard::to_allocvec(&frame).unwrap();
        assert_eq!(postcard::from_bytes::<SyncFrame>(&bytes).unwrap(), frame);
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(postcard::from_bytes::<SyncFrame>(&[0xff, 0xfe, 0xfd]).is_err());
    }

    #[tokio::test]
    async fn connect_to_unreachable_server_reports_error() {
        let result = connect("ws://127.0.0.1:1", CancellationToken::new()).await;
        assert!(result.is_err());
    }
}
