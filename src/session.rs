//! Session actor: drains the command queue and drives the document lifecycle.
//!
//! One actor owns the entire session state — connection, identity, current
//! document, local selection. Commands are handled strictly one at a time:
//! the next command is not taken from the queue until the previous handler
//! has fully completed, including any sync wait. Change forwarding and the
//! delayed settle recheck run as spawned tasks tied to a per-document
//! cancellation token, so replacing or closing a document reliably silences
//! the old one before the new one can speak.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::awareness::{self, PeerCursor, PresenceClient, PresenceProfile};
use crate::engine::{DocHandle, DocId, Repo, RepoConfig};
use crate::protocol::{Command, Event, EventSink, SelectionSpec};
use crate::transport::TransportError;

/// Display name used when the front-end never set one.
pub const DEFAULT_NAME: &str = "beam-user";
/// Cursor color used when the front-end never set one.
pub const DEFAULT_COLOR: &str = "#88cc88";

const PEER_FALLBACK_NAME: &str = "unknown";
const PEER_FALLBACK_COLOR: &str = "#888888";

const USER_ID_PREFIX: &str = "beam-";
const USER_ID_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const USER_ID_LEN: usize = 8;

/// Trait abstracting connection establishment so the actor can be tested
/// against in-memory repos and presence channels.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect the document repo to the sync server.
    async fn connect_repo(&self, sync_url: &str) -> Result<Repo, Report<TransportError>>;

    /// Connect the presence client. Inbound peer cursors go through `peers`.
    async fn connect_presence(
        &self,
        awareness_url: &str,
        profile: PresenceProfile,
        peers: mpsc::Sender<PeerCursor>,
    ) -> Result<PresenceClient, Report<TransportError>>;
}

/// Production implementation: real websockets, state persisted on disk.
pub struct NetConnector {
    storage_dir: Option<PathBuf>,
}

impl NetConnector {
    #[must_use]
    pub fn new(storage_dir: Option<PathBuf>) -> Self {
        NetConnector { storage_dir }
    }
}

#[async_trait]
impl Connector for NetConnector {
    async fn connect_repo(&self, sync_url: &str) -> Result<Repo, Report<TransportError>> {
        Repo::connect(RepoConfig {
            sync_url: Some(sync_url.to_owned()),
            storage_dir: self.storage_dir.clone(),
        })
        .await
    }

    async fn connect_presence(
        &self,
        awareness_url: &str,
        profile: PresenceProfile,
        peers: mpsc::Sender<PeerCursor>,
    ) -> Result<PresenceClient, Report<TransportError>> {
        awareness::connect(awareness_url, profile, peers).await
    }
}

/// Timing knobs, overridable in tests.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long `open` waits for a freshly resolved, still-empty document
    /// to receive its first synced content.
    pub sync_wait: Duration,
    /// Delay before re-checking that the reported content has not been
    /// overtaken by a sync that completed after the wait window closed.
    pub settle_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            sync_wait: Duration::from_secs(8),
            settle_delay: Duration::from_secs(3),
        }
    }
}

/// The currently open document plus the token guarding its tasks.
struct OpenDocument {
    id: DocId,
    handle: DocHandle,
    tasks: CancellationToken,
}

/// The session actor. Construct with [`SessionActor::new`], then drive it
/// with [`SessionActor::run`].
pub struct SessionActor<C, E>
where
    C: Connector,
    E: EventSink,
{
    connector: C,
    commands: mpsc::Receiver<Command>,
    sink: E,
    config: SessionConfig,

    repo: Option<Repo>,
    presence: Option<PresenceClient>,
    user_id: Option<String>,
    user_name: String,
    user_color: String,
    doc: Option<OpenDocument>,
    anchor: u32,
    head: Option<u32>,
    echo_guard: Arc<AtomicBool>,
}

impl<C, E> SessionActor<C, E>
where
    C: Connector,
    E: EventSink,
{
    #[must_use]
    pub fn new(
        connector: C,
        commands: mpsc::Receiver<Command>,
        sink: E,
        config: SessionConfig,
    ) -> Self {
        SessionActor {
            connector,
            commands,
            sink,
            config,
            repo: None,
            presence: None,
            user_id: None,
            user_name: DEFAULT_NAME.to_owned(),
            user_color: DEFAULT_COLOR.to_owned(),
            doc: None,
            anchor: 0,
            head: None,
            echo_guard: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The flag raised while a document change is being forwarded to the
    /// front-end. `edit` commands observed with the flag up are dropped,
    /// since their content is an echo of the change just delivered.
    #[must_use]
    pub fn echo_guard(&self) -> Arc<AtomicBool> {
        self.echo_guard.clone()
    }

    /// Process commands until the queue closes, then tear the session down.
    pub async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            tracing::debug!(?command, "handling command");
            if let Err(message) = self.handle(command).await {
                self.sink.emit(&Event::Error { message });
            }
        }
        tracing::debug!("command queue closed, tearing session down");
        self.teardown();
    }

    async fn handle(&mut self, command: Command) -> Result<(), String> {
        match command {
            Command::Connect {
                sync_url,
                awareness_url,
                name,
                color,
            } => self.connect(&sync_url, awareness_url, name, color).await,
            Command::Disconnect => {
                self.teardown();
                self.sink.emit(&Event::Disconnected);
                Ok(())
            }
            Command::Create => self.create().await,
            Command::Open { doc_id } => self.open(&doc_id).await,
            Command::Edit { content } => self.edit(&content).await,
            Command::Close => self.close(),
            Command::SetName { name } => {
                self.user_name = or_default(name, DEFAULT_NAME);
                if let Some(presence) = &self.presence {
                    presence.set_name(self.user_name.clone());
                }
                self.sink.emit(&Event::NameSet {
                    name: self.user_name.clone(),
                });
                Ok(())
            }
            Command::SetColor { color } => {
                self.user_color = or_default(color, DEFAULT_COLOR);
                if let Some(presence) = &self.presence {
                    presence.set_color(self.user_color.clone());
                }
                self.sink.emit(&Event::ColorSet {
                    color: self.user_color.clone(),
                });
                Ok(())
            }
            Command::Cursor { offset, selection } => self.cursor(offset, selection).await,
            Command::Info => {
                self.sink.emit(&Event::Info {
                    connected: self.repo.is_some(),
                    doc_id: self.doc.as_ref().map(|doc| doc.id.to_string()),
                    user_id: self.user_id.clone(),
                    user_name: self.user_name.clone(),
                });
                Ok(())
            }
        }
    }

    async fn connect(
        &mut self,
        sync_url: &str,
        awareness_url: Option<String>,
        name: Option<String>,
        color: Option<String>,
    ) -> Result<(), String> {
        // A second connect replaces the session wholesale.
        if self.repo.is_some() {
            tracing::info!("already connected, replacing session");
            self.teardown();
        }
        if let Some(name) = name {
            self.user_name = or_default(Some(name), DEFAULT_NAME);
        }
        if let Some(color) = color {
            self.user_color = or_default(Some(color), DEFAULT_COLOR);
        }
        let user_id = generate_user_id();

        let repo = self
            .connector
            .connect_repo(sync_url)
            .await
            .map_err(|e| format!("connect failed: {e:?}"))?;
        self.repo = Some(repo);
        self.user_id = Some(user_id.clone());

        if let Some(url) = awareness_url {
            let (peer_tx, peer_rx) = mpsc::channel(64);
            let profile = PresenceProfile {
                user_id: user_id.clone(),
                name: self.user_name.clone(),
                color: self.user_color.clone(),
                document_id: "default".to_owned(),
            };
            match self.connector.connect_presence(&url, profile, peer_tx).await {
                Ok(client) => {
                    self.presence = Some(client);
                    self.spawn_peer_forwarder(peer_rx);
                }
                Err(e) => {
                    tracing::warn!(?e, url, "awareness connection failed");
                    self.sink.emit(&Event::Error {
                        message: format!("awareness connection failed: {e:?}"),
                    });
                }
            }
        }

        self.sink.emit(&Event::Connected { user_id });
        Ok(())
    }

    async fn create(&mut self) -> Result<(), String> {
        let repo = self.repo.clone().ok_or_else(|| "not connected".to_owned())?;
        let handle = repo.create().await;
        let id = handle.id().clone();
        self.install(handle, id.clone());
        self.announce_presence(&id);
        self.sink.emit(&Event::Created {
            doc_id: id.to_string(),
        });
        Ok(())
    }

    async fn open(&mut self, doc_id: &str) -> Result<(), String> {
        let repo = self.repo.clone().ok_or_else(|| "not connected".to_owned())?;
        let id = DocId::normalize(doc_id);
        let handle = repo
            .find(&id)
            .await
            .map_err(|e| format!("open failed: {e:?}"))?;

        // The prior document is gone once resolution succeeds.
        self.release_doc();

        let mut content = handle.content().await;
        if content.is_empty() {
            if let Some(synced) = self.wait_for_sync(&handle).await {
                content = synced;
            }
        }

        let tasks = self.install(handle.clone(), id.clone());
        self.spawn_settle_check(handle, content.clone(), tasks);
        self.announce_presence(&id);
        self.sink.emit(&Event::Opened {
            doc_id: id.to_string(),
            content,
        });
        Ok(())
    }

    /// Wait once, bounded, for an empty freshly resolved document to
    /// receive its first non-empty content from the sync server.
    ///
    /// A genuinely empty shared document cannot be told apart from one that
    /// has not synced yet, so this always pays the full wait for empty
    /// documents. The settle recheck covers syncs that finish even later.
    async fn wait_for_sync(&self, handle: &DocHandle) -> Option<String> {
        let mut changes = handle.subscribe();
        let first_content = async {
            loop {
                match changes.recv().await {
                    Ok(change) if !change.content.is_empty() => break Some(change.content),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break None,
                }
            }
        };
        match tokio::time::timeout(self.config.sync_wait, first_content).await {
            Ok(content) => content,
            Err(_) => {
                tracing::debug!(doc_id = %handle.id(), "sync wait elapsed, opening empty");
                None
            }
        }
    }

    async fn edit(&mut self, content: &str) -> Result<(), String> {
        let doc = self
            .doc
            .as_ref()
            .ok_or_else(|| "no document open".to_owned())?;
        if self.echo_guard.load(Ordering::SeqCst) {
            tracing::debug!("dropping edit echoed back during change delivery");
            return Ok(());
        }
        doc.handle.apply_text(content).await;
        Ok(())
    }

    fn close(&mut self) -> Result<(), String> {
        if self.doc.is_none() {
            return Err("no document open".to_owned());
        }
        self.release_doc();
        self.sink.emit(&Event::Closed);
        Ok(())
    }

    async fn cursor(
        &mut self,
        offset: Option<u32>,
        selection: Option<SelectionSpec>,
    ) -> Result<(), String> {
        let len = match &self.doc {
            Some(doc) => doc.handle.content().await.chars().count() as u32,
            None => 0,
        };
        match selection {
            Some(selection) => {
                self.anchor = selection.anchor.min(len);
                self.head = Some(selection.head.unwrap_or(selection.anchor).min(len));
            }
            None => {
                self.anchor = offset.unwrap_or(0).min(len);
                self.head = None;
            }
        }
        self.send_local_cursor();
        Ok(())
    }

    /// Install `handle` as the current document and start its change
    /// forwarder. Any previous document's tasks are cancelled first.
    fn install(&mut self, handle: DocHandle, id: DocId) -> CancellationToken {
        self.release_doc();
        let tasks = CancellationToken::new();
        self.spawn_forwarder(&handle, tasks.clone());
        self.doc = Some(OpenDocument {
            id,
            handle,
            tasks: tasks.clone(),
        });
        tasks
    }

    /// Forward every document change to the front-end, raising the echo
    /// guard for the duration of each emit.
    fn spawn_forwarder(&self, handle: &DocHandle, cancel: CancellationToken) {
        let mut changes = handle.subscribe();
        let handle = handle.clone();
        let sink = self.sink.clone();
        let guard = self.echo_guard.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    () = cancel.cancelled() => break,

                    change = changes.recv() => match change {
                        Ok(change) => {
                            emit_guarded(&sink, &guard, change.content);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "change stream lagged, emitting latest");
                            let content = handle.content().await;
                            emit_guarded(&sink, &guard, content);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    /// Re-check the document once after the settle delay: if a sync landed
    /// after `open` reported its content, deliver the newer content as a
    /// regular change.
    fn spawn_settle_check(&self, handle: DocHandle, reported: String, cancel: CancellationToken) {
        let delay = self.config.settle_delay;
        let sink = self.sink.clone();
        let guard = self.echo_guard.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            let latest = handle.content().await;
            if !latest.is_empty() && latest != reported {
                tracing::debug!(doc_id = %handle.id(), "late sync detected after open");
                emit_guarded(&sink, &guard, latest);
            }
        });
    }

    /// Forward peer cursors to the front-end, substituting display
    /// fallbacks for peers that never shared a profile.
    fn spawn_peer_forwarder(&self, mut peers: mpsc::Receiver<PeerCursor>) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            while let Some(peer) = peers.recv().await {
                let name = match peer.name {
                    Some(name) if !name.trim().is_empty() => name,
                    _ => PEER_FALLBACK_NAME.to_owned(),
                };
                let color = peer
                    .color
                    .filter(|color| !color.is_empty())
                    .unwrap_or_else(|| PEER_FALLBACK_COLOR.to_owned());
                sink.emit(&Event::Cursor {
                    user_id: peer.user_id,
                    name,
                    color,
                    anchor: peer.anchor,
                    head: peer.head,
                });
            }
        });
    }

    /// Point the presence channel at `id` and re-send the local cursor so
    /// peers see it in the new document.
    fn announce_presence(&self, id: &DocId) {
        if let Some(presence) = &self.presence {
            presence.set_document_id(id.to_string());
        }
        self.send_local_cursor();
    }

    fn send_local_cursor(&self) {
        if let Some(presence) = &self.presence {
            match self.head {
                Some(head) => presence.update_selection(self.anchor, head),
                None => presence.update_cursor(self.anchor),
            }
        }
    }

    fn release_doc(&mut self) {
        if let Some(doc) = self.doc.take() {
            doc.tasks.cancel();
        }
    }

    /// Tear everything down: document tasks, presence, repo, in that order.
    fn teardown(&mut self) {
        self.release_doc();
        if let Some(presence) = self.presence.take() {
            presence.destroy();
        }
        if let Some(repo) = self.repo.take() {
            repo.shutdown();
        }
        self.user_id = None;
    }
}

fn emit_guarded<E: EventSink>(sink: &E, guard: &AtomicBool, content: String) {
    guard.store(true, Ordering::SeqCst);
    sink.emit(&Event::Changed { content });
    guard.store(false, Ordering::SeqCst);
}

fn or_default(value: Option<String>, default: &str) -> String {
    match value {
        Some(value) if !value.trim().is_empty() => value,
        _ => default.to_owned(),
    }
}

fn generate_user_id() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    let suffix: String = (0..USER_ID_LEN)
        .map(|_| USER_ID_CHARS[rng.random_range(0..USER_ID_CHARS.len())] as char)
        .collect();
    format!("{USER_ID_PREFIX}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_ids_have_the_expected_shape() {
        for _ in 0..32 {
            let id = generate_user_id();
            assert_eq!(id.len(), USER_ID_PREFIX.len() + USER_ID_LEN);
            let suffix = id.strip_prefix(USER_ID_PREFIX).unwrap();
            assert!(suffix.bytes().all(|b| USER_ID_CHARS.contains(&b)));
        }
    }

    #[test]
    fn user_ids_are_not_constant() {
        let ids: std::collections::HashSet<_> = (0..16).map(|_| generate_user_id()).collect();
        assert!(ids.len() > 1);
    }

    #[test]
    fn or_default_rejects_blank_values() {
        assert_eq!(or_default(None, "fallback"), "fallback");
        assert_eq!(or_default(Some("   ".into()), "fallback"), "fallback");
        assert_eq!(or_default(Some("".into()), "fallback"), "fallback");
        assert_eq!(or_default(Some("kept".into()), "fallback"), "kept");
    }
}
