//! Document engine built on yrs.
//!
//! A [`Repo`] owns every document handle resolved during a session and wires
//! each one to the sync link and the on-disk state store. A [`DocHandle`] is
//! a cheaply clonable reference to one collaborative text document; local
//! edits are merged in as minimal diffs rather than wholesale replacement so
//! concurrent remote edits survive.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use error_stack::Report;
use similar::{ChangeTag, TextDiff};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

use crate::transport::{self, SyncFrame, SyncLink, TransportError};

/// Name of the text root in the yrs document.
const TEXT_ROOT: &str = "content";

/// Prefix of the canonical document address.
const DOC_ID_PREFIX: &str = "beam:";

/// Capacity of the per-document broadcast channels.
const CHANNEL_CAPACITY: usize = 64;

/// Error type for engine operations.
#[derive(Debug)]
pub enum EngineError {
    /// The document id is not a valid address.
    InvalidDocId,
    /// An update payload could not be decoded.
    Decode,
    /// A decoded update could not be merged into the document.
    Merge,
    /// Reading persisted document state failed.
    Storage,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidDocId => write!(f, "invalid document id"),
            EngineError::Decode => write!(f, "malformed document update"),
            EngineError::Merge => write!(f, "failed to merge document update"),
            EngineError::Storage => write!(f, "document storage failed"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Canonical document address: `beam:<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocId(String);

impl DocId {
    /// Mint a fresh address.
    #[must_use]
    pub fn generate() -> Self {
        DocId(format!("{DOC_ID_PREFIX}{}", Uuid::new_v4()))
    }

    /// Bring a front-end supplied id into canonical form.
    #[must_use]
    pub fn normalize(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with(DOC_ID_PREFIX) {
            DocId(raw.to_owned())
        } else {
            DocId(format!("{DOC_ID_PREFIX}{raw}"))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The address without its scheme prefix, used as a storage key.
    fn key(&self) -> &str {
        self.0.strip_prefix(DOC_ID_PREFIX).unwrap_or(&self.0)
    }

    fn validate(&self) -> Result<(), Report<EngineError>> {
        Uuid::parse_str(self.key())
            .map(|_| ())
            .map_err(|e| Report::new(EngineError::InvalidDocId).attach_printable(format!("{self}: {e}")))
    }
}

impl std::fmt::Display for DocId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Event broadcast whenever a document's content changes, regardless of
/// whether the change originated locally or from a remote peer.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Full document content after the change.
    pub content: String,
}

struct DocShared {
    id: DocId,
    doc: RwLock<Doc>,
    changes: broadcast::Sender<ChangeEvent>,
    local_updates: broadcast::Sender<Vec<u8>>,
}

/// Handle to a single collaborative document.
#[derive(Clone)]
pub struct DocHandle {
    shared: Arc<DocShared>,
}

impl DocHandle {
    /// Create a handle over a fresh, empty document.
    #[must_use]
    pub fn new(id: DocId) -> Self {
        let doc = Doc::new();
        doc.get_or_insert_text(TEXT_ROOT);
        Self::from_doc(id, doc)
    }

    /// Restore a handle from a previously encoded state update.
    pub fn from_state(id: DocId, state: &[u8]) -> Result<Self, Report<EngineError>> {
        let doc = Doc::new();
        doc.get_or_insert_text(TEXT_ROOT);
        let update = Update::decode_v1(state)
            .map_err(|e| Report::new(EngineError::Decode).attach_printable(e.to_string()))?;
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| Report::new(EngineError::Merge).attach_printable(e.to_string()))?;
        }
        Ok(Self::from_doc(id, doc))
    }

    fn from_doc(id: DocId, doc: Doc) -> Self {
        let (changes, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (local_updates, _) = broadcast::channel(CHANNEL_CAPACITY);
        DocHandle {
            shared: Arc::new(DocShared {
                id,
                doc: RwLock::new(doc),
                changes,
                local_updates,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &DocId {
        &self.shared.id
    }

    /// Current content of the text root.
    pub async fn content(&self) -> String {
        let doc = self.shared.doc.read().await;
        let text = doc.get_or_insert_text(TEXT_ROOT);
        let txn = doc.transact();
        text.get_string(&txn)
    }

    /// Merge `new_content` into the document as a minimal character diff.
    ///
    /// Identical content is a no-op and broadcasts nothing.
    pub async fn apply_text(&self, new_content: &str) {
        let update = {
            let doc = self.shared.doc.write().await;
            let text = doc.get_or_insert_text(TEXT_ROOT);
            let mut txn = doc.transact_mut();
            let old = text.get_string(&txn);
            if old == new_content {
                return;
            }
            for op in diff_ops(&old, new_content) {
                match op {
                    DiffOp::Delete { pos, len } => {
                        text.remove_range(&mut txn, pos as u32, len as u32);
                    }
                    DiffOp::Insert { pos, text: chunk } => {
                        text.insert(&mut txn, pos as u32, &chunk);
                    }
                }
            }
            txn.encode_update_v1()
        };
        let _ = self.shared.changes.send(ChangeEvent {
            content: new_content.to_owned(),
        });
        let _ = self.shared.local_updates.send(update);
    }

    /// Merge an update received from a remote peer.
    pub async fn apply_remote(&self, update: &[u8]) -> Result<(), Report<EngineError>> {
        let content = {
            let doc = self.shared.doc.write().await;
            let decoded = Update::decode_v1(update)
                .map_err(|e| Report::new(EngineError::Decode).attach_printable(e.to_string()))?;
            let text = doc.get_or_insert_text(TEXT_ROOT);
            let mut txn = doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| Report::new(EngineError::Merge).attach_printable(e.to_string()))?;
            text.get_string(&txn)
        };
        let _ = self.shared.changes.send(ChangeEvent { content });
        Ok(())
    }

    /// Subscribe to content changes (local and remote alike).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.shared.changes.subscribe()
    }

    /// Subscribe to the raw updates produced by local edits.
    #[must_use]
    pub fn subscribe_local_updates(&self) -> broadcast::Receiver<Vec<u8>> {
        self.shared.local_updates.subscribe()
    }

    /// Encode the full document state as a single update.
    pub async fn encode_state(&self) -> Vec<u8> {
        let doc = self.shared.doc.read().await;
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }
}

/// Repo configuration: both fields optional so tests can run fully local.
#[derive(Debug, Clone, Default)]
pub struct RepoConfig {
    /// Websocket address of the sync server.
    pub sync_url: Option<String>,
    /// Directory for persisted document state.
    pub storage_dir: Option<PathBuf>,
}

struct RepoShared {
    docs: RwLock<HashMap<DocId, DocHandle>>,
    storage_dir: Option<PathBuf>,
    link: Option<SyncLink>,
    cancel: CancellationToken,
}

/// Collection of document handles bound to one sync connection.
#[derive(Clone)]
pub struct Repo {
    shared: Arc<RepoShared>,
}

impl Repo {
    /// A repo with no sync link and no storage, for local use and tests.
    #[must_use]
    pub fn in_memory() -> Self {
        Repo {
            shared: Arc::new(RepoShared {
                docs: RwLock::new(HashMap::new()),
                storage_dir: None,
                link: None,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Connect a repo according to `config`.
    ///
    /// # Errors
    /// Fails if the sync server cannot be reached.
    pub async fn connect(config: RepoConfig) -> Result<Self, Report<TransportError>> {
        let cancel = CancellationToken::new();
        let (link, incoming) = match &config.sync_url {
            Some(url) => {
                let (link, incoming) = transport::connect(url, cancel.clone()).await?;
                (Some(link), Some(incoming))
            }
            None => (None, None),
        };
        let repo = Repo {
            shared: Arc::new(RepoShared {
                docs: RwLock::new(HashMap::new()),
                storage_dir: config.storage_dir,
                link,
                cancel,
            }),
        };
        if let Some(incoming) = incoming {
            repo.spawn_inbound(incoming);
        }
        Ok(repo)
    }

    /// Create a fresh document and register it.
    pub async fn create(&self) -> DocHandle {
        let handle = DocHandle::new(DocId::generate());
        self.register(handle.clone()).await;
        handle
    }

    /// Resolve a document by id, loading persisted state if available.
    ///
    /// # Errors
    /// Fails if the id is malformed or the persisted state is unreadable.
    pub async fn find(&self, id: &DocId) -> Result<DocHandle, Report<EngineError>> {
        if let Some(handle) = self.shared.docs.read().await.get(id) {
            return Ok(handle.clone());
        }
        id.validate()?;
        let handle = match self.load_persisted(id).await? {
            Some(handle) => handle,
            None => DocHandle::new(id.clone()),
        };
        self.register(handle.clone()).await;
        Ok(handle)
    }

    /// Stop every relay and persistence task owned by this repo.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
    }

    async fn load_persisted(&self, id: &DocId) -> Result<Option<DocHandle>, Report<EngineError>> {
        let Some(dir) = &self.shared.storage_dir else {
            return Ok(None);
        };
        let path = storage_path(dir, id);
        match tokio::fs::read(&path).await {
            Ok(state) => DocHandle::from_state(id.clone(), &state).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Report::new(EngineError::Storage)
                .attach_printable(format!("{}: {e}", path.display()))),
        }
    }

    async fn register(&self, handle: DocHandle) {
        self.shared
            .docs
            .write()
            .await
            .insert(handle.id().clone(), handle.clone());

        if let Some(link) = &self.shared.link {
            link.send(SyncFrame::Announce {
                doc_id: handle.id().to_string(),
            })
            .await;
            self.spawn_update_relay(link.clone(), &handle);
        }
        if let Some(dir) = &self.shared.storage_dir {
            self.spawn_persistence(storage_path(dir, handle.id()), &handle);
        }
    }

    /// Forward locally produced updates to the sync server.
    fn spawn_update_relay(&self, link: SyncLink, handle: &DocHandle) {
        let mut updates = handle.subscribe_local_updates();
        let doc_id = handle.id().to_string();
        let cancel = self.shared.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    () = cancel.cancelled() => break,

                    update = updates.recv() => match update {
                        Ok(update) => {
                            link.send(SyncFrame::Update {
                                doc_id: doc_id.clone(),
                                update,
                            })
                            .await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, doc_id = %doc_id, "local update stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    /// Persist the full document state after every change.
    fn spawn_persistence(&self, path: PathBuf, handle: &DocHandle) {
        let mut changes = handle.subscribe();
        let handle = handle.clone();
        let cancel = self.shared.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    () = cancel.cancelled() => break,

                    change = changes.recv() => match change {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                            let state = handle.encode_state().await;
                            if let Err(e) = tokio::fs::write(&path, &state).await {
                                tracing::warn!(?e, path = %path.display(), "failed to persist document state");
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    /// Apply updates arriving from the sync server to the matching handle.
    fn spawn_inbound(&self, mut incoming: tokio::sync::mpsc::Receiver<SyncFrame>) {
        let repo = self.clone();
        let cancel = self.shared.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    () = cancel.cancelled() => break,

                    frame = incoming.recv() => match frame {
                        Some(SyncFrame::Update { doc_id, update }) => {
                            let id = DocId::normalize(&doc_id);
                            let handle = repo.shared.docs.read().await.get(&id).cloned();
                            match handle {
                                Some(handle) => {
                                    if let Err(e) = handle.apply_remote(&update).await {
                                        tracing::warn!(?e, doc_id = %id, "failed to apply remote update");
                                    }
                                }
                                None => {
                                    tracing::debug!(doc_id = %id, "update for unknown document ignored");
                                }
                            }
                        }
                        Some(SyncFrame::Announce { .. }) => {}
                        None => break,
                    }
                }
            }
        });
    }
}

fn storage_path(dir: &Path, id: &DocId) -> PathBuf {
    dir.join(format!("{}.yrs", id.key()))
}

/// A batched diff operation, positions in bytes of the result text.
#[derive(Debug)]
enum DiffOp {
    Delete { pos: usize, len: usize },
    Insert { pos: usize, text: String },
}

/// Compute a minimal character-level edit script turning `old` into `new`.
///
/// Consecutive changes of the same kind are batched; a delete at the same
/// position is flushed before an insert so positions stay valid as applied.
fn diff_ops(old: &str, new: &str) -> Vec<DiffOp> {
    let diff = TextDiff::from_chars(old, new);
    let mut ops = Vec::new();
    // Position in the result text.
    let mut cursor = 0usize;

    let mut pending_delete: Option<(usize, usize)> = None;
    let mut pending_insert: Option<(usize, String)> = None;

    let flush_delete = |ops: &mut Vec<DiffOp>, pending: &mut Option<(usize, usize)>| {
        if let Some((pos, len)) = pending.take() {
            ops.push(DiffOp::Delete { pos, len });
        }
    };
    let flush_insert = |ops: &mut Vec<DiffOp>, pending: &mut Option<(usize, String)>| {
        if let Some((pos, text)) = pending.take() {
            ops.push(DiffOp::Insert { pos, text });
        }
    };

    for change in diff.iter_all_changes() {
        let chunk = change.value();
        match change.tag() {
            ChangeTag::Equal => {
                flush_delete(&mut ops, &mut pending_delete);
                flush_insert(&mut ops, &mut pending_insert);
                cursor += chunk.len();
            }
            ChangeTag::Delete => {
                flush_insert(&mut ops, &mut pending_insert);
                let (_, len) = pending_delete.get_or_insert((cursor, 0));
                *len += chunk.len();
                // Cursor tracks the result text, so deletes do not advance it.
            }
            ChangeTag::Insert => {
                flush_delete(&mut ops, &mut pending_delete);
                let (_, text) = pending_insert.get_or_insert((cursor, String::new()));
                text.push_str(chunk);
                cursor += chunk.len();
            }
        }
    }
    flush_delete(&mut ops, &mut pending_delete);
    flush_insert(&mut ops, &mut pending_insert);
    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_id_normalize_adds_prefix() {
        let id = DocId::normalize("123e4567-e89b-12d3-a456-426614174000");
        assert_eq!(id.as_str(), "beam:123e4567-e89b-12d3-a456-426614174000");
    }

    #[test]
    fn doc_id_normalize_is_idempotent() {
        let id = DocId::normalize("beam:123e4567-e89b-12d3-a456-426614174000");
        assert_eq!(DocId::normalize(id.as_str()), id);
    }

    #[test]
    fn doc_id_generate_is_canonical() {
        let id = DocId::generate();
        assert!(id.as_str().starts_with("beam:"));
        assert!(Uuid::parse_str(id.key()).is_ok());
    }

    #[tokio::test]
    async fn apply_text_merges_and_broadcasts() {
        let handle = DocHandle::new(DocId::generate());
        let mut changes = handle.subscribe();

        handle.apply_text("hello").await;
        handle.apply_text("hello world").await;

        assert_eq!(changes.recv().await.unwrap().content, "hello");
        assert_eq!(changes.recv().await.unwrap().content, "hello world");
        assert_eq!(handle.content().await, "hello world");
    }

    #[tokio::test]
    async fn identical_content_is_a_noop() {
        let handle = DocHandle::new(DocId::generate());
        handle.apply_text("same").await;

        let mut changes = handle.subscribe();
        handle.apply_text("same").await;
        assert!(matches!(
            changes.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn diff_merge_handles_unicode() {
        let handle = DocHandle::new(DocId::generate());
        handle.apply_text("Hello 世界").await;
        handle.apply_text("Hello 🌍 world").await;
        assert_eq!(handle.content().await, "Hello 🌍 world");
    }

    #[tokio::test]
    async fn diff_merge_edits_middle_of_text() {
        let handle = DocHandle::new(DocId::generate());
        handle.apply_text("The quick brown fox jumps").await;
        handle.apply_text("The slow brown dog jumps").await;
        assert_eq!(handle.content().await, "The slow brown dog jumps");
    }

    #[tokio::test]
    async fn local_updates_replicate_to_a_peer() {
        let a = DocHandle::new(DocId::generate());
        a.apply_text("shared base").await;

        let b = DocHandle::from_state(a.id().clone(), &a.encode_state().await).unwrap();
        assert_eq!(b.content().await, "shared base");

        let mut updates = a.subscribe_local_updates();
        a.apply_text("shared base, extended").await;
        let update = updates.recv().await.unwrap();
        b.apply_remote(&update).await.unwrap();
        assert_eq!(b.content().await, "shared base, extended");
    }

    #[tokio::test]
    async fn apply_remote_rejects_garbage() {
        let handle = DocHandle::new(DocId::generate());
        assert!(handle.apply_remote(b"definitely not an update").await.is_err());
    }

    #[tokio::test]
    async fn find_returns_the_registered_handle() {
        let repo = Repo::in_memory();
        let created = repo.create().await;
        created.apply_text("kept").await;

        let found = repo.find(created.id()).await.unwrap();
        assert_eq!(found.content().await, "kept");
    }

    #[tokio::test]
    async fn find_rejects_malformed_id() {
        let repo = Repo::in_memory();
        let err = repo.find(&DocId::normalize("not-a-uuid")).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn find_loads_persisted_state() {
        let dir = tempfile::tempdir().unwrap();
        let id = DocId::generate();

        let original = DocHandle::new(id.clone());
        original.apply_text("persisted content").await;
        tokio::fs::write(
            storage_path(dir.path(), &id),
            original.encode_state().await,
        )
        .await
        .unwrap();

        let repo = Repo::connect(RepoConfig {
            sync_url: None,
            storage_dir: Some(dir.path().to_path_buf()),
        })
        .await
        .unwrap();
        let restored = repo.find(&id).await.unwrap();
        assert_eq!(restored.content().await, "persisted content");
    }
}
