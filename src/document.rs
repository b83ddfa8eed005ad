//! Owner of the replicated root document and its persistence life-cycle.
//!
//! The CRDT collaborator (`loro`) resolves cross-client concurrency; this
//! module only consumes its contract: atomic transactions, a full-state
//! export/import pair, and a "synced" point after the initial replay. Every
//! local state change runs inside one [`DocumentStore::transact`] block that
//! completes before control yields, so concurrent local callers never
//! observe partial updates.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info};
use loro::{ExportMode, LoroDoc};
use tokio::sync::broadcast::Sender;

use crate::config::Config;
use crate::content_id::ContentId;
use crate::db_manager::DbManager;
use crate::protocol::{DocumentMessage, Message, PlaylistMessage, RegistryMessage};
use crate::registry;
use crate::schema::{self, ALL_PLAYLIST_ID};

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("document is not ready yet")]
    NotReady,
    #[error("unknown playlist: {0}")]
    UnknownPlaylist(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Crdt(#[from] loro::LoroError),
    #[error("snapshot import failed: {0}")]
    Import(String),
    #[error("snapshot export failed: {0}")]
    Export(String),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

/// The replicated document plus its local persistence and readiness state.
pub struct DocumentStore {
    doc: Mutex<LoroDoc>,
    db: Mutex<DbManager>,
    bus_producer: Sender<Message>,
    ready: AtomicBool,
    /// Bookmarkable identifier of the currently selected playlist.
    active_playlist: Mutex<String>,
}

impl DocumentStore {
    /// Opens the persisted store and builds the in-memory document.
    ///
    /// The store is not readable until [`DocumentStore::initialize`] has
    /// replayed the persisted state.
    pub fn open(config: &Config, bus_producer: Sender<Message>) -> Result<Arc<Self>, DocumentError> {
        let db = DbManager::open(&config.storage.document_db_path())?;
        let doc = LoroDoc::new();
        schema::ensure_schema(&doc)?;
        doc.commit();

        Ok(Arc::new(Self {
            doc: Mutex::new(doc),
            db: Mutex::new(db),
            bus_producer,
            ready: AtomicBool::new(false),
            active_playlist: Mutex::new(ALL_PLAYLIST_ID.to_string()),
        }))
    }

    /// Replays the persisted snapshot and opens the store for reads.
    ///
    /// Runs the migrator twice around the replay: once on the fresh document
    /// and once after the persisted state became visible, closing the race
    /// where legacy layout only appears with the replayed bytes. Finishes
    /// with the registry → sentinel reconciliation pass, then flips the
    /// readiness flag and publishes [`DocumentMessage::Ready`].
    pub fn initialize(&self) -> Result<(), DocumentError> {
        let (report, appended) = {
            let doc = self.doc.lock().expect("document lock poisoned");

            let snapshot = self
                .db
                .lock()
                .expect("database lock poisoned")
                .load_document()?;
            if let Some(snapshot) = snapshot {
                let _ = doc
                    .import(&snapshot)
                    .map_err(|err| DocumentError::Import(err.to_string()))?;
                debug!("Document: replayed {} snapshot bytes", snapshot.len());
            }

            let report = schema::ensure_schema(&doc)?;
            if report.migrated_records > 0 {
                info!(
                    "Document: migrated {} legacy playlist record(s)",
                    report.migrated_records
                );
            }
            let appended = registry::reconcile_sentinel_in_doc(&doc)?;
            if !appended.is_empty() {
                info!(
                    "Document: reconciliation appended {} track(s) to '{}'",
                    appended.len(),
                    ALL_PLAYLIST_ID
                );
            }
            doc.commit();
            self.persist_locked(&doc)?;
            (report, appended)
        };

        self.ready.store(true, Ordering::SeqCst);
        self.publish(Message::Document(DocumentMessage::Ready));
        if !report.registered.is_empty() {
            self.publish(Message::Registry(RegistryMessage::TracksAdded(
                report.registered,
            )));
        }
        if !appended.is_empty() {
            self.publish(Message::Playlist(PlaylistMessage::ItemsAppended {
                playlist_id: ALL_PLAYLIST_ID.to_string(),
                content_ids: appended,
            }));
        }
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_ready(&self) -> Result<(), DocumentError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(DocumentError::NotReady)
        }
    }

    /// Runs one atomic mutation: lock, mutate, commit, persist.
    pub(crate) fn transact<T>(
        &self,
        mutation: impl FnOnce(&LoroDoc) -> Result<T, DocumentError>,
    ) -> Result<T, DocumentError> {
        let doc = self.doc.lock().expect("document lock poisoned");
        let out = mutation(&doc)?;
        doc.commit();
        self.persist_locked(&doc)?;
        Ok(out)
    }

    fn persist_locked(&self, doc: &LoroDoc) -> Result<(), DocumentError> {
        let snapshot = doc
            .export(ExportMode::Snapshot)
            .map_err(|err| DocumentError::Export(err.to_string()))?;
        self.db
            .lock()
            .expect("database lock poisoned")
            .store_document(&snapshot, schema::now_millis())?;
        Ok(())
    }

    /// Consumer-visible JSON view of the document; gated on readiness.
    pub(crate) fn read_json(&self) -> Result<serde_json::Value, DocumentError> {
        self.ensure_ready()?;
        let doc = self.doc.lock().expect("document lock poisoned");
        Ok(schema::doc_json(&doc))
    }

    /// Merges an update produced by a peer's document.
    ///
    /// The merged state may carry a legacy layout or registry rows unknown
    /// to this session, so the migrator and the reconciliation pass run
    /// again before the change deltas go out.
    pub fn apply_remote_update(&self, update: &[u8]) -> Result<(), DocumentError> {
        self.ensure_ready()?;
        let (registered, appended) = {
            let doc = self.doc.lock().expect("document lock poisoned");
            let before: HashSet<ContentId> = schema::registry_rows(&schema::doc_json(&doc))
                .into_iter()
                .map(|row| row.content_id)
                .collect();

            let _ = doc
                .import(update)
                .map_err(|err| DocumentError::Import(err.to_string()))?;
            schema::ensure_schema(&doc)?;
            let appended = registry::reconcile_sentinel_in_doc(&doc)?;
            doc.commit();
            self.persist_locked(&doc)?;

            let registered: Vec<ContentId> = schema::registry_rows(&schema::doc_json(&doc))
                .into_iter()
                .map(|row| row.content_id)
                .filter(|content_id| !before.contains(content_id))
                .collect();
            (registered, appended)
        };

        if !registered.is_empty() {
            self.publish(Message::Registry(RegistryMessage::TracksAdded(registered)));
        }
        if !appended.is_empty() {
            self.publish(Message::Playlist(PlaylistMessage::ItemsAppended {
                playlist_id: ALL_PLAYLIST_ID.to_string(),
                content_ids: appended,
            }));
        }
        Ok(())
    }

    /// Full-state update for handing to a peer; gated on readiness.
    pub fn export_update(&self) -> Result<Vec<u8>, DocumentError> {
        self.ensure_ready()?;
        let doc = self.doc.lock().expect("document lock poisoned");
        doc.export(ExportMode::Snapshot)
            .map_err(|err| DocumentError::Export(err.to_string()))
    }

    pub(crate) fn publish(&self, message: Message) {
        // Nobody listening is fine; deltas are best-effort notifications.
        let _ = self.bus_producer.send(message);
    }

    pub fn active_playlist_id(&self) -> String {
        self.active_playlist
            .lock()
            .expect("active playlist lock poisoned")
            .clone()
    }

    /// Switches the bookmarkable active-playlist identifier.
    pub fn set_active_playlist(&self, playlist_id: &str) {
        let changed = {
            let mut active = self
                .active_playlist
                .lock()
                .expect("active playlist lock poisoned");
            if *active == playlist_id {
                false
            } else {
                *active = playlist_id.to_string();
                true
            }
        };
        if changed {
            self.publish(Message::Document(DocumentMessage::ActivePlaylistChanged(
                playlist_id.to_string(),
            )));
        }
    }
}
