//! Canonical deduplicated track registry and its derived-view maintenance.
//!
//! The registry is append-mostly: one row per distinct byte content, never
//! removed. Whenever a row is inserted, the same transaction appends its id
//! to the sentinel "All Tracks" playlist, keeping the
//! "All Tracks ⊇ registry" invariant current without read-time scans. A
//! reconciliation pass covers rows that became visible outside a local
//! insert (persisted replay, peer merge).

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, warn};
use loro::LoroDoc;

use crate::content_id::ContentId;
use crate::document::{DocumentError, DocumentStore};
use crate::protocol::{Message, PlaylistMessage, RegistryMessage};
use crate::schema::{self, TrackMeta, ALL_PLAYLIST_ID};

/// Duration updates smaller than this are dropped as immaterial, so
/// repeated independent duration detections of the same track do not keep
/// rewriting the row.
const DURATION_TOLERANCE_SECS: f64 = 0.5;

/// What one commit actually changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    pub inserted: bool,
    pub sentinel_appended: bool,
    pub appended_to_destination: bool,
}

#[derive(Clone)]
pub struct TrackRegistry {
    store: Arc<DocumentStore>,
}

impl TrackRegistry {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    /// Commits one described upload: registry insert-if-absent plus the
    /// destination playlist append-if-absent, in a single transaction.
    ///
    /// Content-level dedup: identical bytes never produce two rows, and the
    /// first writer's metadata is retained. A missing destination playlist
    /// only skips the append; the content itself is still registered.
    pub fn commit_track(
        &self,
        meta: &TrackMeta,
        destination_id: &str,
    ) -> Result<CommitOutcome, DocumentError> {
        self.store.ensure_ready()?;
        let outcome = self.store.transact(|doc| {
            let json = schema::doc_json(doc);
            let registry = schema::registry_map(doc);
            let mut outcome = CommitOutcome::default();

            if registry.get(meta.content_id.as_str()).is_none() {
                schema::write_track_row(&registry, meta)?;
                outcome.inserted = true;

                // Derived-view maintenance rides in the same transaction as
                // the insert.
                let playlists = schema::playlists_map(doc);
                if let Some(sentinel) = schema::record_of(&playlists, ALL_PLAYLIST_ID) {
                    let sentinel_items = schema::ensure_items_list(&sentinel)?;
                    let have: HashSet<String> =
                        schema::items_in_json(&json, ALL_PLAYLIST_ID).into_iter().collect();
                    if !have.contains(meta.content_id.as_str()) {
                        sentinel_items.push(meta.content_id.as_str())?;
                        outcome.sentinel_appended = true;
                    }
                }
            } else {
                debug!(
                    "Registry: {} already registered; keeping existing metadata",
                    meta.content_id
                );
            }

            if destination_id != ALL_PLAYLIST_ID {
                let playlists = schema::playlists_map(doc);
                match schema::record_of(&playlists, destination_id) {
                    Some(record) => {
                        let items = schema::ensure_items_list(&record)?;
                        let have: HashSet<String> =
                            schema::items_in_json(&json, destination_id).into_iter().collect();
                        if !have.contains(meta.content_id.as_str()) {
                            items.push(meta.content_id.as_str())?;
                            outcome.appended_to_destination = true;
                        }
                    }
                    None => {
                        warn!(
                            "Registry: destination playlist '{}' not found; keeping {} in the registry only",
                            destination_id, meta.content_id
                        );
                    }
                }
            }

            Ok(outcome)
        })?;

        if outcome.inserted {
            self.store.publish(Message::Registry(RegistryMessage::TracksAdded(vec![
                meta.content_id.clone(),
            ])));
        }
        if outcome.sentinel_appended {
            self.store.publish(Message::Playlist(PlaylistMessage::ItemsAppended {
                playlist_id: ALL_PLAYLIST_ID.to_string(),
                content_ids: vec![meta.content_id.clone()],
            }));
        }
        if outcome.appended_to_destination {
            self.store.publish(Message::Playlist(PlaylistMessage::ItemsAppended {
                playlist_id: destination_id.to_string(),
                content_ids: vec![meta.content_id.clone()],
            }));
        }
        Ok(outcome)
    }

    /// Refines a stored duration; writes only when the change is material.
    ///
    /// Returns whether a write happened.
    pub fn backfill_duration(
        &self,
        content_id: &ContentId,
        duration_secs: f64,
    ) -> Result<bool, DocumentError> {
        self.store.ensure_ready()?;
        let wrote = self.store.transact(|doc| {
            let json = schema::doc_json(doc);
            let Some(existing) = schema::resolve_meta(&json, content_id) else {
                debug!(
                    "Registry: duration for unknown track {} ignored",
                    content_id
                );
                return Ok(false);
            };
            let material = match existing.duration_secs {
                None => true,
                Some(stored) => (stored - duration_secs).abs() > DURATION_TOLERANCE_SECS,
            };
            if !material {
                return Ok(false);
            }

            let registry = schema::registry_map(doc);
            match registry.get(content_id.as_str()) {
                Some(loro::ValueOrContainer::Container(loro::Container::Map(row))) => {
                    row.insert("duration", duration_secs)?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })?;

        if wrote {
            self.store.publish(Message::Registry(RegistryMessage::DurationUpdated {
                content_id: content_id.clone(),
                duration_secs,
            }));
        }
        Ok(wrote)
    }

    /// All rows in insertion order.
    pub fn tracks(&self) -> Result<Vec<TrackMeta>, DocumentError> {
        Ok(schema::registry_rows(&self.store.read_json()?))
    }

    pub fn get(&self, content_id: &ContentId) -> Result<Option<TrackMeta>, DocumentError> {
        let json = self.store.read_json()?;
        Ok(json
            .get(schema::REGISTRY_KEY)
            .and_then(|registry| registry.get(content_id.as_str()))
            .and_then(|row| serde_json::from_value(row.clone()).ok()))
    }

    pub fn contains(&self, content_id: &ContentId) -> Result<bool, DocumentError> {
        Ok(self.get(content_id)?.is_some())
    }

    /// One-shot scan appending every registry id missing from the sentinel
    /// playlist, in registry insertion order, without reordering existing
    /// entries. Needed because a change subscriber attached at process
    /// start misses rows that arrived earlier.
    pub fn reconcile_sentinel(&self) -> Result<Vec<ContentId>, DocumentError> {
        self.store.ensure_ready()?;
        let appended = self.store.transact(reconcile_sentinel_in_doc)?;
        if !appended.is_empty() {
            self.store.publish(Message::Playlist(PlaylistMessage::ItemsAppended {
                playlist_id: ALL_PLAYLIST_ID.to_string(),
                content_ids: appended.clone(),
            }));
        }
        Ok(appended)
    }
}

/// Reconciliation body shared with the document initialization path, which
/// runs before the readiness flag flips.
pub(crate) fn reconcile_sentinel_in_doc(doc: &LoroDoc) -> Result<Vec<ContentId>, DocumentError> {
    let json = schema::doc_json(doc);
    let playlists = schema::playlists_map(doc);
    let Some(sentinel) = schema::record_of(&playlists, ALL_PLAYLIST_ID) else {
        return Ok(Vec::new());
    };
    let items = schema::ensure_items_list(&sentinel)?;
    let have: HashSet<String> = schema::items_in_json(&json, ALL_PLAYLIST_ID)
        .into_iter()
        .collect();

    let mut appended = Vec::new();
    for row in schema::registry_rows(&json) {
        if !have.contains(row.content_id.as_str()) {
            items.push(row.content_id.as_str())?;
            appended.push(row.content_id);
        }
    }
    Ok(appended)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, StorageConfig};
    use tokio::sync::broadcast;

    fn ready_store(dir: &std::path::Path) -> Arc<DocumentStore> {
        let config = Config {
            storage: StorageConfig {
                data_dir: dir.to_string_lossy().to_string(),
            },
            ..Config::default()
        };
        let (bus, _) = broadcast::channel(64);
        let store = DocumentStore::open(&config, bus).expect("open store");
        store.initialize().expect("initialize store");
        store
    }

    fn meta(cid: &str, name: &str, ts: i64) -> TrackMeta {
        TrackMeta {
            content_id: cid.into(),
            name: name.to_string(),
            mime_type: "audio/mpeg".to_string(),
            created_at_ms: ts,
            duration_secs: None,
        }
    }

    #[test]
    fn test_commit_inserts_row_and_sentinel_entry() {
        let dir = tempfile::tempdir().expect("temp dir");
        let registry = TrackRegistry::new(ready_store(dir.path()));

        let outcome = registry
            .commit_track(&meta("sha256:aa", "a.mp3", 1), ALL_PLAYLIST_ID)
            .expect("commit");
        assert!(outcome.inserted);
        assert!(outcome.sentinel_appended);
        assert!(!outcome.appended_to_destination);

        let tracks = registry.tracks().expect("tracks");
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].name, "a.mp3");
    }

    #[test]
    fn test_recommit_same_content_keeps_first_metadata() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = ready_store(dir.path());
        let registry = TrackRegistry::new(Arc::clone(&store));

        registry
            .commit_track(&meta("sha256:aa", "first-name.mp3", 1), ALL_PLAYLIST_ID)
            .expect("first commit");
        let second = registry
            .commit_track(&meta("sha256:aa", "second-name.mp3", 2), ALL_PLAYLIST_ID)
            .expect("second commit");
        assert!(!second.inserted);
        assert!(!second.sentinel_appended);

        let tracks = registry.tracks().expect("tracks");
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].name, "first-name.mp3");

        let json = store.read_json().expect("read");
        assert_eq!(
            schema::items_in_json(&json, ALL_PLAYLIST_ID),
            vec!["sha256:aa"]
        );
    }

    #[test]
    fn test_commit_to_missing_destination_keeps_registry_row() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = ready_store(dir.path());
        let registry = TrackRegistry::new(Arc::clone(&store));

        let outcome = registry
            .commit_track(&meta("sha256:aa", "a.mp3", 1), "ghost-playlist")
            .expect("commit");
        assert!(outcome.inserted);
        assert!(!outcome.appended_to_destination);

        assert!(registry.contains(&"sha256:aa".into()).expect("contains"));
        let json = store.read_json().expect("read");
        assert_eq!(
            schema::items_in_json(&json, ALL_PLAYLIST_ID),
            vec!["sha256:aa"]
        );
    }

    #[test]
    fn test_reconciliation_appends_missing_rows_in_insertion_order() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = ready_store(dir.path());
        let registry = TrackRegistry::new(Arc::clone(&store));

        registry
            .commit_track(&meta("sha256:xx", "x.mp3", 1), ALL_PLAYLIST_ID)
            .expect("commit x");
        registry
            .commit_track(&meta("sha256:yy", "y.mp3", 2), ALL_PLAYLIST_ID)
            .expect("commit y");

        // A row that arrived while no subscriber was attached: written
        // directly, bypassing commit_track's sentinel append.
        store
            .transact(|doc| {
                let registry_map = schema::registry_map(doc);
                schema::write_track_row(&registry_map, &meta("sha256:zz", "z.mp3", 3))?;
                Ok(())
            })
            .expect("raw write");

        let appended = registry.reconcile_sentinel().expect("reconcile");
        assert_eq!(appended, vec![ContentId::from("sha256:zz")]);

        let json = store.read_json().expect("read");
        assert_eq!(
            schema::items_in_json(&json, ALL_PLAYLIST_ID),
            vec!["sha256:xx", "sha256:yy", "sha256:zz"]
        );

        // A second pass finds nothing to do.
        assert!(registry.reconcile_sentinel().expect("reconcile").is_empty());
    }

    #[test]
    fn test_duration_backfill_applies_materiality_threshold() {
        let dir = tempfile::tempdir().expect("temp dir");
        let registry = TrackRegistry::new(ready_store(dir.path()));
        let cid = ContentId::from("sha256:aa");

        registry
            .commit_track(&meta("sha256:aa", "a.mp3", 1), ALL_PLAYLIST_ID)
            .expect("commit");

        // Absent duration: first detection always writes.
        assert!(registry.backfill_duration(&cid, 180.0).expect("backfill"));
        // Within tolerance: dropped.
        assert!(!registry.backfill_duration(&cid, 180.4).expect("backfill"));
        assert_eq!(
            registry.get(&cid).expect("get").expect("row").duration_secs,
            Some(180.0)
        );
        // Material change: written.
        assert!(registry.backfill_duration(&cid, 181.0).expect("backfill"));
        assert_eq!(
            registry.get(&cid).expect("get").expect("row").duration_secs,
            Some(181.0)
        );
        // Unknown track: ignored.
        assert!(!registry
            .backfill_duration(&"sha256:nope".into(), 10.0)
            .expect("backfill"));
    }
}
