//! Per-playlist membership over the registry, plus active selection.
//!
//! Items sequences reference the registry by content id only; metadata is
//! resolved at read time and entries that do not (yet) resolve are filtered
//! silently — a transient dangling reference is legal while an ingest
//! commit is still in flight elsewhere.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, warn};
use uuid::Uuid;

use crate::content_id::ContentId;
use crate::document::{DocumentError, DocumentStore};
use crate::protocol::{Message, PlaylistMessage};
use crate::schema::{self, PlaylistInfo, TrackMeta, ALL_PLAYLIST_ID};

#[derive(Clone)]
pub struct PlaylistIndex {
    store: Arc<DocumentStore>,
}

impl PlaylistIndex {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    /// Creates an empty playlist with a fresh id.
    pub fn create_playlist(&self, name: &str) -> Result<PlaylistInfo, DocumentError> {
        self.store.ensure_ready()?;
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(DocumentError::InvalidInput(
                "playlist name is empty".to_string(),
            ));
        }

        let info = PlaylistInfo {
            id: Uuid::new_v4().to_string(),
            name: trimmed.to_string(),
        };
        self.store.transact(|doc| {
            let playlists = schema::playlists_map(doc);
            schema::new_record(&playlists, &info)?;
            Ok(())
        })?;
        self.store
            .publish(Message::Playlist(PlaylistMessage::PlaylistCreated(
                info.clone(),
            )));
        Ok(info)
    }

    /// All playlist infos, sentinel first, then by name.
    pub fn playlists(&self) -> Result<Vec<PlaylistInfo>, DocumentError> {
        let json = self.store.read_json()?;
        let mut infos: Vec<PlaylistInfo> = json
            .get(schema::PLAYLISTS_KEY)
            .and_then(|playlists| playlists.as_object())
            .map(|records| {
                records
                    .values()
                    .filter_map(|record| {
                        serde_json::from_value(record.get(schema::INFO_KEY)?.clone()).ok()
                    })
                    .collect()
            })
            .unwrap_or_default();
        infos.sort_by(|a: &PlaylistInfo, b: &PlaylistInfo| {
            (a.id != ALL_PLAYLIST_ID)
                .cmp(&(b.id != ALL_PLAYLIST_ID))
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(infos)
    }

    /// Raw membership sequence of one playlist.
    pub fn items(&self, playlist_id: &str) -> Result<Vec<ContentId>, DocumentError> {
        let json = self.store.read_json()?;
        if json[schema::PLAYLISTS_KEY].get(playlist_id).is_none() {
            return Err(DocumentError::UnknownPlaylist(playlist_id.to_string()));
        }
        Ok(schema::items_in_json(&json, playlist_id)
            .into_iter()
            .map(ContentId::from)
            .collect())
    }

    /// Membership resolved against the registry; dangling ids are filtered.
    pub fn resolved_tracks(&self, playlist_id: &str) -> Result<Vec<TrackMeta>, DocumentError> {
        let json = self.store.read_json()?;
        if json[schema::PLAYLISTS_KEY].get(playlist_id).is_none() {
            return Err(DocumentError::UnknownPlaylist(playlist_id.to_string()));
        }
        Ok(schema::items_in_json(&json, playlist_id)
            .into_iter()
            .filter_map(|id| schema::resolve_meta(&json, &ContentId::from(id)))
            .collect())
    }

    /// Makes tracks also appear in `destination_id`.
    ///
    /// Additive only: no source playlist's membership is altered, and ids
    /// already present in the destination are skipped. Returns the ids that
    /// were actually appended, in append order.
    pub fn move_tracks_to(
        &self,
        content_ids: &[ContentId],
        destination_id: &str,
    ) -> Result<Vec<ContentId>, DocumentError> {
        self.store.ensure_ready()?;
        let appended = self.store.transact(|doc| {
            let json = schema::doc_json(doc);
            let playlists = schema::playlists_map(doc);
            let Some(record) = schema::record_of(&playlists, destination_id) else {
                warn!(
                    "Playlists: move destination '{}' not found; nothing moved",
                    destination_id
                );
                return Ok(Vec::new());
            };
            let items = schema::ensure_items_list(&record)?;
            let mut have: HashSet<String> = schema::items_in_json(&json, destination_id)
                .into_iter()
                .collect();

            let mut appended = Vec::new();
            for content_id in content_ids {
                if have.contains(content_id.as_str()) {
                    continue;
                }
                if schema::resolve_meta(&json, content_id).is_none() {
                    debug!(
                        "Playlists: moving {} with no resolvable metadata yet",
                        content_id
                    );
                }
                items.push(content_id.as_str())?;
                have.insert(content_id.as_str().to_string());
                appended.push(content_id.clone());
            }
            Ok(appended)
        })?;

        if !appended.is_empty() {
            self.store
                .publish(Message::Playlist(PlaylistMessage::ItemsAppended {
                    playlist_id: destination_id.to_string(),
                    content_ids: appended.clone(),
                }));
        }
        Ok(appended)
    }

    /// Switches the bookmarkable active-playlist identifier.
    pub fn set_active(&self, playlist_id: &str) {
        self.store.set_active_playlist(playlist_id);
    }

    pub fn active_id(&self) -> String {
        self.store.active_playlist_id()
    }

    /// Info of the active playlist, falling back to the sentinel when the
    /// bookmarked id does not resolve to a record.
    pub fn active_info(&self) -> Result<PlaylistInfo, DocumentError> {
        let json = self.store.read_json()?;
        let active_id = self.store.active_playlist_id();
        let info_of = |id: &str| -> Option<PlaylistInfo> {
            serde_json::from_value(
                json[schema::PLAYLISTS_KEY]
                    .get(id)?
                    .get(schema::INFO_KEY)?
                    .clone(),
            )
            .ok()
        };
        info_of(&active_id)
            .or_else(|| info_of(ALL_PLAYLIST_ID))
            .ok_or_else(|| DocumentError::UnknownPlaylist(active_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, StorageConfig};
    use crate::registry::TrackRegistry;
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
    fn test_create_playlist_rejects_blank_names() {
        let dir = tempfile::tempdir().expect("temp dir");
        let playlists = PlaylistIndex::new(ready_store(dir.path()));

        assert!(matches!(
            playlists.create_playlist("   "),
            Err(DocumentError::InvalidInput(_))
        ));

        let info = playlists.create_playlist("  Road trip  ").expect("create");
        assert_eq!(info.name, "Road trip");
        assert!(playlists.items(&info.id).expect("items").is_empty());
    }

    #[test]
    fn test_playlists_lists_sentinel_first() {
        let dir = tempfile::tempdir().expect("temp dir");
        let playlists = PlaylistIndex::new(ready_store(dir.path()));

        playlists.create_playlist("Zebra").expect("create");
        playlists.create_playlist("Aardvark").expect("create");

        let infos = playlists.playlists().expect("list");
        assert_eq!(infos[0].id, ALL_PLAYLIST_ID);
        assert_eq!(infos[1].name, "Aardvark");
        assert_eq!(infos[2].name, "Zebra");
    }

    #[test]
    fn test_move_is_additive_and_never_touches_sources() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = ready_store(dir.path());
        let registry = TrackRegistry::new(Arc::clone(&store));
        let playlists = PlaylistIndex::new(Arc::clone(&store));

        let source = playlists.create_playlist("Source").expect("create");
        let destination = playlists.create_playlist("Destination").expect("create");
        registry
            .commit_track(&meta("sha256:aa", "a.mp3", 1), &source.id)
            .expect("commit a");
        registry
            .commit_track(&meta("sha256:bb", "b.mp3", 2), &source.id)
            .expect("commit b");

        let moved = playlists
            .move_tracks_to(
                &["sha256:aa".into(), "sha256:bb".into()],
                &destination.id,
            )
            .expect("move");
        assert_eq!(moved.len(), 2);

        // Source membership is untouched; destination gained both.
        assert_eq!(playlists.items(&source.id).expect("items").len(), 2);
        assert_eq!(playlists.items(&destination.id).expect("items").len(), 2);

        // Moving again is a no-op.
        let again = playlists
            .move_tracks_to(&["sha256:aa".into()], &destination.id)
            .expect("move again");
        assert!(again.is_empty());
        assert_eq!(playlists.items(&destination.id).expect("items").len(), 2);
    }

    #[test]
    fn test_move_to_missing_destination_moves_nothing() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = ready_store(dir.path());
        let registry = TrackRegistry::new(Arc::clone(&store));
        let playlists = PlaylistIndex::new(Arc::clone(&store));

        registry
            .commit_track(&meta("sha256:aa", "a.mp3", 1), ALL_PLAYLIST_ID)
            .expect("commit");
        let moved = playlists
            .move_tracks_to(&["sha256:aa".into()], "ghost")
            .expect("move");
        assert!(moved.is_empty());
    }

    #[test]
    fn test_dangling_items_are_filtered_from_resolved_tracks() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = ready_store(dir.path());
        let registry = TrackRegistry::new(Arc::clone(&store));
        let playlists = PlaylistIndex::new(Arc::clone(&store));

        let list = playlists.create_playlist("Mine").expect("create");
        registry
            .commit_track(&meta("sha256:aa", "a.mp3", 1), &list.id)
            .expect("commit");
        // An id whose commit has not landed yet.
        playlists
            .move_tracks_to(&["sha256:pending".into()], &list.id)
            .expect("move");

        assert_eq!(playlists.items(&list.id).expect("items").len(), 2);
        let resolved = playlists.resolved_tracks(&list.id).expect("resolved");
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].name, "a.mp3");
    }

    #[test]
    fn test_active_selection_falls_back_to_sentinel() {
        let dir = tempfile::tempdir().expect("temp dir");
        let playlists = PlaylistIndex::new(ready_store(dir.path()));

        assert_eq!(playlists.active_id(), ALL_PLAYLIST_ID);
        playlists.set_active("deleted-elsewhere");
        assert_eq!(playlists.active_id(), "deleted-elsewhere");
        let info = playlists.active_info().expect("active info");
        assert_eq!(info.id, ALL_PLAYLIST_ID);

        let created = playlists.create_playlist("Mine").expect("create");
        playlists.set_active(&created.id);
        assert_eq!(playlists.active_info().expect("active info").id, created.id);
    }

    #[test]
    fn test_unknown_playlist_reads_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let playlists = PlaylistIndex::new(ready_store(dir.path()));

        assert!(matches!(
            playlists.items("ghost"),
            Err(DocumentError::UnknownPlaylist(_))
        ));
        assert!(matches!(
            playlists.resolved_tracks("ghost"),
            Err(DocumentError::UnknownPlaylist(_))
        ));
    }
}
