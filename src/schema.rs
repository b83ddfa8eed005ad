//! Replicated document model, layout constants and the schema migrator.
//!
//! Document layout (inside the CRDT document):
//!
//! ```text
//! ROOT
//! ├── "playlists" (Map)            playlist id -> record
//! │   └── <id> (Map)
//! │       ├── "info" (Map)         { "id", "name" }
//! │       ├── "items" (List)       content-id strings, duplicates forbidden
//! │       ├── "chat" (List)        append-only message maps
//! │       └── "tracks" (List)      legacy embedded metadata, removed by migration
//! └── "tracks" (Map)               registry: content id -> track row
//! ```

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use loro::{Container, LoroDoc, LoroList, LoroMap, LoroResult, ToJson, ValueOrContainer};

use crate::content_id::ContentId;

pub const PLAYLISTS_KEY: &str = "playlists";
pub const REGISTRY_KEY: &str = "tracks";
pub const INFO_KEY: &str = "info";
pub const ITEMS_KEY: &str = "items";
pub const CHAT_KEY: &str = "chat";
/// Per-record key of the pre-`items` layout: embedded metadata objects.
pub const LEGACY_TRACKS_KEY: &str = "tracks";

/// Identifier of the always-present "All Tracks" collection.
pub const ALL_PLAYLIST_ID: &str = "all";
pub const ALL_PLAYLIST_NAME: &str = "All Tracks";

/// Canonical metadata of one distinct byte content.
///
/// Created exactly once per content by ingest commit; only `duration_secs`
/// is ever refined afterwards.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TrackMeta {
    #[serde(rename = "cid")]
    pub content_id: ContentId,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "mime", default)]
    pub mime_type: String,
    #[serde(rename = "ts", default)]
    pub created_at_ms: i64,
    #[serde(
        rename = "duration",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub duration_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PlaylistInfo {
    pub id: String,
    pub name: String,
}

/// One chat entry; immutable once appended.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub sender: String,
    #[serde(rename = "ts")]
    pub sent_at_ms: i64,
    pub text: String,
}

/// Structural shape of one playlist record.
///
/// Migration is an exhaustive match over this union; nothing else in the
/// crate probes for the legacy field.
#[derive(Debug)]
pub(crate) enum RecordShape {
    /// Pre-`items` layout: metadata embedded directly in the record.
    Legacy { embedded: Vec<TrackMeta> },
    Current,
}

/// What one `ensure_schema` run changed.
#[derive(Debug, Default)]
pub(crate) struct MigrationReport {
    pub created_sentinel: bool,
    pub migrated_records: usize,
    /// Registry rows created by legacy migration, in migration order.
    pub registered: Vec<ContentId>,
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn playlists_map(doc: &LoroDoc) -> LoroMap {
    doc.get_map(PLAYLISTS_KEY)
}

pub(crate) fn registry_map(doc: &LoroDoc) -> LoroMap {
    doc.get_map(REGISTRY_KEY)
}

/// Plain JSON view of the whole document, for existence checks and reads.
pub(crate) fn doc_json(doc: &LoroDoc) -> serde_json::Value {
    doc.get_deep_value().to_json_value()
}

pub(crate) fn record_of(playlists: &LoroMap, playlist_id: &str) -> Option<LoroMap> {
    match playlists.get(playlist_id) {
        Some(ValueOrContainer::Container(Container::Map(record))) => Some(record),
        _ => None,
    }
}

fn list_of(record: &LoroMap, key: &str) -> Option<LoroList> {
    match record.get(key) {
        Some(ValueOrContainer::Container(Container::List(list))) => Some(list),
        _ => None,
    }
}

pub(crate) fn items_list(record: &LoroMap) -> Option<LoroList> {
    list_of(record, ITEMS_KEY)
}

pub(crate) fn ensure_items_list(record: &LoroMap) -> LoroResult<LoroList> {
    match items_list(record) {
        Some(list) => Ok(list),
        None => record.insert_container(ITEMS_KEY, LoroList::new()),
    }
}

pub(crate) fn ensure_chat_list(record: &LoroMap) -> LoroResult<LoroList> {
    match list_of(record, CHAT_KEY) {
        Some(list) => Ok(list),
        None => record.insert_container(CHAT_KEY, LoroList::new()),
    }
}

/// Creates a playlist record with empty items and chat sequences.
pub(crate) fn new_record(playlists: &LoroMap, info: &PlaylistInfo) -> LoroResult<LoroMap> {
    let record = playlists.insert_container(info.id.as_str(), LoroMap::new())?;
    let info_map = record.insert_container(INFO_KEY, LoroMap::new())?;
    info_map.insert("id", info.id.as_str())?;
    info_map.insert("name", info.name.as_str())?;
    record.insert_container(ITEMS_KEY, LoroList::new())?;
    record.insert_container(CHAT_KEY, LoroList::new())?;
    Ok(record)
}

/// Writes one registry row. The caller is responsible for the absence check.
pub(crate) fn write_track_row(registry: &LoroMap, meta: &TrackMeta) -> LoroResult<()> {
    let row = registry.insert_container(meta.content_id.as_str(), LoroMap::new())?;
    row.insert("cid", meta.content_id.as_str())?;
    row.insert("name", meta.name.as_str())?;
    row.insert("mime", meta.mime_type.as_str())?;
    row.insert("ts", meta.created_at_ms)?;
    if let Some(duration_secs) = meta.duration_secs {
        row.insert("duration", duration_secs)?;
    }
    Ok(())
}

/// Item ids of one playlist, in sequence order.
pub(crate) fn items_in_json(json: &serde_json::Value, playlist_id: &str) -> Vec<String> {
    json.get(PLAYLISTS_KEY)
        .and_then(|playlists| playlists.get(playlist_id))
        .and_then(|record| record.get(ITEMS_KEY))
        .and_then(|items| items.as_array())
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Registry rows in insertion order (creation timestamp, then id).
pub(crate) fn registry_rows(json: &serde_json::Value) -> Vec<TrackMeta> {
    let mut rows: Vec<TrackMeta> = json
        .get(REGISTRY_KEY)
        .and_then(|registry| registry.as_object())
        .map(|entries| {
            entries
                .values()
                .filter_map(|row| serde_json::from_value(row.clone()).ok())
                .collect()
        })
        .unwrap_or_default();
    rows.sort_by(|a, b| {
        a.created_at_ms
            .cmp(&b.created_at_ms)
            .then_with(|| a.content_id.cmp(&b.content_id))
    });
    rows
}

/// Resolves metadata for an id: the registry row, or a record's embedded
/// copy if some peer still carries the legacy layout.
pub(crate) fn resolve_meta(json: &serde_json::Value, content_id: &ContentId) -> Option<TrackMeta> {
    if let Some(row) = json
        .get(REGISTRY_KEY)
        .and_then(|registry| registry.get(content_id.as_str()))
    {
        if let Ok(meta) = serde_json::from_value::<TrackMeta>(row.clone()) {
            return Some(meta);
        }
    }

    let records = json.get(PLAYLISTS_KEY).and_then(|p| p.as_object())?;
    for record in records.values() {
        let Some(embedded) = record.get(LEGACY_TRACKS_KEY).and_then(|t| t.as_array()) else {
            continue;
        };
        for entry in embedded {
            if let Ok(meta) = serde_json::from_value::<TrackMeta>(entry.clone()) {
                if &meta.content_id == content_id {
                    return Some(meta);
                }
            }
        }
    }
    None
}

fn classify_record(record_json: &serde_json::Value) -> RecordShape {
    match record_json
        .get(LEGACY_TRACKS_KEY)
        .and_then(|legacy| legacy.as_array())
    {
        Some(entries) => RecordShape::Legacy {
            // Entries without a content id are unusable and dropped, like
            // any other undecodable legacy debris.
            embedded: entries
                .iter()
                .filter_map(|entry| serde_json::from_value::<TrackMeta>(entry.clone()).ok())
                .collect(),
        },
        None => RecordShape::Current,
    }
}

/// Idempotent structural upgrade of the document.
///
/// Guarantees the sentinel record exists and that every record carries an
/// items sequence; migrates legacy embedded metadata into the registry and
/// the record's items, then removes the legacy field. Every insertion is
/// guarded by an existence check inside the same mutation, so the function
/// is safe to run repeatedly.
pub(crate) fn ensure_schema(doc: &LoroDoc) -> LoroResult<MigrationReport> {
    let playlists = playlists_map(doc);
    let registry = registry_map(doc);
    let mut report = MigrationReport::default();

    if record_of(&playlists, ALL_PLAYLIST_ID).is_none() {
        new_record(
            &playlists,
            &PlaylistInfo {
                id: ALL_PLAYLIST_ID.to_string(),
                name: ALL_PLAYLIST_NAME.to_string(),
            },
        )?;
        report.created_sentinel = true;
    }

    let json = doc_json(doc);
    let record_ids: Vec<String> = json
        .get(PLAYLISTS_KEY)
        .and_then(|playlists| playlists.as_object())
        .map(|records| records.keys().cloned().collect())
        .unwrap_or_default();

    for record_id in record_ids {
        let Some(record) = record_of(&playlists, &record_id) else {
            continue;
        };
        let record_json = &json[PLAYLISTS_KEY][&record_id];
        let items = ensure_items_list(&record)?;

        match classify_record(record_json) {
            RecordShape::Current => {}
            RecordShape::Legacy { embedded } => {
                let mut present: HashSet<String> =
                    items_in_json(&json, &record_id).into_iter().collect();
                for meta in embedded {
                    if registry.get(meta.content_id.as_str()).is_none() {
                        write_track_row(&registry, &meta)?;
                        report.registered.push(meta.content_id.clone());
                    }
                    if !present.contains(meta.content_id.as_str()) {
                        items.push(meta.content_id.as_str())?;
                        present.insert(meta.content_id.as_str().to_string());
                    }
                }
                record.delete(LEGACY_TRACKS_KEY)?;
                report.migrated_records += 1;
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use loro::{LoroDoc, LoroList, LoroMap};

    fn push_legacy_entry(
        legacy: &LoroList,
        cid: &str,
        name: &str,
        mime: &str,
        ts: i64,
    ) -> LoroMap {
        let entry = legacy
            .insert_container(legacy.len(), LoroMap::new())
            .expect("insert legacy entry");
        entry.insert("cid", cid).expect("cid");
        entry.insert("name", name).expect("name");
        entry.insert("mime", mime).expect("mime");
        entry.insert("ts", ts).expect("ts");
        entry
    }

    fn legacy_record(doc: &LoroDoc, playlist_id: &str, name: &str) -> LoroList {
        let playlists = playlists_map(doc);
        let record = playlists
            .insert_container(playlist_id, LoroMap::new())
            .expect("insert record");
        let info = record
            .insert_container(INFO_KEY, LoroMap::new())
            .expect("insert info");
        info.insert("id", playlist_id).expect("id");
        info.insert("name", name).expect("name");
        record
            .insert_container(LEGACY_TRACKS_KEY, LoroList::new())
            .expect("insert legacy list")
    }

    #[test]
    fn test_ensure_schema_creates_sentinel_record() {
        let doc = LoroDoc::new();
        let report = ensure_schema(&doc).expect("migrate");
        assert!(report.created_sentinel);

        let json = doc_json(&doc);
        assert_eq!(
            json[PLAYLISTS_KEY][ALL_PLAYLIST_ID][INFO_KEY]["name"],
            ALL_PLAYLIST_NAME
        );
        assert!(json[PLAYLISTS_KEY][ALL_PLAYLIST_ID][ITEMS_KEY]
            .as_array()
            .expect("items array")
            .is_empty());
        assert!(json[PLAYLISTS_KEY][ALL_PLAYLIST_ID][CHAT_KEY]
            .as_array()
            .expect("chat array")
            .is_empty());
    }

    #[test]
    fn test_ensure_schema_is_idempotent() {
        let doc = LoroDoc::new();
        let legacy = legacy_record(&doc, "p1", "Road trip");
        push_legacy_entry(&legacy, "sha256:aa", "a.mp3", "audio/mpeg", 1);
        push_legacy_entry(&legacy, "sha256:bb", "b.mp3", "audio/mpeg", 2);

        ensure_schema(&doc).expect("first run");
        let after_first = doc_json(&doc);

        let report = ensure_schema(&doc).expect("second run");
        assert!(!report.created_sentinel);
        assert_eq!(report.migrated_records, 0);
        assert!(report.registered.is_empty());
        assert_eq!(doc_json(&doc), after_first);
    }

    #[test]
    fn test_legacy_record_migrates_into_registry_and_items() {
        let doc = LoroDoc::new();
        let legacy = legacy_record(&doc, "p1", "Road trip");
        push_legacy_entry(&legacy, "sha256:aa", "a.mp3", "audio/mpeg", 1);
        push_legacy_entry(&legacy, "sha256:bb", "b.flac", "audio/flac", 2);

        let report = ensure_schema(&doc).expect("migrate");
        assert_eq!(report.migrated_records, 1);
        assert_eq!(
            report.registered,
            vec![ContentId::from("sha256:aa"), ContentId::from("sha256:bb")]
        );

        let json = doc_json(&doc);
        assert_eq!(items_in_json(&json, "p1"), vec!["sha256:aa", "sha256:bb"]);
        assert!(json[PLAYLISTS_KEY]["p1"].get(LEGACY_TRACKS_KEY).is_none());

        let rows = registry_rows(&json);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "a.mp3");
        assert_eq!(rows[1].mime_type, "audio/flac");
    }

    #[test]
    fn test_legacy_entries_without_content_id_are_dropped() {
        let doc = LoroDoc::new();
        let legacy = legacy_record(&doc, "p1", "Road trip");
        push_legacy_entry(&legacy, "sha256:aa", "a.mp3", "audio/mpeg", 1);
        let broken = legacy
            .insert_container(legacy.len(), LoroMap::new())
            .expect("insert broken entry");
        broken.insert("name", "no-id.mp3").expect("name");

        ensure_schema(&doc).expect("migrate");

        let json = doc_json(&doc);
        assert_eq!(items_in_json(&json, "p1"), vec!["sha256:aa"]);
        assert_eq!(registry_rows(&json).len(), 1);
    }

    #[test]
    fn test_shared_legacy_track_registers_once_but_lists_twice() {
        let doc = LoroDoc::new();
        let first = legacy_record(&doc, "p1", "Mine");
        push_legacy_entry(&first, "sha256:aa", "a.mp3", "audio/mpeg", 1);
        let second = legacy_record(&doc, "p2", "Yours");
        push_legacy_entry(&second, "sha256:aa", "renamed.mp3", "audio/mpeg", 5);

        let report = ensure_schema(&doc).expect("migrate");
        assert_eq!(report.registered.len(), 1);

        let json = doc_json(&doc);
        assert_eq!(items_in_json(&json, "p1"), vec!["sha256:aa"]);
        assert_eq!(items_in_json(&json, "p2"), vec!["sha256:aa"]);
        // First migrated copy wins the registry row.
        assert_eq!(registry_rows(&json)[0].name, "a.mp3");
    }

    #[test]
    fn test_resolve_meta_prefers_registry_then_legacy_copy() {
        let doc = LoroDoc::new();
        let legacy = legacy_record(&doc, "p1", "Road trip");
        push_legacy_entry(&legacy, "sha256:aa", "embedded.mp3", "audio/mpeg", 1);

        let before = doc_json(&doc);
        let embedded =
            resolve_meta(&before, &"sha256:aa".into()).expect("embedded copy resolves");
        assert_eq!(embedded.name, "embedded.mp3");

        ensure_schema(&doc).expect("migrate");
        let after = doc_json(&doc);
        let registered = resolve_meta(&after, &"sha256:aa".into()).expect("registry resolves");
        assert_eq!(registered.name, "embedded.mp3");
        assert!(resolve_meta(&after, &"sha256:missing".into()).is_none());
    }
}
