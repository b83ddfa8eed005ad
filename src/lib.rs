//! Core of a shared, offline-capable playlist node.
//!
//! Several clients hold the same replicated document (playlists, a
//! canonical track registry, chat) and reconcile automatically when peers
//! exchange updates. This crate owns the data model and its pipelines:
//! schema migration, registry dedup with the derived "All Tracks" view,
//! and content-addressed media ingestion. CRDT merge itself, transport and
//! playback live elsewhere.

pub mod blob_store;
pub mod chat;
pub mod config;
pub mod content_id;
pub mod db_manager;
pub mod document;
pub mod hash_worker;
pub mod ingest_manager;
pub mod playlist_index;
pub mod protocol;
pub mod registry;
pub mod schema;
