//! Event-bus protocol shared by all runtime components.
//!
//! This module defines all message payloads exchanged between the document
//! store, the track registry, playlist logic and the ingest pipeline.
//! Subscribers receive change deltas (additions), never full snapshots.

use std::path::PathBuf;

use uuid::Uuid;

use crate::content_id::ContentId;
use crate::schema::{ChatMessage, PlaylistInfo};

/// Top-level envelope for all bus traffic.
#[derive(Debug, Clone)]
pub enum Message {
    Document(DocumentMessage),
    Registry(RegistryMessage),
    Playlist(PlaylistMessage),
    Ingest(IngestMessage),
}

/// Document life-cycle and selection notifications.
#[derive(Debug, Clone)]
pub enum DocumentMessage {
    /// The persisted document finished its initial replay; reads are open.
    Ready,
    /// The bookmarkable active-playlist identifier changed.
    ActivePlaylistChanged(String),
}

/// Registry change deltas.
#[derive(Debug, Clone)]
pub enum RegistryMessage {
    /// New canonical rows appeared (local commit or merged from a peer).
    TracksAdded(Vec<ContentId>),
    /// A stored duration was refined past the materiality threshold.
    DurationUpdated {
        content_id: ContentId,
        duration_secs: f64,
    },
}

/// Playlist membership and chat deltas.
#[derive(Debug, Clone)]
pub enum PlaylistMessage {
    PlaylistCreated(PlaylistInfo),
    /// Identifiers appended to a playlist's items sequence, in append order.
    ItemsAppended {
        playlist_id: String,
        content_ids: Vec<ContentId>,
    },
    ChatMessageAdded {
        playlist_id: String,
        message: ChatMessage,
    },
}

/// Final metadata tuple produced by the hashing worker for one upload.
#[derive(Debug, Clone)]
pub struct TrackDescriptor {
    pub content_id: ContentId,
    pub mime_type: String,
    pub name: String,
    pub playlist_id: String,
}

/// Ingest-pipeline commands and worker protocol messages.
///
/// Per upload id, a coarse progress update precedes [`IngestMessage::Described`]
/// and a terminal progress update may arrive interleaved with or after it;
/// consumers must not assume a strict total order between the two.
#[derive(Debug, Clone)]
pub enum IngestMessage {
    /// Request: read a local file and run it through the pipeline.
    ImportFile { path: PathBuf, playlist_id: String },
    /// Request: abandon one upload that has not committed yet.
    CancelUpload { upload_id: Uuid },
    /// Request: discard the shared worker and all of its in-flight work.
    Shutdown,

    /// A file could not be accepted (unreadable path); no upload id exists.
    ImportRejected { path: PathBuf, error: String },
    /// An upload entered the pipeline and counts toward global progress.
    UploadStarted { upload_id: Uuid, name: String },
    /// Fractional progress of one upload, in `[0, 1]`.
    UploadProgress { upload_id: Uuid, progress: f64 },
    /// Hashing finished; carries the metadata tuple for the commit stage
    /// together with this stage's progress value.
    Described {
        upload_id: Uuid,
        progress: f64,
        descriptor: TrackDescriptor,
    },
    /// The upload was abandoned before commit and left the pipeline.
    UploadCancelled { upload_id: Uuid },
    /// The worker failed this upload; it stays pending (no retry, no timeout).
    UploadFailed { upload_id: Uuid, error: String },
    /// Metadata committed to the replicated document.
    Committed {
        upload_id: Uuid,
        content_id: ContentId,
    },
    /// Background byte persistence finished (successfully or not).
    PersistFinished {
        upload_id: Uuid,
        stored: bool,
        error: Option<String>,
    },
    /// Unweighted mean progress over all uploads still in the pending table.
    GlobalProgress(f64),
}
