//! The ingestion pipeline runtime component.
//!
//! Per accepted upload: hash off-path on the shared worker, deduplicate,
//! commit metadata in one transaction, persist bytes in the background,
//! then clean up the pending-table entry. Global progress is the unweighted
//! mean over everything still pending — a logically finished upload keeps
//! depressing the aggregate until its bytes are persisted.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use log::{debug, error, info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::{Receiver, Sender};
use uuid::Uuid;

use crate::blob_store::BlobStore;
use crate::hash_worker::{HashRequest, HashWorker};
use crate::protocol::{IngestMessage, Message, TrackDescriptor};
use crate::registry::TrackRegistry;
use crate::schema::{self, TrackMeta};

const SUPPORTED_AUDIO_EXTENSIONS: [(&str, &str); 7] = [
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("ogg", "audio/ogg"),
    ("flac", "audio/flac"),
    ("aac", "audio/aac"),
    ("m4a", "audio/mp4"),
    ("mp4", "audio/mp4"),
];

/// Declared type for a path, or empty when unknown (the worker applies the
/// default at the describe stage).
fn guess_mime_type(path: &Path) -> String {
    path.extension()
        .and_then(OsStr::to_str)
        .and_then(|extension| {
            SUPPORTED_AUDIO_EXTENSIONS
                .iter()
                .find(|(supported, _)| extension.eq_ignore_ascii_case(supported))
                .map(|(_, mime)| mime.to_string())
        })
        .unwrap_or_default()
}

struct PendingUpload {
    bytes: Arc<Vec<u8>>,
    name: String,
    progress: f64,
    described: bool,
}

/// Coordinates accepts, commits, background persistence and cleanup.
pub struct IngestManager {
    bus_consumer: Receiver<Message>,
    bus_producer: Sender<Message>,
    registry: TrackRegistry,
    blob_store: Arc<dyn BlobStore>,
    worker: HashWorker,
    pending: HashMap<Uuid, PendingUpload>,
}

impl IngestManager {
    pub fn new(
        bus_consumer: Receiver<Message>,
        bus_producer: Sender<Message>,
        registry: TrackRegistry,
        blob_store: Arc<dyn BlobStore>,
        worker: HashWorker,
    ) -> Self {
        Self {
            bus_consumer,
            bus_producer,
            registry,
            blob_store,
            worker,
            pending: HashMap::new(),
        }
    }

    pub fn run(&mut self) {
        loop {
            match self.bus_consumer.blocking_recv() {
                Ok(Message::Ingest(message)) => {
                    if !self.handle_message(message) {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Ingest: lagged behind the bus, {} messages skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!("Ingest: manager loop exited");
    }

    /// Handles one bus message; returns `false` on shutdown.
    fn handle_message(&mut self, message: IngestMessage) -> bool {
        match message {
            IngestMessage::ImportFile { path, playlist_id } => {
                self.import_file(path, &playlist_id);
            }
            IngestMessage::CancelUpload { upload_id } => self.cancel_upload(upload_id),
            IngestMessage::Shutdown => {
                info!(
                    "Ingest: shutdown requested with {} upload(s) in flight",
                    self.pending.len()
                );
                self.worker.shutdown();
                return false;
            }
            IngestMessage::UploadProgress {
                upload_id,
                progress,
            } => {
                if let Some(upload) = self.pending.get_mut(&upload_id) {
                    upload.progress = progress.clamp(0.0, 1.0);
                    self.publish_global_progress();
                }
            }
            IngestMessage::Described {
                upload_id,
                progress,
                descriptor,
            } => self.commit_upload(upload_id, progress, descriptor),
            IngestMessage::UploadFailed { upload_id, error } => {
                // No retry and no timeout: the entry stays pending until a
                // cancel or shutdown clears it.
                error!(
                    "Ingest: upload {} failed and stays pending: {}",
                    upload_id, error
                );
            }
            IngestMessage::PersistFinished {
                upload_id,
                stored,
                error,
            } => self.finish_upload(upload_id, stored, error),
            IngestMessage::ImportRejected { .. }
            | IngestMessage::UploadStarted { .. }
            | IngestMessage::UploadCancelled { .. }
            | IngestMessage::Committed { .. }
            | IngestMessage::GlobalProgress(_) => {}
        }
        true
    }

    /// Accept stage: capture bytes and declared name/type, issue an id.
    pub fn begin_upload(
        &mut self,
        bytes: Vec<u8>,
        name: &str,
        mime_type: &str,
        playlist_id: &str,
    ) -> Option<Uuid> {
        let upload_id = Uuid::new_v4();
        let bytes = Arc::new(bytes);
        self.pending.insert(
            upload_id,
            PendingUpload {
                bytes: Arc::clone(&bytes),
                name: name.to_string(),
                progress: 0.0,
                described: false,
            },
        );

        let submitted = self.worker.submit(HashRequest {
            upload_id,
            bytes,
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            playlist_id: playlist_id.to_string(),
        });
        if submitted.is_err() {
            self.pending.remove(&upload_id);
            error!("Ingest: hash worker is gone, cannot accept '{}'", name);
            return None;
        }

        debug!("Ingest: accepted '{}' as upload {}", name, upload_id);
        let _ = self
            .bus_producer
            .send(Message::Ingest(IngestMessage::UploadStarted {
                upload_id,
                name: name.to_string(),
            }));
        self.publish_global_progress();
        Some(upload_id)
    }

    fn import_file(&mut self, path: PathBuf, playlist_id: &str) {
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("Ingest: failed to read {}: {}", path.display(), err);
                let _ = self
                    .bus_producer
                    .send(Message::Ingest(IngestMessage::ImportRejected {
                        path,
                        error: err.to_string(),
                    }));
                return;
            }
        };

        let name = path
            .file_name()
            .and_then(OsStr::to_str)
            .unwrap_or("unnamed")
            .to_string();
        let mime_type = guess_mime_type(&path);
        if self
            .begin_upload(bytes, &name, &mime_type, playlist_id)
            .is_none()
        {
            let _ = self
                .bus_producer
                .send(Message::Ingest(IngestMessage::ImportRejected {
                    path,
                    error: "hash worker is gone".to_string(),
                }));
        }
    }

    /// Commit stage plus the background persist handoff.
    fn commit_upload(&mut self, upload_id: Uuid, progress: f64, descriptor: TrackDescriptor) {
        let Some(upload) = self.pending.get_mut(&upload_id) else {
            debug!(
                "Ingest: descriptor for upload {} arrived after it left the pipeline",
                upload_id
            );
            return;
        };
        upload.described = true;
        upload.progress = progress.clamp(0.0, 1.0);

        let meta = TrackMeta {
            content_id: descriptor.content_id.clone(),
            name: descriptor.name.clone(),
            mime_type: descriptor.mime_type.clone(),
            created_at_ms: schema::now_millis(),
            duration_secs: None,
        };
        match self.registry.commit_track(&meta, &descriptor.playlist_id) {
            Ok(outcome) => {
                debug!(
                    "Ingest: committed upload {} as {} (new row: {})",
                    upload_id, descriptor.content_id, outcome.inserted
                );
                let _ = self
                    .bus_producer
                    .send(Message::Ingest(IngestMessage::Committed {
                        upload_id,
                        content_id: descriptor.content_id.clone(),
                    }));

                let bytes = Arc::clone(&upload.bytes);
                let blob_store = Arc::clone(&self.blob_store);
                let bus_producer = self.bus_producer.clone();
                let content_id = descriptor.content_id;
                thread::spawn(move || {
                    let result = blob_store.write(&content_id, &bytes);
                    let message = match result {
                        Ok(stored) => IngestMessage::PersistFinished {
                            upload_id,
                            stored,
                            error: None,
                        },
                        Err(err) => IngestMessage::PersistFinished {
                            upload_id,
                            stored: false,
                            error: Some(err.to_string()),
                        },
                    };
                    let _ = bus_producer.send(Message::Ingest(message));
                });
            }
            Err(err) => {
                let _ = self
                    .bus_producer
                    .send(Message::Ingest(IngestMessage::UploadFailed {
                        upload_id,
                        error: err.to_string(),
                    }));
            }
        }
    }

    /// Cleanup stage: runs whether or not the bytes made it to storage.
    fn finish_upload(&mut self, upload_id: Uuid, stored: bool, error: Option<String>) {
        match (&error, stored) {
            (Some(error), _) => error!(
                "Ingest: blob persist failed for upload {}; track stays listed without playable bytes: {}",
                upload_id, error
            ),
            (None, true) => debug!("Ingest: stored bytes for upload {}", upload_id),
            (None, false) => debug!(
                "Ingest: bytes for upload {} already present, write skipped",
                upload_id
            ),
        }
        if let Some(upload) = self.pending.remove(&upload_id) {
            debug!("Ingest: upload {} ('{}') left the pipeline", upload_id, upload.name);
        }
        self.publish_global_progress();
    }

    fn cancel_upload(&mut self, upload_id: Uuid) {
        match self.pending.get(&upload_id) {
            Some(upload) if !upload.described => {
                self.worker.cancel(upload_id);
                self.pending.remove(&upload_id);
                info!("Ingest: cancelled upload {}", upload_id);
                let _ = self
                    .bus_producer
                    .send(Message::Ingest(IngestMessage::UploadCancelled { upload_id }));
                self.publish_global_progress();
            }
            Some(_) => debug!(
                "Ingest: upload {} already committed; cancellation ignored",
                upload_id
            ),
            None => debug!("Ingest: cancellation for unknown upload {}", upload_id),
        }
    }

    /// Unweighted mean over everything pending; exactly zero when idle.
    pub fn global_progress(&self) -> f64 {
        if self.pending.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.pending.values().map(|upload| upload.progress).sum();
        sum / self.pending.len() as f64
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn publish_global_progress(&self) {
        let _ = self
            .bus_producer
            .send(Message::Ingest(IngestMessage::GlobalProgress(
                self.global_progress(),
            )));
    }
}
