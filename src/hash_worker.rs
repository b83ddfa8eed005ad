//! The shared off-path hashing worker.
//!
//! One long-lived thread serves every upload through a single serialized
//! inbound queue; responses are correlated by upload id on the bus. The
//! worker emits, per request: a coarse midpoint progress update, the
//! metadata-bearing [`IngestMessage::Described`] message, and a terminal
//! progress update. Cancellation is per request via a shared cancel set;
//! [`HashWorker::shutdown`] is the coarse teardown discarding the queue and
//! everything still in it.

use std::collections::HashSet;
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::debug;
use tokio::sync::broadcast::Sender;
use uuid::Uuid;

use crate::config::IngestConfig;
use crate::content_id::ContentId;
use crate::protocol::{IngestMessage, Message, TrackDescriptor};

/// Applied when an upload arrives without a declared type.
pub const DEFAULT_MIME_TYPE: &str = "audio/mpeg";

/// One hashing request; the id correlates every response message.
pub struct HashRequest {
    pub upload_id: Uuid,
    pub bytes: Arc<Vec<u8>>,
    pub name: String,
    pub mime_type: String,
    pub playlist_id: String,
}

pub struct HashWorker {
    request_tx: Option<SyncSender<HashRequest>>,
    cancelled: Arc<Mutex<HashSet<Uuid>>>,
    handle: Option<JoinHandle<()>>,
}

impl HashWorker {
    pub fn spawn(bus_producer: Sender<Message>, config: &IngestConfig) -> HashWorker {
        let (request_tx, request_rx) = mpsc::sync_channel::<HashRequest>(config.worker_queue_depth);
        let cancelled = Arc::new(Mutex::new(HashSet::new()));
        let worker_cancelled = Arc::clone(&cancelled);
        let chunk_bytes = config.hash_chunk_bytes.max(1);

        let handle = thread::Builder::new()
            .name("hash-worker".to_string())
            .spawn(move || {
                while let Ok(request) = request_rx.recv() {
                    process_request(&bus_producer, &worker_cancelled, chunk_bytes, request);
                }
                debug!("Hash worker: request queue closed, exiting");
            })
            .expect("Failed to spawn hash worker");

        HashWorker {
            request_tx: Some(request_tx),
            cancelled,
            handle: Some(handle),
        }
    }

    /// Queues one request; blocks when the inbound queue is full.
    pub fn submit(&self, request: HashRequest) -> Result<(), HashRequest> {
        match &self.request_tx {
            Some(tx) => tx.send(request).map_err(|err| err.0),
            None => Err(request),
        }
    }

    /// Marks one request cancelled; the worker skips or aborts it silently.
    pub fn cancel(&self, upload_id: Uuid) {
        self.cancelled
            .lock()
            .expect("cancel set lock poisoned")
            .insert(upload_id);
    }

    /// Discards the queue and all in-flight work, then joins the thread.
    pub fn shutdown(&mut self) {
        self.request_tx = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn take_cancelled(cancelled: &Mutex<HashSet<Uuid>>, upload_id: Uuid) -> bool {
    cancelled
        .lock()
        .expect("cancel set lock poisoned")
        .remove(&upload_id)
}

fn process_request(
    bus_producer: &Sender<Message>,
    cancelled: &Mutex<HashSet<Uuid>>,
    chunk_bytes: usize,
    request: HashRequest,
) {
    let upload_id = request.upload_id;
    if take_cancelled(cancelled, upload_id) {
        debug!("Hash worker: skipping cancelled upload {}", upload_id);
        return;
    }

    let total = request.bytes.len();
    let mut hasher = ContentId::hasher();
    let mut processed = 0usize;
    let mut midpoint_sent = false;

    for chunk in request.bytes.chunks(chunk_bytes) {
        if take_cancelled(cancelled, upload_id) {
            debug!("Hash worker: aborting cancelled upload {}", upload_id);
            return;
        }
        sha2::Digest::update(&mut hasher, chunk);
        processed += chunk.len();
        if !midpoint_sent && processed * 2 >= total {
            let _ = bus_producer.send(Message::Ingest(IngestMessage::UploadProgress {
                upload_id,
                progress: 0.5,
            }));
            midpoint_sent = true;
        }
    }
    if !midpoint_sent {
        // Empty input still reports the midpoint before its descriptor.
        let _ = bus_producer.send(Message::Ingest(IngestMessage::UploadProgress {
            upload_id,
            progress: 0.5,
        }));
    }

    let content_id = ContentId::from_digest(hasher);
    let mime_type = if request.mime_type.trim().is_empty() {
        DEFAULT_MIME_TYPE.to_string()
    } else {
        request.mime_type
    };
    debug!(
        "Hash worker: upload {} described as {}",
        upload_id, content_id
    );

    let _ = bus_producer.send(Message::Ingest(IngestMessage::Described {
        upload_id,
        progress: 1.0,
        descriptor: TrackDescriptor {
            content_id,
            mime_type,
            name: request.name,
            playlist_id: request.playlist_id,
        },
    }));
    let _ = bus_producer.send(Message::Ingest(IngestMessage::UploadProgress {
        upload_id,
        progress: 1.0,
    }));
}
