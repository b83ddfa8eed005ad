use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use log::{debug, error, info};
use tokio::sync::broadcast;

use tunesync::blob_store::{BlobStore, FsBlobStore};
use tunesync::chat::ChatLog;
use tunesync::config;
use tunesync::document::{DocumentError, DocumentStore};
use tunesync::hash_worker::HashWorker;
use tunesync::ingest_manager::IngestManager;
use tunesync::playlist_index::PlaylistIndex;
use tunesync::protocol::{IngestMessage, Message};
use tunesync::registry::TrackRegistry;

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_string()
}

fn format_duration(duration_secs: Option<f64>) -> String {
    match duration_secs {
        Some(secs) if secs.is_finite() => {
            let total = secs.round() as u64;
            format!("{}:{:02}", total / 60, total % 60)
        }
        _ => "-:--".to_string(),
    }
}

fn print_library(playlists: &PlaylistIndex, chat: &ChatLog) -> Result<(), DocumentError> {
    for info in playlists.playlists()? {
        let tracks = playlists.resolved_tracks(&info.id)?;
        println!("{} ({} tracks)", info.name, tracks.len());
        for track in tracks {
            println!(
                "  {}  {}  [{}]  {}",
                format_duration(track.duration_secs),
                track.name,
                track.mime_type,
                track.content_id
            );
        }
        let messages = chat.messages(&info.id)?;
        if !messages.is_empty() {
            println!("  {} chat message(s)", messages.len());
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut clog = colog::default_builder();
    clog.filter(None, log::LevelFilter::Info);
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    let config = config::load_or_create();
    debug!(
        "Using data dir {}",
        config.storage.resolve_data_dir().display()
    );

    // Bus for communication between components
    let (bus_sender, _) = broadcast::channel(1024);

    let store = DocumentStore::open(&config, bus_sender.clone())?;
    store.initialize()?;

    let registry = TrackRegistry::new(Arc::clone(&store));
    let playlists = PlaylistIndex::new(Arc::clone(&store));
    let chat = ChatLog::new(Arc::clone(&store));
    let blob_store = Arc::new(FsBlobStore::open(config.storage.blob_dir())?);

    // Setup ingest manager with the shared hashing worker
    let worker = HashWorker::spawn(bus_sender.clone(), &config.ingest);
    let manager_bus_receiver = bus_sender.subscribe();
    let manager_bus_sender = bus_sender.clone();
    let manager_registry = registry.clone();
    let manager_blob_store = Arc::clone(&blob_store) as Arc<dyn BlobStore>;
    thread::spawn(move || {
        let run_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut ingest_manager = IngestManager::new(
                manager_bus_receiver,
                manager_bus_sender,
                manager_registry,
                manager_blob_store,
                worker,
            );
            ingest_manager.run();
        }));
        if let Err(payload) = run_result {
            log::error!(
                "IngestManager thread terminated due to panic: {}",
                panic_payload_to_string(payload.as_ref())
            );
        }
    });

    let paths: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    if paths.is_empty() {
        print_library(&playlists, &chat)?;
        let _ = bus_sender.send(Message::Ingest(IngestMessage::Shutdown));
        return Ok(());
    }

    // Subscribe before sending so no completion can be missed.
    let mut bus_receiver = bus_sender.subscribe();
    let destination = playlists.active_id();
    info!(
        "Importing {} file(s) into playlist '{}'",
        paths.len(),
        destination
    );
    for path in &paths {
        let _ = bus_sender.send(Message::Ingest(IngestMessage::ImportFile {
            path: path.clone(),
            playlist_id: destination.clone(),
        }));
    }

    // Each import terminates with exactly one of the messages below.
    let mut remaining = paths.len();
    let mut failed: HashSet<uuid::Uuid> = HashSet::new();
    while remaining > 0 {
        match bus_receiver.blocking_recv() {
            Ok(Message::Ingest(message)) => match message {
                IngestMessage::GlobalProgress(progress) => {
                    debug!("Upload progress: {:.0}%", progress * 100.0);
                }
                IngestMessage::ImportRejected { path, .. } => {
                    error!("Rejected {}", path.display());
                    remaining -= 1;
                }
                IngestMessage::UploadFailed { upload_id, .. } => {
                    if failed.insert(upload_id) {
                        remaining -= 1;
                    }
                }
                IngestMessage::UploadCancelled { .. } => {
                    remaining -= 1;
                }
                IngestMessage::PersistFinished { upload_id, .. } => {
                    if !failed.contains(&upload_id) {
                        remaining -= 1;
                    }
                }
                _ => {}
            },
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Main receiver lagged, {} messages skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    print_library(&playlists, &chat)?;
    info!(
        "{} byte(s) written to blob storage this run",
        blob_store.bytes_written()
    );
    let _ = bus_sender.send(Message::Ingest(IngestMessage::Shutdown));
    Ok(())
}
