//! Append-only per-playlist chat.

use std::sync::Arc;

use loro::LoroMap;

use crate::document::{DocumentError, DocumentStore};
use crate::protocol::{Message, PlaylistMessage};
use crate::schema::{self, ChatMessage};

#[derive(Clone)]
pub struct ChatLog {
    store: Arc<DocumentStore>,
}

impl ChatLog {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    /// Appends one immutable message to a playlist's chat sequence.
    pub fn append(
        &self,
        playlist_id: &str,
        sender: &str,
        text: &str,
    ) -> Result<ChatMessage, DocumentError> {
        self.store.ensure_ready()?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(DocumentError::InvalidInput("chat message is empty".to_string()));
        }

        let message = ChatMessage {
            sender: sender.to_string(),
            sent_at_ms: schema::now_millis(),
            text: trimmed.to_string(),
        };
        self.store.transact(|doc| {
            let playlists = schema::playlists_map(doc);
            let Some(record) = schema::record_of(&playlists, playlist_id) else {
                return Err(DocumentError::UnknownPlaylist(playlist_id.to_string()));
            };
            let chat = schema::ensure_chat_list(&record)?;
            let entry: LoroMap = chat.insert_container(chat.len(), LoroMap::new())?;
            entry.insert("sender", message.sender.as_str())?;
            entry.insert("ts", message.sent_at_ms)?;
            entry.insert("text", message.text.as_str())?;
            Ok(())
        })?;

        self.store
            .publish(Message::Playlist(PlaylistMessage::ChatMessageAdded {
                playlist_id: playlist_id.to_string(),
                message: message.clone(),
            }));
        Ok(message)
    }

    /// Messages of one playlist, in append order.
    pub fn messages(&self, playlist_id: &str) -> Result<Vec<ChatMessage>, DocumentError> {
        let json = self.store.read_json()?;
        let Some(record) = json[schema::PLAYLISTS_KEY].get(playlist_id) else {
            return Err(DocumentError::UnknownPlaylist(playlist_id.to_string()));
        };
        Ok(record
            .get(schema::CHAT_KEY)
            .and_then(|chat| chat.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
                    .collect()
            })
            .unwrap_or_default())
    }
}
