use std::sync::Arc;

use chatproto::{Message, MAX_MESSAGE_LENGTH};

use crate::handler::{CommandHandler, Flow};
use crate::room::RoomManager;
use crate::session::Session;

/// Classifies each inbound line as a command or chat and dispatches it.
pub struct Router {
    rooms: Arc<RoomManager>,
    handler: CommandHandler,
}

impl Router {
    pub fn new(rooms: Arc<RoomManager>, handler: CommandHandler) -> Self {
        Self { rooms, handler }
    }

    pub async fn route(&self, session: &Arc<Session>, line: &str) -> Flow {
        let line = line.trim();
        if line.is_empty() {
            return Flow::Continue;
        }

        if line.starts_with('/') {
            return self.handler.handle(session, line).await;
        }

        self.route_chat(session, line).await
    }

    async fn route_chat(&self, session: &Arc<Session>, content: &str) -> Flow {
        if content.len() > MAX_MESSAGE_LENGTH {
            let _ = session
                .send(
                    Message::error("Message too long. Maximum length is 1024 characters.").format(),
                )
                .await;
            return Flow::Continue;
        }

        // Persistent private-chat mode is not a thing yet; /msg is the only
        // PM path, so any leftover marker is dropped here.
        if session.private_chat_with().is_some() {
            session.set_private_chat_with(None);
        }

        let Some(current) = session.current_room() else {
            let _ = session
                .send(Message::error("You are not in any room.").format())
                .await;
            return Flow::Continue;
        };

        let Some(room) = self.rooms.get(&current).await else {
            let _ = session
                .send(Message::error("Current room no longer exists.").format())
                .await;
            return Flow::Continue;
        };

        let from = session.username().unwrap_or_default();
        room.broadcast_to_all(&Message::chat(from, content)).await;
        Flow::Continue
    }
}
