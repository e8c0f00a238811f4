use std::sync::Arc;

use chatproto::command::{parse_command, Command};
use chatproto::{Message, DEFAULT_ROOM};

use crate::room::RoomManager;
use crate::session::{Session, SessionManager};

/// What the read loop should do after a routed line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

const HELP_TEXT: &str = "
Available Commands:
  /help              - Show this help message
  /users             - List all online users
  /rooms             - List all available rooms
  /join <room>       - Join or create a room
  /leave             - Leave current room and return to #general
  /msg <user> <msg>  - Send a private message to a user
  /quit              - Disconnect from the server

Chat:
  - Type any message to chat in your current room
  - Messages are only visible to users in the same room
";

/// Executes `/commands` for authenticated sessions.
pub struct CommandHandler {
    sessions: Arc<SessionManager>,
    rooms: Arc<RoomManager>,
}

impl CommandHandler {
    pub fn new(sessions: Arc<SessionManager>, rooms: Arc<RoomManager>) -> Self {
        Self { sessions, rooms }
    }

    /// Parse and run one command line. Errors are reported to the caller's
    /// session and never end the connection; only `/quit` does.
    pub async fn handle(&self, session: &Arc<Session>, line: &str) -> Flow {
        match parse_command(line) {
            Ok(Command::Help) => {
                let _ = session.send(Message::command(HELP_TEXT).format()).await;
                Flow::Continue
            }
            Ok(Command::Users) => self.list_users(session).await,
            Ok(Command::Rooms) => self.list_rooms(session).await,
            Ok(Command::Join(room)) => self.join(session, room).await,
            Ok(Command::Leave) => self.leave(session).await,
            Ok(Command::Msg { to, text }) => self.private_message(session, &to, &text).await,
            Ok(Command::Quit) => {
                let _ = session.send(Message::system("Goodbye!").format()).await;
                Flow::Quit
            }
            Err(text) => {
                let _ = session.send(Message::error(text).format()).await;
                Flow::Continue
            }
        }
    }

    async fn list_users(&self, session: &Arc<Session>) -> Flow {
        let mut usernames = self.sessions.online_usernames().await;
        if usernames.is_empty() {
            let _ = session
                .send(Message::command("No users online.").format())
                .await;
            return Flow::Continue;
        }
        usernames.sort();

        let me = session.username().unwrap_or_default();
        let mut out = format!("Online Users ({}):\n", usernames.len());
        for username in &usernames {
            if *username == me {
                out.push_str(&format!("  - {username} (you)\n"));
            } else {
                out.push_str(&format!("  - {username}\n"));
            }
        }
        let _ = session.send(Message::command(out).format()).await;
        Flow::Continue
    }

    async fn list_rooms(&self, session: &Arc<Session>) -> Flow {
        let mut names = self.rooms.room_names().await;
        names.sort();

        let current = session.current_room().unwrap_or_default();
        let mut out = format!("Available Rooms ({}):\n", names.len());
        for name in &names {
            let Some((kind, members)) = self.rooms.room_info(name).await else {
                continue;
            };
            if *name == current {
                out.push_str(&format!(
                    "  - {name} [{}] ({members} members) (current)\n",
                    kind.as_str()
                ));
            } else {
                out.push_str(&format!(
                    "  - {name} [{}] ({members} members)\n",
                    kind.as_str()
                ));
            }
        }
        let _ = session.send(Message::command(out).format()).await;
        Flow::Continue
    }

    async fn join(&self, session: &Arc<Session>, room_arg: String) -> Flow {
        let room_name = if room_arg.starts_with('#') {
            room_arg
        } else {
            format!("#{room_arg}")
        };
        let username = session.username().unwrap_or_default();

        if let Some(current) = session.current_room() {
            self.rooms.leave(session).await;
            if let Some(old) = self.rooms.get(&current).await {
                old.broadcast(&Message::system(format!("{username} left the room")), "")
                    .await;
            }
        }

        let room = self.rooms.create(&room_name).await;
        if let Err(e) = self.rooms.join(&room_name, Arc::clone(session)).await {
            let _ = session.send(Message::error(e.to_string()).format()).await;
            return Flow::Continue;
        }

        let _ = session
            .send(Message::system(format!("You joined {room_name}")).format())
            .await;
        room.broadcast(
            &Message::system(format!("{username} joined the room")),
            &username,
        )
        .await;
        Flow::Continue
    }

    async fn leave(&self, session: &Arc<Session>) -> Flow {
        let current = match session.current_room() {
            Some(room) if room == DEFAULT_ROOM => {
                let _ = session
                    .send(Message::error("You are already in the default room.").format())
                    .await;
                return Flow::Continue;
            }
            Some(room) => room,
            None => {
                let _ = session
                    .send(Message::error("You are not in any room.").format())
                    .await;
                return Flow::Continue;
            }
        };

        let username = session.username().unwrap_or_default();

        // Departure goes out before the member is removed, so the leaver sees
        // it too.
        if let Some(room) = self.rooms.get(&current).await {
            room.broadcast(&Message::system(format!("{username} left the room")), "")
                .await;
        }
        self.rooms.leave(session).await;

        let default = self.rooms.default_room();
        default.add_member(Arc::clone(session)).await;
        session.set_current_room(Some(DEFAULT_ROOM.to_string()));

        let _ = session
            .send(
                Message::system(format!("You left {current} and returned to {DEFAULT_ROOM}"))
                    .format(),
            )
            .await;
        default
            .broadcast(
                &Message::system(format!("{username} joined the room")),
                &username,
            )
            .await;
        Flow::Continue
    }

    async fn private_message(&self, session: &Arc<Session>, to: &str, text: &str) -> Flow {
        let Some(target) = self.sessions.by_username(to).await else {
            let _ = session
                .send(Message::error(format!("User '{to}' is not online.")).format())
                .await;
            return Flow::Continue;
        };

        let from = session.username().unwrap_or_default();
        let _ = target
            .send(Message::private(&from, to, format!("[PM] {text}")).format())
            .await;
        let _ = session
            .send(Message::command(format!("[PM to {to}]: {text}")).format())
            .await;
        Flow::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::AuthState;
    use tokio::sync::mpsc;

    struct Fixture {
        sessions: Arc<SessionManager>,
        rooms: Arc<RoomManager>,
        handler: CommandHandler,
    }

    fn fixture() -> Fixture {
        let sessions = SessionManager::new(3, 16);
        let rooms = RoomManager::new();
        let handler = CommandHandler::new(Arc::clone(&sessions), Arc::clone(&rooms));
        Fixture {
            sessions,
            rooms,
            handler,
        }
    }

    /// Admit, register, and drop into #general, like the server does after a
    /// successful authentication.
    async fn join_user(
        fx: &Fixture,
        ip: &str,
        name: &str,
    ) -> (Arc<Session>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(64);
        let s = fx.sessions.admit(ip, tx).await.unwrap();
        fx.sessions.register_username(&s, name).await.unwrap();
        s.set_auth_state(AuthState::Authenticated);
        fx.rooms.join(DEFAULT_ROOM, Arc::clone(&s)).await.unwrap();
        (s, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn help_is_a_single_command_message() {
        let fx = fixture();
        let (alice, mut rx) = join_user(&fx, "10.0.0.1", "alice").await;

        assert_eq!(fx.handler.handle(&alice, "/help").await, Flow::Continue);
        let lines = drain(&mut rx);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("Available Commands:"));
        assert!(lines[0].contains("/msg <user> <msg>"));
        assert!(lines[0].ends_with('\n'));
    }

    #[tokio::test]
    async fn users_lists_everyone_and_marks_the_caller() {
        let fx = fixture();
        let (alice, mut alice_rx) = join_user(&fx, "10.0.0.1", "alice").await;
        let (_bob, _bob_rx) = join_user(&fx, "10.0.0.2", "bob").await;

        fx.handler.handle(&alice, "/users").await;
        let lines = drain(&mut alice_rx);
        // Membership broadcasts are not involved; a single listing arrives.
        assert_eq!(
            lines.last().unwrap(),
            "Online Users (2):\n  - alice (you)\n  - bob\n\n"
        );
    }

    #[tokio::test]
    async fn rooms_shows_kind_count_and_current_marker() {
        let fx = fixture();
        let (alice, mut alice_rx) = join_user(&fx, "10.0.0.1", "alice").await;

        fx.handler.handle(&alice, "/rooms").await;
        assert_eq!(
            drain(&mut alice_rx).last().unwrap(),
            "Available Rooms (1):\n  - #general [public] (1 members) (current)\n\n"
        );
    }

    #[tokio::test]
    async fn join_moves_the_caller_and_notifies_both_rooms() {
        let fx = fixture();
        let (alice, mut alice_rx) = join_user(&fx, "10.0.0.1", "alice").await;
        let (_bob, mut bob_rx) = join_user(&fx, "10.0.0.2", "bob").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        fx.handler.handle(&alice, "/join rust").await;

        assert_eq!(alice.current_room().as_deref(), Some("#rust"));
        assert!(fx.rooms.get("#rust").await.is_some());
        assert!(!fx.rooms.default_room().has_member("alice").await);

        // Bob stays behind and sees the departure.
        assert_eq!(drain(&mut bob_rx), ["*** alice left the room ***\n"]);
        // Alice gets her confirmation; the fresh room had no history.
        assert_eq!(drain(&mut alice_rx), ["*** You joined #rust ***\n"]);
    }

    #[tokio::test]
    async fn join_prepends_the_hash() {
        let fx = fixture();
        let (alice, _rx) = join_user(&fx, "10.0.0.1", "alice").await;
        fx.handler.handle(&alice, "/join rust").await;
        assert_eq!(alice.current_room().as_deref(), Some("#rust"));

        fx.handler.handle(&alice, "/join #ops").await;
        assert_eq!(alice.current_room().as_deref(), Some("#ops"));
        // The emptied private room was reaped.
        assert!(fx.rooms.get("#rust").await.is_none());
    }

    #[tokio::test]
    async fn join_replays_history_before_the_confirmation() {
        let fx = fixture();
        let (alice, _alice_rx) = join_user(&fx, "10.0.0.1", "alice").await;
        let (bob, mut bob_rx) = join_user(&fx, "10.0.0.2", "bob").await;
        fx.handler.handle(&alice, "/join rust").await;
        fx.rooms
            .get("#rust")
            .await
            .unwrap()
            .broadcast_to_all(&Message::chat("alice", "hi1"))
            .await;
        drain(&mut bob_rx);

        fx.handler.handle(&bob, "/join rust").await;
        let lines = drain(&mut bob_rx);
        assert_eq!(
            lines,
            [
                "*** --- History (last 5 min) --- ***\n",
                "*** alice joined the room ***\n",
                "[alice]: hi1\n",
                "*** ---------------------------- ***\n",
                "*** You joined #rust ***\n",
            ]
        );
    }

    #[tokio::test]
    async fn leave_from_general_is_an_error() {
        let fx = fixture();
        let (alice, mut rx) = join_user(&fx, "10.0.0.1", "alice").await;

        fx.handler.handle(&alice, "/leave").await;
        assert_eq!(
            drain(&mut rx).last().unwrap(),
            "ERROR: You are already in the default room.\n"
        );
        assert_eq!(alice.current_room().as_deref(), Some(DEFAULT_ROOM));
    }

    #[tokio::test]
    async fn leave_returns_to_general_and_reaps_the_room() {
        let fx = fixture();
        let (alice, mut alice_rx) = join_user(&fx, "10.0.0.1", "alice").await;
        let (_bob, mut bob_rx) = join_user(&fx, "10.0.0.2", "bob").await;
        fx.handler.handle(&alice, "/join rust").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        fx.handler.handle(&alice, "/leave").await;

        assert_eq!(alice.current_room().as_deref(), Some(DEFAULT_ROOM));
        assert!(fx.rooms.get("#rust").await.is_none());

        let to_alice = drain(&mut alice_rx);
        // The leaver sees its own departure (broadcast precedes removal),
        // then #general's history, then the transfer notice.
        assert_eq!(to_alice[0], "*** alice left the room ***\n");
        assert!(to_alice
            .iter()
            .any(|l| l == "*** You left #rust and returned to #general ***\n"));

        let to_bob = drain(&mut bob_rx);
        assert_eq!(to_bob.last().unwrap(), "*** alice joined the room ***\n");
    }

    #[tokio::test]
    async fn msg_delivers_pm_and_echoes_to_sender() {
        let fx = fixture();
        let (alice, mut alice_rx) = join_user(&fx, "10.0.0.1", "alice").await;
        let (_bob, mut bob_rx) = join_user(&fx, "10.0.0.2", "bob").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        fx.handler.handle(&alice, "/msg bob hi there").await;

        assert_eq!(drain(&mut bob_rx), ["[alice]: [PM] hi there\n"]);
        assert_eq!(drain(&mut alice_rx), ["[PM to bob]: hi there\n"]);
    }

    #[tokio::test]
    async fn msg_to_offline_user_is_an_error() {
        let fx = fixture();
        let (alice, mut rx) = join_user(&fx, "10.0.0.1", "alice").await;

        fx.handler.handle(&alice, "/msg carol hi").await;
        assert_eq!(
            drain(&mut rx).last().unwrap(),
            "ERROR: User 'carol' is not online.\n"
        );
    }

    #[tokio::test]
    async fn quit_says_goodbye_and_stops_the_loop() {
        let fx = fixture();
        let (alice, mut rx) = join_user(&fx, "10.0.0.1", "alice").await;

        assert_eq!(fx.handler.handle(&alice, "/quit").await, Flow::Quit);
        assert_eq!(drain(&mut rx).last().unwrap(), "*** Goodbye! ***\n");
    }

    #[tokio::test]
    async fn unknown_command_reports_and_continues() {
        let fx = fixture();
        let (alice, mut rx) = join_user(&fx, "10.0.0.1", "alice").await;

        assert_eq!(fx.handler.handle(&alice, "/dance").await, Flow::Continue);
        assert_eq!(
            drain(&mut rx).last().unwrap(),
            "ERROR: Unknown command: /dance. Type /help for available commands.\n"
        );
    }

    #[tokio::test]
    async fn join_usage_error() {
        let fx = fixture();
        let (alice, mut rx) = join_user(&fx, "10.0.0.1", "alice").await;

        fx.handler.handle(&alice, "/join").await;
        assert_eq!(drain(&mut rx).last().unwrap(), "ERROR: Usage: /join <room>\n");
        assert_eq!(alice.current_room().as_deref(), Some(DEFAULT_ROOM));
    }
}
