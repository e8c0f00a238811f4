use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::OnceLock;

use anyhow::Context;
use chatio::LineReader;
use chatproto::{Message, DEFAULT_ROOM};
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::email::EmailSender;
use crate::handler::{CommandHandler, Flow};
use crate::otp::OtpService;
use crate::room::RoomManager;
use crate::router::Router;
use crate::session::{AuthState, Session, SessionManager};

/// Per-connection outbound queue depth. A peer that stops reading stalls
/// only broadcasts addressed to it once this fills.
const WRITE_QUEUE_DEPTH: usize = 128;

pub struct ChatServer {
    sessions: Arc<SessionManager>,
    rooms: Arc<RoomManager>,
    otp: Arc<OtpService>,
    email: EmailSender,
    router: Router,
}

impl ChatServer {
    pub fn new(
        sessions: Arc<SessionManager>,
        rooms: Arc<RoomManager>,
        otp: Arc<OtpService>,
        email: EmailSender,
    ) -> Arc<Self> {
        let handler = CommandHandler::new(Arc::clone(&sessions), Arc::clone(&rooms));
        let router = Router::new(Arc::clone(&rooms), handler);
        Arc::new(Self {
            sessions,
            rooms,
            otp,
            email,
            router,
        })
    }

    /// Accept loop. Runs until the listener errors (it is closed on
    /// shutdown); each connection gets its own task.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr().context("listener address")?, "chat server listening");

        loop {
            let (stream, peer) = listener.accept().await.context("accept")?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_conn(stream, peer).await {
                    warn!(peer = %peer, err = %e, "connection ended with error");
                }
            });
        }
    }

    async fn handle_conn(&self, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        let ip = peer.ip().to_string();
        info!(ip = %ip, "new connection");

        let (rd, mut wr) = stream.into_split();
        let (write_tx, mut write_rx) = mpsc::channel::<String>(WRITE_QUEUE_DEPTH);
        let writer = tokio::spawn(async move {
            while let Some(line) = write_rx.recv().await {
                if wr.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
        let mut reader = LineReader::new(rd);

        let session = match self.sessions.admit(&ip, write_tx.clone()).await {
            Ok(session) => session,
            Err(e) => {
                info!(ip = %ip, err = %e, "connection rejected");
                let _ = write_tx.send(Message::error(e.to_string()).format()).await;
                drop(write_tx);
                let _ = writer.await;
                return Ok(());
            }
        };
        drop(write_tx);

        let result = self.serve(&session, &mut reader).await;
        self.cleanup(&session).await;

        // The session holds the last sender; dropping it lets the writer
        // drain the queue and exit.
        drop(session);
        let _ = writer.await;
        result
    }

    /// Welcome, authenticate, land in `#general`, then pump lines until the
    /// client quits or the socket goes away.
    async fn serve(
        &self,
        session: &Arc<Session>,
        reader: &mut LineReader<OwnedReadHalf>,
    ) -> anyhow::Result<()> {
        let _ = session
            .send(Message::system("Welcome to TCP Chat Server!").format())
            .await;
        let _ = session
            .send(Message::system("Please enter your email and authenticate to continue").format())
            .await;

        if let Err(e) = self.authenticate(session, reader).await {
            let _ = session
                .send(Message::error(format!("Authentication failed: {e}")).format())
                .await;
            info!(ip = %session.ip(), err = %e, "authentication failed");
            return Ok(());
        }

        let username = session.username().unwrap_or_default();

        let default = self.rooms.default_room();
        default.add_member(Arc::clone(session)).await;
        session.set_current_room(Some(DEFAULT_ROOM.to_string()));

        let _ = session
            .send(Message::system(format!("You joined {DEFAULT_ROOM}")).format())
            .await;
        let _ = session
            .send(Message::system("Type /help for available commands.").format())
            .await;
        default
            .broadcast(
                &Message::system(format!("{username} joined the room")),
                &username,
            )
            .await;

        info!(user = %username, ip = %session.ip(), "user authenticated");

        loop {
            let line = match reader.read_line_utf8().await {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(()),
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::UnexpectedEof {
                        warn!(user = %username, err = %e, "read error");
                    }
                    return Ok(());
                }
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if self.router.route(session, line).await == Flow::Quit {
                return Ok(());
            }
        }
    }

    /// The linear auth script: email -> OTP -> username. Every failure is
    /// terminal for the connection; the caller reports it.
    async fn authenticate(
        &self,
        session: &Arc<Session>,
        reader: &mut LineReader<OwnedReadHalf>,
    ) -> anyhow::Result<()> {
        let _ = session.send("\nEnter your email address: ").await;
        let email = read_auth_line(reader).await?;
        if !is_valid_email(&email) {
            anyhow::bail!("invalid email address");
        }
        session.set_email(Some(email.clone()));

        let code = self
            .otp
            .generate(&email)
            .await
            .context("failed to generate OTP")?;
        if let Err(e) = self.email.send_otp(&email, &code).await {
            // Roll the code back; a fresh attempt starts from scratch.
            self.otp.clear(&email).await;
            return Err(e.context("failed to send OTP"));
        }
        session.set_auth_state(AuthState::AwaitingOtp);
        let _ = session
            .send(Message::system("OTP sent to your email. Please check your inbox.").format())
            .await;

        let _ = session.send("\nEnter OTP code: ").await;
        let submitted = read_auth_line(reader).await?;
        self.otp.validate(&email, &submitted).await?;

        let _ = session
            .send("\nEnter username (3-16 characters, alphanumeric + underscore): ")
            .await;
        let username = read_auth_line(reader).await?;
        self.sessions.validate_username(&username)?;
        self.sessions.register_username(session, &username).await?;
        session.set_auth_state(AuthState::Authenticated);
        Ok(())
    }

    /// Tear down a session however the connection ended. Safe to reach from
    /// any point of the lifecycle, including before a username existed.
    async fn cleanup(&self, session: &Arc<Session>) {
        let username = session.username();

        if let Some(current) = session.current_room() {
            self.rooms.leave(session).await;
            if let Some(room) = self.rooms.get(&current).await {
                if let Some(name) = &username {
                    room.broadcast(&Message::system(format!("{name} left the room")), "")
                        .await;
                }
            }
        }

        self.sessions.remove(session).await;

        match username {
            Some(name) => info!(user = %name, ip = %session.ip(), "user disconnected"),
            None => info!(ip = %session.ip(), "connection closed"),
        }
    }
}

async fn read_auth_line(reader: &mut LineReader<OwnedReadHalf>) -> anyhow::Result<String> {
    match reader.read_line_utf8().await? {
        Some(line) => Ok(line.trim().to_string()),
        None => anyhow::bail!("connection closed"),
    }
}

fn is_valid_email(email: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}$").expect("email regex")
    })
    .is_match(email)
}
