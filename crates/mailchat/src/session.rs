use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::RwLock as AsyncRwLock;

/// Authentication progress of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    Unauthenticated,
    AwaitingOtp,
    Authenticated,
}

#[derive(Debug, Default)]
struct SessionFields {
    email: Option<String>,
    username: Option<String>,
    auth_state: AuthState,
    current_room: Option<String>,
    private_chat_with: Option<String>,
}

/// One connected client.
///
/// The connection handler owns the read side; everyone else (rooms, peers
/// sending PMs) only ever talks to the bounded write channel, whose writer
/// task serializes the actual socket writes. Field access goes through
/// individually-atomic getters/setters; no cross-field atomicity is assumed.
pub struct Session {
    ip: String,
    write_tx: mpsc::Sender<String>,
    fields: RwLock<SessionFields>,
}

impl Session {
    fn new(ip: String, write_tx: mpsc::Sender<String>) -> Arc<Self> {
        Arc::new(Self {
            ip,
            write_tx,
            fields: RwLock::new(SessionFields::default()),
        })
    }

    /// The admission key. Immutable for the session's lifetime.
    pub fn ip(&self) -> &str {
        &self.ip
    }

    /// Queue one wire line for this client. Fails only once the connection's
    /// writer is gone; callers fanning out to many peers ignore the error.
    pub async fn send(&self, line: impl Into<String>) -> anyhow::Result<()> {
        self.write_tx
            .send(line.into())
            .await
            .map_err(|_| anyhow::anyhow!("connection closed"))
    }

    pub fn email(&self) -> Option<String> {
        self.fields.read().email.clone()
    }

    pub fn set_email(&self, email: Option<String>) {
        self.fields.write().email = email;
    }

    pub fn username(&self) -> Option<String> {
        self.fields.read().username.clone()
    }

    fn set_username(&self, username: String) {
        self.fields.write().username = Some(username);
    }

    pub fn auth_state(&self) -> AuthState {
        self.fields.read().auth_state
    }

    pub fn set_auth_state(&self, state: AuthState) {
        self.fields.write().auth_state = state;
    }

    pub fn current_room(&self) -> Option<String> {
        self.fields.read().current_room.clone()
    }

    pub fn set_current_room(&self, room: Option<String>) {
        self.fields.write().current_room = room;
    }

    pub fn private_chat_with(&self) -> Option<String> {
        self.fields.read().private_chat_with.clone()
    }

    pub fn set_private_chat_with(&self, username: Option<String>) {
        self.fields.write().private_chat_with = username;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fields = self.fields.read();
        f.debug_struct("Session")
            .field("ip", &self.ip)
            .field("username", &fields.username)
            .field("auth_state", &fields.auth_state)
            .field("current_room", &fields.current_room)
            .finish()
    }
}

#[derive(Default)]
struct Registry {
    by_ip: HashMap<String, Arc<Session>>,
    by_username: HashMap<String, Arc<Session>>,
}

/// Process-wide session registry.
///
/// Two unique indexes under one guard: at most one session per client IP,
/// at most one per username, and a username entry always shadows an IP
/// entry for the same session.
pub struct SessionManager {
    registry: AsyncRwLock<Registry>,
    username_min_len: usize,
    username_max_len: usize,
}

impl SessionManager {
    pub fn new(username_min_len: usize, username_max_len: usize) -> Arc<Self> {
        Arc::new(Self {
            registry: AsyncRwLock::new(Registry::default()),
            username_min_len,
            username_max_len,
        })
    }

    /// Admit a new connection, enforcing one connection per IP. On success
    /// the returned session is already indexed; every exit path afterwards
    /// must go through [`remove`](Self::remove).
    pub async fn admit(
        &self,
        ip: &str,
        write_tx: mpsc::Sender<String>,
    ) -> anyhow::Result<Arc<Session>> {
        let mut reg = self.registry.write().await;
        if reg.by_ip.contains_key(ip) {
            anyhow::bail!("IP address {ip} already has an active connection");
        }
        let session = Session::new(ip.to_string(), write_tx);
        reg.by_ip.insert(ip.to_string(), Arc::clone(&session));
        Ok(session)
    }

    /// Length bounds plus `[A-Za-z0-9_]+`. The error text is user-visible.
    pub fn validate_username(&self, username: &str) -> anyhow::Result<()> {
        if username.len() < self.username_min_len {
            anyhow::bail!(
                "username must be at least {} characters",
                self.username_min_len
            );
        }
        if username.len() > self.username_max_len {
            anyhow::bail!(
                "username must be at most {} characters",
                self.username_max_len
            );
        }
        if !username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            anyhow::bail!("username can only contain letters, numbers, and underscores");
        }
        Ok(())
    }

    /// Claim `username` for `session`. The name is only published if it is
    /// uncontested; callers validate first.
    pub async fn register_username(
        &self,
        session: &Arc<Session>,
        username: &str,
    ) -> anyhow::Result<()> {
        let mut reg = self.registry.write().await;
        if reg.by_username.contains_key(username) {
            anyhow::bail!("username '{username}' is already taken");
        }
        reg.by_username
            .insert(username.to_string(), Arc::clone(session));
        session.set_username(username.to_string());
        Ok(())
    }

    /// Free both index slots. Idempotent; safe for sessions that never got a
    /// username.
    pub async fn remove(&self, session: &Session) {
        let mut reg = self.registry.write().await;
        reg.by_ip.remove(session.ip());
        if let Some(username) = session.username() {
            reg.by_username.remove(&username);
        }
    }

    pub async fn by_ip(&self, ip: &str) -> Option<Arc<Session>> {
        self.registry.read().await.by_ip.get(ip).cloned()
    }

    pub async fn by_username(&self, username: &str) -> Option<Arc<Session>> {
        self.registry.read().await.by_username.get(username).cloned()
    }

    pub async fn all(&self) -> Vec<Arc<Session>> {
        self.registry.read().await.by_ip.values().cloned().collect()
    }

    pub async fn authenticated(&self) -> Vec<Arc<Session>> {
        self.registry
            .read()
            .await
            .by_ip
            .values()
            .filter(|s| s.auth_state() == AuthState::Authenticated)
            .cloned()
            .collect()
    }

    pub async fn online_usernames(&self) -> Vec<String> {
        self.registry
            .read()
            .await
            .by_username
            .keys()
            .cloned()
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.registry.read().await.by_ip.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<SessionManager> {
        SessionManager::new(3, 16)
    }

    fn tx() -> mpsc::Sender<String> {
        mpsc::channel(8).0
    }

    #[tokio::test]
    async fn one_session_per_ip() {
        let mgr = manager();
        let first = mgr.admit("10.0.0.1", tx()).await.unwrap();
        assert_eq!(first.ip(), "10.0.0.1");
        assert_eq!(mgr.count().await, 1);

        let err = mgr.admit("10.0.0.1", tx()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "IP address 10.0.0.1 already has an active connection"
        );
        assert_eq!(mgr.count().await, 1);

        mgr.remove(&first).await;
        assert_eq!(mgr.count().await, 0);
        mgr.admit("10.0.0.1", tx()).await.unwrap();
    }

    #[tokio::test]
    async fn usernames_are_unique() {
        let mgr = manager();
        let a = mgr.admit("10.0.0.1", tx()).await.unwrap();
        let b = mgr.admit("10.0.0.2", tx()).await.unwrap();

        mgr.register_username(&a, "alice").await.unwrap();
        let err = mgr.register_username(&b, "alice").await.unwrap_err();
        assert_eq!(err.to_string(), "username 'alice' is already taken");
        assert_eq!(b.username(), None);

        mgr.register_username(&b, "bob").await.unwrap();
        let mut online = mgr.online_usernames().await;
        online.sort();
        assert_eq!(online, ["alice", "bob"]);
        assert!(mgr.by_username("alice").await.is_some());
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_frees_both_slots() {
        let mgr = manager();
        let a = mgr.admit("10.0.0.1", tx()).await.unwrap();
        mgr.register_username(&a, "alice").await.unwrap();

        mgr.remove(&a).await;
        mgr.remove(&a).await;
        assert_eq!(mgr.count().await, 0);
        assert!(mgr.by_username("alice").await.is_none());
        assert!(mgr.by_ip("10.0.0.1").await.is_none());

        // Both the IP and the username are reusable.
        let b = mgr.admit("10.0.0.1", tx()).await.unwrap();
        mgr.register_username(&b, "alice").await.unwrap();
    }

    #[tokio::test]
    async fn username_validation_rules() {
        let mgr = manager();
        assert!(mgr.validate_username("ab").is_err());
        assert!(mgr.validate_username("a_very_long_username").is_err());
        assert!(mgr.validate_username("has space").is_err());
        assert!(mgr.validate_username("héllo").is_err());
        assert!(mgr.validate_username("abc").is_ok());
        assert!(mgr.validate_username("Alice_42").is_ok());

        assert_eq!(
            mgr.validate_username("ab").unwrap_err().to_string(),
            "username must be at least 3 characters"
        );
        assert_eq!(
            mgr.validate_username("x".repeat(17).as_str())
                .unwrap_err()
                .to_string(),
            "username must be at most 16 characters"
        );
    }

    #[tokio::test]
    async fn authenticated_filter() {
        let mgr = manager();
        let a = mgr.admit("10.0.0.1", tx()).await.unwrap();
        let _b = mgr.admit("10.0.0.2", tx()).await.unwrap();

        mgr.register_username(&a, "alice").await.unwrap();
        a.set_auth_state(AuthState::Authenticated);

        let authed = mgr.authenticated().await;
        assert_eq!(authed.len(), 1);
        assert_eq!(authed[0].username().as_deref(), Some("alice"));
        assert_eq!(mgr.all().await.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_admits_for_one_ip_yield_one_session() {
        let mgr = manager();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let mgr = Arc::clone(&mgr);
            handles.push(tokio::spawn(
                async move { mgr.admit("10.0.0.1", tx()).await },
            ));
        }

        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(mgr.count().await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_registrations_of_one_name_yield_one_owner() {
        let mgr = manager();
        let mut handles = Vec::new();
        for i in 0..16 {
            let mgr = Arc::clone(&mgr);
            handles.push(tokio::spawn(async move {
                let s = mgr.admit(&format!("10.0.0.{i}"), tx()).await.unwrap();
                mgr.register_username(&s, "alice").await.is_ok()
            }));
        }

        let mut registered = 0;
        for h in handles {
            if h.await.unwrap() {
                registered += 1;
            }
        }
        assert_eq!(registered, 1);
        assert_eq!(mgr.online_usernames().await, ["alice"]);
    }

    #[tokio::test]
    async fn send_fails_once_the_writer_is_gone() {
        let (tx, rx) = mpsc::channel(8);
        let mgr = manager();
        let s = mgr.admit("10.0.0.1", tx).await.unwrap();

        s.send("hello\n").await.unwrap();
        drop(rx);
        assert!(s.send("dead\n").await.is_err());
    }
}
