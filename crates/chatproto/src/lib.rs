//! `chatproto`: the wire protocol shared by the chat server and clients.
//!
//! The protocol is plain text, one message per `\n`-terminated line. This
//! crate owns the two halves of that contract:
//! - [`message`]: typed server->client messages and the single formatting
//!   authority that renders them (system frames, chat lines, errors),
//! - [`command`]: the client->server `/command` grammar.
//!
//! Formatting is bit-exact by design; clients key their rendering off these
//! line shapes.

pub mod command;
pub mod message;

pub use command::Command;
pub use message::Message;

/// The default public room. Exists for the whole process lifetime.
pub const DEFAULT_ROOM: &str = "#general";

/// Maximum chat message length in bytes. Longer lines are rejected with an
/// error, not truncated.
pub const MAX_MESSAGE_LENGTH: usize = 1024;

/// Default username length bounds (overridable via configuration).
pub const MIN_USERNAME_LENGTH: usize = 3;
pub const MAX_USERNAME_LENGTH: usize = 16;
