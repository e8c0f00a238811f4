use std::fmt;

/// A server->client message, prior to wire rendering.
///
/// `Private` carries the recipient for routing purposes; on the wire it is
/// indistinguishable from a `Chat` line from the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Framed notification: joins, leaves, server banners.
    System { content: String },
    /// A chat line. An empty `from` renders as bare content.
    Chat { from: String, content: String },
    /// A private message, rendered like chat from the sender.
    Private {
        from: String,
        to: String,
        content: String,
    },
    /// An error surfaced to exactly one client.
    Error { content: String },
    /// Free-form command response (help text, listings, PM echoes).
    Command { content: String },
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message::System {
            content: content.into(),
        }
    }

    pub fn chat(from: impl Into<String>, content: impl Into<String>) -> Self {
        Message::Chat {
            from: from.into(),
            content: content.into(),
        }
    }

    pub fn private(
        from: impl Into<String>,
        to: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Message::Private {
            from: from.into(),
            to: to.into(),
            content: content.into(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Message::Error {
            content: content.into(),
        }
    }

    pub fn command(content: impl Into<String>) -> Self {
        Message::Command {
            content: content.into(),
        }
    }

    /// Render to a single wire line ending in `\n`.
    ///
    /// This is the only formatting authority in the system: rooms store and
    /// replay these exact bytes, so the rendering must stay stable.
    pub fn format(&self) -> String {
        match self {
            Message::System { content } => format!("*** {content} ***\n"),
            Message::Chat { from, content } => {
                if from.is_empty() {
                    format!("{content}\n")
                } else {
                    format!("[{from}]: {content}\n")
                }
            }
            Message::Private { from, content, .. } => format!("[{from}]: {content}\n"),
            Message::Error { content } => format!("ERROR: {content}\n"),
            Message::Command { content } => format!("{content}\n"),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}
