//! `chatio`: line-framing IO for dumb terminal clients.
//!
//! Chat clients are plain line terminals (telnet, netcat), so the only
//! framing the server needs is newline-delimited text with tolerance for
//! `\r\n` endings. This crate implements exactly that without pulling in
//! tokio-util's codecs: a buffered reader that pops one line at a time via
//! `BytesMut::split_to(..).freeze()`.

pub mod line;

pub use line::LineReader;
