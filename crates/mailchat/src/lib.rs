//! `mailchat`: a line-oriented, multi-room TCP chat server with email-OTP
//! authentication.
//!
//! Clients are dumb line terminals. A connection walks a linear script
//! (email -> OTP -> username), lands in `#general`, and from there every
//! inbound line is either a `/command` or a chat broadcast to the current
//! room. Nothing persists across restarts.

pub mod config;
pub mod email;
pub mod handler;
pub mod otp;
pub mod room;
pub mod router;
pub mod server;
pub mod session;
