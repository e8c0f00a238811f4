/// A parsed `/command` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Users,
    Rooms,
    Join(String),
    Leave,
    Msg { to: String, text: String },
    Quit,
}

/// Parse a line that starts with `/`.
///
/// The verb is case-insensitive; arguments split on ASCII whitespace, and the
/// `/msg` text re-joins the tail with single spaces (runs of whitespace
/// collapse). The `Err` string is the exact text shown to the user.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut parts = line.split_whitespace();
    let verb = parts.next().unwrap_or("").to_ascii_lowercase();

    match verb.as_str() {
        "/help" => Ok(Command::Help),
        "/users" => Ok(Command::Users),
        "/rooms" => Ok(Command::Rooms),
        "/join" => {
            let room = parts
                .next()
                .ok_or_else(|| "Usage: /join <room>".to_string())?;
            Ok(Command::Join(room.to_string()))
        }
        "/leave" => Ok(Command::Leave),
        "/msg" => {
            let to = parts
                .next()
                .ok_or_else(|| "Usage: /msg <username> <message>".to_string())?;
            let text = parts.collect::<Vec<_>>().join(" ");
            if text.is_empty() {
                return Err("Usage: /msg <username> <message>".to_string());
            }
            Ok(Command::Msg {
                to: to.to_string(),
                text,
            })
        }
        "/quit" => Ok(Command::Quit),
        _ => Err(format!(
            "Unknown command: {verb}. Type /help for available commands."
        )),
    }
}
