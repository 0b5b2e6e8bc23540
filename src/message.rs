//! Message parsing adapter for the data phase

use std::io::Read;
use std::time::SystemTime;

use crate::error::HandlerResult;
use crate::handlers::Handler;
use crate::session::Session;

/// Session key under which [`parser`] stores the parsed message
pub const MESSAGE_KEY: &str = "message";

/// A received message split into header fields and body
#[derive(Debug, Clone)]
pub struct Message {
    /// Header fields in order of appearance, folded lines joined
    pub headers: Vec<(String, String)>,

    /// Everything after the first empty line
    pub body: String,

    /// When the body was read
    pub timestamp: SystemTime,
}

impl Message {
    /// Split raw message text at the first empty line
    pub fn parse(raw: &str) -> Self {
        let mut headers: Vec<(String, String)> = Vec::new();
        let mut body = String::new();
        let mut lines = raw.split_inclusive('\n');

        for line in lines.by_ref() {
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                // End of headers
                break;
            }
            if trimmed.starts_with([' ', '\t']) {
                if let Some((_, value)) = headers.last_mut() {
                    value.push(' ');
                    value.push_str(trimmed.trim());
                }
                continue;
            }
            match trimmed.split_once(':') {
                Some((name, value)) => {
                    headers.push((name.trim().to_owned(), value.trim().to_owned()));
                }
                None => {
                    // Not a header block at all
                    body.push_str(line);
                    break;
                }
            }
        }
        body.extend(lines);

        Self {
            headers,
            body,
            timestamp: SystemTime::now(),
        }
    }

    /// First value of the header `name`, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn subject(&self) -> Option<&str> {
        self.header("Subject")
    }

    /// Check if the body contains `text`
    pub fn contains_text(&self, text: &str) -> bool {
        self.body.contains(text)
    }
}

/// Data handler that reads the whole body and stores a [`Message`] in the
/// session under [`MESSAGE_KEY`].
///
/// Later data handlers find the stream already consumed and should read the
/// parsed message from the session instead.
pub fn parser() -> Handler {
    Handler::data(parse_into_session)
}

fn parse_into_session(session: &mut Session, body: &mut dyn Read) -> HandlerResult {
    let mut raw = Vec::new();
    body.read_to_end(&mut raw)?;
    let message = Message::parse(&String::from_utf8_lossy(&raw));
    session.set(MESSAGE_KEY, message);
    Ok(())
}
