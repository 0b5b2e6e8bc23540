//! Per-connection session state

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::{BoxError, ClientError, ClientReply, UsemailError};

/// Stage of one SMTP transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Connection opened, nothing received yet
    Connect,
    /// MAIL FROM being processed
    From,
    /// RCPT TO being processed, once per recipient
    To,
    /// Message body being processed
    Use,
    /// Session finished; terminal
    Done,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Connect,
        Phase::From,
        Phase::To,
        Phase::Use,
        Phase::Done,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Connect => "connect",
            Phase::From => "from",
            Phase::To => "to",
            Phase::Use => "use",
            Phase::Done => "done",
        }
    }
}

impl FromStr for Phase {
    type Err = UsemailError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connect" => Ok(Phase::Connect),
            "from" => Ok(Phase::From),
            "to" => Ok(Phase::To),
            "use" | "data" => Ok(Phase::Use),
            "done" => Ok(Phase::Done),
            other => Err(UsemailError::InvalidPhase(other.to_owned())),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sender and accepted recipients, as recorded by the dispatcher
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Accepted MAIL FROM address
    pub mail_from: Option<String>,
    /// Accepted RCPT TO addresses, in order
    pub rcpt_to: Vec<String>,
}

/// Credential that owns a key in the session data store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u64);

impl Token {
    /// A fresh random token
    pub fn generate() -> Self {
        Self(rand::random())
    }
}

impl From<u64> for Token {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

struct Entry {
    value: Box<dyn Any + Send + Sync>,
    owner: Option<Token>,
}

/// State of one connection, shared by every phase of its transaction
///
/// Handlers receive `&mut Session`. The envelope and the phase are read-only
/// to them; data goes through the token guarded store.
pub struct Session {
    id: String,
    remote_address: Option<SocketAddr>,
    remote_host: Option<String>,
    transmission_type: &'static str,
    phase: Phase,
    envelope: Envelope,
    data: HashMap<String, Entry>,
    client_error: Option<ClientError>,
    server_error: Option<BoxError>,
    notified: bool,
}

impl Session {
    pub fn new(remote_address: Option<SocketAddr>) -> Self {
        Self {
            id: format!("{:016x}", rand::random::<u64>()),
            remote_address,
            remote_host: None,
            transmission_type: "SMTP",
            phase: Phase::Connect,
            envelope: Envelope::default(),
            data: HashMap::new(),
            client_error: None,
            server_error: None,
            notified: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_address
    }

    /// Name the client announced in HELO/EHLO
    pub fn remote_host(&self) -> Option<&str> {
        self.remote_host.as_deref()
    }

    pub fn transmission_type(&self) -> &str {
        self.transmission_type
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Accepted sender address
    pub fn from(&self) -> Option<&str> {
        self.envelope.mail_from.as_deref()
    }

    /// Accepted recipient addresses
    pub fn to(&self) -> &[String] {
        &self.envelope.rcpt_to
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    pub fn client_error(&self) -> Option<&ClientError> {
        self.client_error.as_ref()
    }

    pub fn server_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.server_error.as_deref()
    }

    pub fn has(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Value stored under `key`, if present and of type `T`
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.data.get(key)?.value.downcast_ref()
    }

    /// Write to an unclaimed key. Dropped if the key has an owner.
    pub fn set<T>(&mut self, key: &str, value: T) -> bool
    where
        T: Any + Send + Sync,
    {
        match self.data.get(key) {
            Some(entry) if entry.owner.is_some() => false,
            _ => {
                self.store(key, value, None);
                true
            }
        }
    }

    /// Write guarded by `token`: claims an unclaimed key, updates a key owned
    /// by the same token, and drops anything else.
    pub fn set_with<T>(&mut self, key: &str, value: T, token: &Token) -> bool
    where
        T: Any + Send + Sync,
    {
        match self.data.get(key).and_then(|entry| entry.owner) {
            Some(owner) if owner != *token => false,
            _ => {
                self.store(key, value, Some(*token));
                true
            }
        }
    }

    /// Claim an unclaimed key with a freshly generated token.
    ///
    /// Returns the token later writers must present, or `None` if the key is
    /// already owned.
    pub fn claim<T>(&mut self, key: &str, value: T) -> Option<Token>
    where
        T: Any + Send + Sync,
    {
        if self.data.get(key).is_some_and(|entry| entry.owner.is_some()) {
            return None;
        }
        let token = Token::generate();
        self.store(key, value, Some(token));
        Some(token)
    }

    fn store<T>(&mut self, key: &str, value: T, owner: Option<Token>)
    where
        T: Any + Send + Sync,
    {
        self.data.insert(
            key.to_owned(),
            Entry {
                value: Box::new(value),
                owner,
            },
        );
    }

    /// Record a failure for the current command.
    ///
    /// The first failure of a command wins; later calls before the next
    /// command, or after the session ended, change nothing.
    pub fn fail(&mut self, err: impl Into<BoxError>, reply: impl Into<ClientReply>) {
        if self.is_done() || self.client_error.is_some() {
            return;
        }
        let err = err.into();
        self.client_error = Some(match reply.into() {
            ClientReply::Generic => ClientError::generic(),
            ClientReply::Message(client) => client,
            ClientReply::Expose => ClientError::new(err.to_string()),
        });
        self.server_error = Some(err);
    }

    /// Finish the session. Later calls are no-ops.
    pub fn end(&mut self) {
        self.phase = Phase::Done;
    }

    /// Record a failure, then finish the session.
    pub fn end_with(&mut self, err: impl Into<BoxError>, reply: impl Into<ClientReply>) {
        self.fail(err, reply);
        self.end();
    }

    /// Set the phase by name. `data` is accepted for `use`.
    pub fn set_phase(&mut self, name: &str) -> Result<(), UsemailError> {
        let phase = name.parse()?;
        self.advance(phase)
    }

    /// Move to `phase`. Re-entering the current phase is allowed; nothing leaves `done`.
    pub(crate) fn advance(&mut self, phase: Phase) -> Result<(), UsemailError> {
        if self.is_done() {
            return Err(UsemailError::SessionEnded);
        }
        if phase < self.phase {
            return Err(UsemailError::PhaseRegression {
                from: self.phase.as_str(),
                to: phase.as_str(),
            });
        }
        self.phase = phase;
        Ok(())
    }

    /// Forget the previous command's client error.
    pub(crate) fn clear_client_error(&mut self) {
        if !self.is_done() {
            self.client_error = None;
        }
    }

    pub(crate) fn set_remote_host(&mut self, host: &str, extended: bool) {
        self.remote_host = Some(host.to_owned());
        self.transmission_type = if extended { "ESMTP" } else { "SMTP" };
    }

    pub(crate) fn accept_sender(&mut self, address: &str) {
        self.envelope.mail_from = Some(address.to_owned());
    }

    pub(crate) fn accept_recipient(&mut self, address: &str) {
        self.envelope.rcpt_to.push(address.to_owned());
    }

    /// Marks the terminal notification as delivered; true only the first time.
    pub(crate) fn take_end_notification(&mut self) -> bool {
        if !self.is_done() || self.notified {
            return false;
        }
        self.notified = true;
        true
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote_address", &self.remote_address)
            .field("phase", &self.phase)
            .field("envelope", &self.envelope)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .field("client_error", &self.client_error)
            .field("server_error", &self.server_error)
            .finish()
    }
}
