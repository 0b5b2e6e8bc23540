//! Error types shared by the session, the dispatcher and handlers

use std::fmt;
use std::io;

use thiserror::Error;

/// Boxed error returned by handlers and kept as the session's internal error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type every phase handler returns.
pub type HandlerResult = Result<(), BoxError>;

/// Message shown to the peer when a handler fails without choosing its own.
pub const GENERIC_CLIENT_MESSAGE: &str = "Something went wrong";

/// Message shown to the peer for commands arriving after the session ended.
pub const SESSION_ENDED_MESSAGE: &str = "Session has ended";

#[derive(Error, Debug)]
pub enum UsemailError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid phase: {0}")]
    InvalidPhase(String),

    #[error("Handler for phase '{handler}' cannot be registered for phase '{phase}'")]
    PhaseMismatch {
        phase: &'static str,
        handler: &'static str,
    },

    #[error("Phase '{to}' cannot follow phase '{from}'")]
    PhaseRegression {
        from: &'static str,
        to: &'static str,
    },

    #[error("Session has already ended")]
    SessionEnded,
}

/// The part of a failure the remote peer is allowed to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientError {
    code: Option<u16>,
    message: String,
}

impl ClientError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Attach an SMTP reply code; the protocol engine picks one otherwise.
    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn generic() -> Self {
        Self::new(GENERIC_CLIENT_MESSAGE)
    }

    pub fn code(&self) -> Option<u16> {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{code} {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ClientError {}

/// How a failure is presented to the peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ClientReply {
    /// The fixed generic message.
    #[default]
    Generic,
    /// This message, verbatim.
    Message(ClientError),
    /// The internal error's own text.
    Expose,
}

impl From<ClientError> for ClientReply {
    fn from(err: ClientError) -> Self {
        ClientReply::Message(err)
    }
}

/// A handler failure that carries an explicit client-visible reply.
///
/// Returning any other error from a handler counts as an unflagged fault and
/// the peer only sees [`GENERIC_CLIENT_MESSAGE`].
#[derive(Error, Debug)]
#[error("{source}")]
pub struct Rejection {
    source: BoxError,
    reply: ClientReply,
}

impl Rejection {
    /// Reject with `message` shown to the peer; `err` stays internal.
    pub fn new(err: impl Into<BoxError>, message: impl Into<String>) -> Self {
        Self {
            source: err.into(),
            reply: ClientReply::Message(ClientError::new(message)),
        }
    }

    /// Reject with a fully specified client error.
    pub fn with_client_error(err: impl Into<BoxError>, client: ClientError) -> Self {
        Self {
            source: err.into(),
            reply: ClientReply::Message(client),
        }
    }

    /// Reject and show the internal error to the peer as is.
    pub fn expose(err: impl Into<BoxError>) -> Self {
        Self {
            source: err.into(),
            reply: ClientReply::Expose,
        }
    }

    /// Plain text rejection, used both internally and as the peer message.
    pub fn message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            source: message.clone().into(),
            reply: ClientReply::Message(ClientError::new(message)),
        }
    }

    pub fn reply(&self) -> &ClientReply {
        &self.reply
    }

    pub fn into_parts(self) -> (BoxError, ClientReply) {
        (self.source, self.reply)
    }
}

/// Split a handler error into its internal part and the requested reply.
pub(crate) fn classify(err: BoxError) -> (BoxError, ClientReply) {
    match err.downcast::<Rejection>() {
        Ok(rejection) => rejection.into_parts(),
        Err(err) => (err, ClientReply::Generic),
    }
}
