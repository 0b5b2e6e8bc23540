//! Ordered handler chains, one per phase

use std::fmt;
use std::io::Read;

use crate::error::{HandlerResult, UsemailError};
use crate::session::{Phase, Session};

pub type ConnectFn = Box<dyn Fn(&mut Session) -> HandlerResult + Send + Sync>;
pub type AddressFn = Box<dyn Fn(&str, &mut Session) -> HandlerResult + Send + Sync>;
pub type DataFn = Box<dyn Fn(&mut Session, &mut dyn Read) -> HandlerResult + Send + Sync>;

/// A handler together with the phase signature it was written for
pub enum Handler {
    /// Runs when the connection opens
    Connect(ConnectFn),
    /// Receives the candidate sender address
    From(AddressFn),
    /// Receives the candidate recipient address
    To(AddressFn),
    /// Receives the message body stream
    Use(DataFn),
}

impl Handler {
    pub fn connect<F>(f: F) -> Self
    where
        F: Fn(&mut Session) -> HandlerResult + Send + Sync + 'static,
    {
        Handler::Connect(Box::new(f))
    }

    pub fn sender<F>(f: F) -> Self
    where
        F: Fn(&str, &mut Session) -> HandlerResult + Send + Sync + 'static,
    {
        Handler::From(Box::new(f))
    }

    pub fn recipient<F>(f: F) -> Self
    where
        F: Fn(&str, &mut Session) -> HandlerResult + Send + Sync + 'static,
    {
        Handler::To(Box::new(f))
    }

    pub fn data<F>(f: F) -> Self
    where
        F: Fn(&mut Session, &mut dyn Read) -> HandlerResult + Send + Sync + 'static,
    {
        Handler::Use(Box::new(f))
    }

    /// Phase whose signature this handler has
    pub fn phase(&self) -> Phase {
        match self {
            Handler::Connect(_) => Phase::Connect,
            Handler::From(_) => Phase::From,
            Handler::To(_) => Phase::To,
            Handler::Use(_) => Phase::Use,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler({})", self.phase())
    }
}

/// Append-only handler lists
#[derive(Default)]
pub struct HandlerRegistry {
    pub(crate) connect: Vec<ConnectFn>,
    pub(crate) from: Vec<AddressFn>,
    pub(crate) to: Vec<AddressFn>,
    pub(crate) data: Vec<DataFn>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to the chain of the phase called `phase`.
    ///
    /// `data` is accepted as a name for `use`. The handler's signature has to
    /// match the phase, and `done` takes no handlers.
    pub fn register(&mut self, phase: &str, handler: Handler) -> Result<(), UsemailError> {
        let phase: Phase = phase.parse()?;
        if phase != handler.phase() {
            return Err(UsemailError::PhaseMismatch {
                phase: phase.as_str(),
                handler: handler.phase().as_str(),
            });
        }
        self.push(handler);
        Ok(())
    }

    pub fn push(&mut self, handler: Handler) {
        match handler {
            Handler::Connect(f) => self.connect.push(f),
            Handler::From(f) => self.from.push(f),
            Handler::To(f) => self.to.push(f),
            Handler::Use(f) => self.data.push(f),
        }
    }

    /// Number of handlers registered for `phase`
    pub fn len(&self, phase: Phase) -> usize {
        match phase {
            Phase::Connect => self.connect.len(),
            Phase::From => self.from.len(),
            Phase::To => self.to.len(),
            Phase::Use => self.data.len(),
            Phase::Done => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        Phase::ALL.iter().all(|phase| self.len(*phase) == 0)
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("connect", &self.connect.len())
            .field("from", &self.from.len())
            .field("to", &self.to.len())
            .field("use", &self.data.len())
            .finish()
    }
}
