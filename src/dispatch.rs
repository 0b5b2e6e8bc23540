//! Phase dispatcher: runs handler chains for protocol events

use std::any::Any;
use std::fmt;
use std::io::{self, Read};
use std::panic::{self, AssertUnwindSafe};

use log::{debug, trace, warn};

use crate::error::{
    BoxError, ClientError, ClientReply, HandlerResult, SESSION_ENDED_MESSAGE, classify,
};
use crate::handlers::HandlerRegistry;
use crate::session::{Phase, Session};

/// Notification delivered to observers
#[derive(Debug)]
pub enum Event<'a> {
    /// A phase was entered; its handler chain runs next
    Phase {
        phase: Phase,
        session: &'a Session,
    },
    /// A handler failed and the rest of its chain was skipped, or the
    /// message body could not be read to its end
    Failed {
        phase: Phase,
        error: &'a (dyn std::error::Error + Send + Sync + 'static),
        session: &'a Session,
    },
    /// The session ended. Delivered once per session.
    End { session: &'a Session },
}

pub type Observer = Box<dyn Fn(&Event<'_>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainOutcome {
    Completed,
    Stopped,
    Failed { explicit: bool },
}

/// Drives sessions through their phases
///
/// The dispatcher is immutable once built and can be shared between
/// connection threads. Each entry routine answers the protocol engine with
/// `Ok(())` to accept the command or the client error to reply with.
pub struct Dispatcher {
    handlers: HandlerRegistry,
    observers: Vec<Observer>,
}

impl Dispatcher {
    pub fn new(handlers: HandlerRegistry, observers: Vec<Observer>) -> Self {
        Self {
            handlers,
            observers,
        }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Connection opened
    pub fn connect(&self, session: &mut Session) -> Result<(), ClientError> {
        self.enter(Phase::Connect, session)?;
        self.run_chain(Phase::Connect, session, &self.handlers.connect, |handler, session| {
            handler(session)
        });
        self.finish(session)
    }

    /// MAIL FROM with a candidate sender address
    pub fn mail_from(&self, address: &str, session: &mut Session) -> Result<(), ClientError> {
        self.enter(Phase::From, session)?;
        self.run_chain(Phase::From, session, &self.handlers.from, |handler, session| {
            handler(address, session)
        });
        if session.client_error().is_none() {
            session.accept_sender(address);
        }
        self.finish(session)
    }

    /// RCPT TO with a candidate recipient address
    ///
    /// A handler failing without an explicit client reply ends the whole
    /// session, not just this recipient.
    pub fn rcpt_to(&self, address: &str, session: &mut Session) -> Result<(), ClientError> {
        self.enter(Phase::To, session)?;
        let outcome = self.run_chain(Phase::To, session, &self.handlers.to, |handler, session| {
            handler(address, session)
        });
        if outcome == (ChainOutcome::Failed { explicit: false }) {
            warn!(
                "session {}: recipient {address} failed without a client reply, ending session",
                session.id()
            );
            session.end();
        }
        if session.client_error().is_none() {
            session.accept_recipient(address);
        }
        self.finish(session)
    }

    /// Message body. The stream is always read to its end before returning,
    /// and the session is finished afterwards.
    pub fn data(&self, session: &mut Session, body: &mut dyn Read) -> Result<(), ClientError> {
        if let Err(rejected) = self.enter(Phase::Use, session) {
            if let Err(err) = drain(body) {
                warn!("session {}: failed to drain message body: {err}", session.id());
            }
            return Err(rejected);
        }

        self.run_chain(Phase::Use, session, &self.handlers.data, |handler, session| {
            handler(session, &mut *body)
        });

        match drain(body) {
            Ok(0) => {}
            Ok(skipped) => trace!("session {}: drained {skipped} unread bytes", session.id()),
            Err(err) => {
                warn!("session {}: failed to drain message body: {err}", session.id());
                self.emit(&Event::Failed {
                    phase: Phase::Use,
                    error: &err,
                    session,
                });
                session.fail(err, ClientReply::Generic);
            }
        }

        session.end();
        self.finish(session)
    }

    /// Connection closed. Ends the session if nothing else did.
    pub fn close(&self, session: &mut Session) {
        if !session.is_done() {
            debug!(
                "session {}: connection closed in phase {}",
                session.id(),
                session.phase()
            );
            session.end();
        }
        self.notify_end(session);
    }

    fn enter(&self, phase: Phase, session: &mut Session) -> Result<(), ClientError> {
        if session.is_done() {
            debug!("session {}: {phase} after the session ended", session.id());
            return Err(session
                .client_error()
                .cloned()
                .unwrap_or_else(|| ClientError::new(SESSION_ENDED_MESSAGE).with_code(503)));
        }

        session.clear_client_error();
        if let Err(err) = session.advance(phase) {
            debug!("session {}: {err}", session.id());
            return Err(ClientError::new("Bad sequence of commands").with_code(503));
        }

        debug!("session {}: entering phase {phase}", session.id());
        self.emit(&Event::Phase { phase, session });
        Ok(())
    }

    fn run_chain<H>(
        &self,
        phase: Phase,
        session: &mut Session,
        chain: &[H],
        mut call: impl FnMut(&H, &mut Session) -> HandlerResult,
    ) -> ChainOutcome {
        for (index, handler) in chain.iter().enumerate() {
            if session.phase() != phase {
                trace!(
                    "session {}: {phase} chain stopped before handler {index}",
                    session.id()
                );
                return ChainOutcome::Stopped;
            }

            let result = panic::catch_unwind(AssertUnwindSafe(|| call(handler, &mut *session)))
                .unwrap_or_else(|payload| Err(panic_error(payload)));

            if let Err(err) = result {
                let (err, reply) = classify(err);
                warn!(
                    "session {}: {phase} handler {index} failed: {err}",
                    session.id()
                );
                self.emit(&Event::Failed {
                    phase,
                    error: &*err,
                    session,
                });
                let explicit = reply != ClientReply::Generic;
                session.fail(err, reply);
                return ChainOutcome::Failed { explicit };
            }
        }
        ChainOutcome::Completed
    }

    fn finish(&self, session: &mut Session) -> Result<(), ClientError> {
        self.notify_end(session);
        match session.client_error() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn notify_end(&self, session: &mut Session) {
        if session.take_end_notification() {
            debug!("session {}: ended", session.id());
            self.emit(&Event::End { session });
        }
    }

    fn emit(&self, event: &Event<'_>) {
        for observer in &self.observers {
            observer(event);
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.handlers)
            .field("observers", &self.observers.len())
            .finish()
    }
}

fn drain(body: &mut dyn Read) -> io::Result<u64> {
    io::copy(body, &mut io::sink())
}

fn panic_error(payload: Box<dyn Any + Send>) -> BoxError {
    let message = if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    };
    format!("handler panicked: {message}").into()
}
