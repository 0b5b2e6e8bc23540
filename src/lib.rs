//! # usemail
//!
//! usemail is an SMTP server whose behaviour is made of middleware.
//!
//! Every connection is a session that moves through the phases `connect`,
//! `from`, `to`, `use` and `done`. Each phase has its own chain of handlers,
//! run in registration order. A handler can accept the command by returning
//! `Ok(())`, reject it by returning an error, or end the whole session.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use usemail::{Event, Rejection, Usemail, message};
//!
//! let mut usemail = Usemail::new();
//! usemail
//!     .on_to(|address, _session| {
//!         if address.ends_with("@example.com") {
//!             Ok(())
//!         } else {
//!             Err(Rejection::message("Relaying denied").into())
//!         }
//!     })
//!     .on_event(|event| {
//!         if let Event::End { session } = event {
//!             println!("session {} ended", session.id());
//!         }
//!     });
//! usemail.register("use", message::parser()).unwrap();
//!
//! let server = usemail.listen("127.0.0.1:2525").unwrap();
//! println!("listening on port {}", server.port());
//! server.join();
//! ```
//!
//! ## Handler failures
//!
//! A handler that returns an error stops its chain and the command is
//! rejected. The peer only sees a generic message unless the handler returns
//! a [`Rejection`], which carries the reply meant for the client.
//!
//! A failing recipient handler without a [`Rejection`] ends the session;
//! other phases just reject the current command. Panics count as failures.
//!
//! ## Session data
//!
//! Handlers share data through [`Session::set`] and [`Session::get`]. A key
//! taken with [`Session::claim`] can only be overwritten with its [`Token`].
//!
//! ## Supported SMTP commands
//!
//! - `HELO` - Identify the sender
//! - `MAIL FROM` - Specify the sender's address
//! - `RCPT TO` - Specify the destination (multiple destinations are supported)
//! - `DATA` - Send the email body
//! - `RSET` - Reset the protocol state
//! - `NOOP` - Do nothing
//! - `QUIT` - Close connection
//!
//! Enabling the `ehlo` feature also allows you to use the `EHLO` command.
//!
//! ## Notes
//!
//! - One mail transaction per connection. The session ends after `DATA`.
//! - SMTP authentication is not supported.
//! - SSL/TLS connection is not supported.
//!
//! ## Size Limits
//!
//! The server enforces RFC 821 size limits:
//! - User names: 64 characters max
//! - Domain names: 64 characters max
//! - Paths: 256 characters max
//! - Command lines: 512 characters max
//! - Text lines: 1000 characters max
//! - Recipients: 100 max per message
//! - Message data: 10 MiB

mod dispatch;
mod error;
mod handlers;
pub mod message;
mod server;
mod session;
pub mod smtp;

pub use dispatch::{Dispatcher, Event, Observer};
pub use error::{
    BoxError, ClientError, ClientReply, GENERIC_CLIENT_MESSAGE, HandlerResult, Rejection,
    SESSION_ENDED_MESSAGE, UsemailError,
};
pub use handlers::{AddressFn, ConnectFn, DataFn, Handler, HandlerRegistry};
pub use message::{MESSAGE_KEY, Message};
pub use server::{Config, Server, Usemail};
pub use session::{Envelope, Phase, Session, Token};
pub use smtp::{SmtpError, SmtpLimits};
