//! SMTP protocol engine that feeds the phase dispatcher

pub mod commands;
pub mod connection;
pub mod data;
pub mod error;
pub mod response;
pub mod state;

pub use commands::SmtpCommandHandler;
pub use connection::handle_client;
pub use data::DataReader;
pub use error::{SmtpError, SmtpLimits};
pub use response::SmtpResponse;
pub use state::{SmtpState, SmtpTransaction};
