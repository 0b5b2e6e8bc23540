//! Implementation of SMTP commands

use log::trace;

use crate::dispatch::Dispatcher;
use crate::session::Session;
use crate::smtp::error::{SmtpError, SmtpLimits};
use crate::smtp::response::SmtpResponse;
use crate::smtp::state::SmtpTransaction;

/// Reply code for rejected MAIL, RCPT and DATA commands
const REJECT_CODE: &str = "550";

/// Parses command lines, keeps the protocol state in order and hands the
/// transaction events to the dispatcher.
#[derive(Debug)]
pub struct SmtpCommandHandler<'a> {
    hostname: &'a str,
    dispatcher: &'a Dispatcher,
}

impl<'a> SmtpCommandHandler<'a> {
    /// Create a new command handler
    pub fn new(hostname: &'a str, dispatcher: &'a Dispatcher) -> Self {
        Self {
            hostname,
            dispatcher,
        }
    }

    /// Process a command line and return a response
    pub fn process_command(
        &self,
        command_line: &str,
        transaction: &mut SmtpTransaction,
        session: &mut Session,
    ) -> Result<SmtpResponse, SmtpError> {
        // Check command line length
        if command_line.len() > SmtpLimits::COMMAND_LINE_MAX_LENGTH {
            return Err(SmtpError::LineTooLong {
                max: SmtpLimits::COMMAND_LINE_MAX_LENGTH,
            });
        }

        let parts: Vec<&str> = command_line.split_whitespace().collect();
        if parts.is_empty() {
            return Err(SmtpError::InvalidCommand);
        }

        let cmd = parts[0].to_uppercase();
        trace!("session {}: {cmd}", session.id());

        match cmd.as_str() {
            "HELO" => self.handle_helo(parts, transaction, session, false),
            #[cfg(feature = "ehlo")]
            "EHLO" => self.handle_helo(parts, transaction, session, true),
            "MAIL" => self.handle_mail(parts, transaction, session),
            "RCPT" => self.handle_rcpt(parts, transaction, session),
            "DATA" => self.handle_data(parts, transaction, session),
            "RSET" => self.handle_rset(transaction),
            "NOOP" => self.handle_noop(),
            "QUIT" => self.handle_quit(),
            _ => Err(SmtpError::InvalidCommand),
        }
    }

    /// Handle HELO and EHLO commands
    fn handle_helo(
        &self,
        parts: Vec<&str>,
        transaction: &mut SmtpTransaction,
        session: &mut Session,
        extended: bool,
    ) -> Result<SmtpResponse, SmtpError> {
        if parts.len() < 2 {
            return Err(SmtpError::InvalidSyntax(format!(
                "{} requires domain argument",
                parts[0].to_uppercase()
            )));
        }

        let client_domain = parts[1];
        transaction.set_client_domain(client_domain)?;
        session.set_remote_host(client_domain, extended);

        #[cfg(feature = "ehlo")]
        if extended {
            return Ok(SmtpResponse::ehlo(self.hostname, client_domain));
        }
        Ok(SmtpResponse::helo(self.hostname, client_domain))
    }

    /// Handle MAIL command
    fn handle_mail(
        &self,
        parts: Vec<&str>,
        transaction: &mut SmtpTransaction,
        session: &mut Session,
    ) -> Result<SmtpResponse, SmtpError> {
        if !transaction.can_execute_command("MAIL") {
            return Err(SmtpError::InvalidState(
                "MAIL command requires HELO first".to_string(),
            ));
        }

        if parts.len() < 2 {
            return Err(SmtpError::InvalidSyntax(
                "MAIL requires FROM argument".to_string(),
            ));
        }

        let from_part = parts[1..].join(" ");
        if !from_part.to_uppercase().starts_with("FROM:") {
            return Err(SmtpError::InvalidSyntax(
                "MAIL command must be 'MAIL FROM:<address>'".to_string(),
            ));
        }

        let addr = self.extract_address(&from_part[5..], "FROM")?;

        match self.dispatcher.mail_from(addr, session) {
            Ok(()) => {
                transaction.sender_accepted();
                Ok(SmtpResponse::ok())
            }
            Err(rejection) => Ok(SmtpResponse::rejection(&rejection, REJECT_CODE)),
        }
    }

    /// Handle RCPT command
    fn handle_rcpt(
        &self,
        parts: Vec<&str>,
        transaction: &mut SmtpTransaction,
        session: &mut Session,
    ) -> Result<SmtpResponse, SmtpError> {
        if !transaction.can_execute_command("RCPT") {
            return Err(SmtpError::InvalidState(
                "RCPT command requires MAIL first".to_string(),
            ));
        }

        if parts.len() < 2 {
            return Err(SmtpError::InvalidSyntax(
                "RCPT requires TO argument".to_string(),
            ));
        }

        let to_part = parts[1..].join(" ");
        if !to_part.to_uppercase().starts_with("TO:") {
            return Err(SmtpError::InvalidSyntax(
                "RCPT command must be 'RCPT TO:<address>'".to_string(),
            ));
        }

        let addr = self.extract_address(&to_part[3..], "TO")?;
        transaction.check_recipient_limit()?;

        match self.dispatcher.rcpt_to(addr, session) {
            Ok(()) => {
                transaction.recipient_accepted();
                Ok(SmtpResponse::ok())
            }
            Err(rejection) => Ok(SmtpResponse::rejection(&rejection, REJECT_CODE)),
        }
    }

    /// Handle DATA command
    fn handle_data(
        &self,
        parts: Vec<&str>,
        transaction: &mut SmtpTransaction,
        session: &Session,
    ) -> Result<SmtpResponse, SmtpError> {
        if !transaction.can_execute_command("DATA") {
            return Err(SmtpError::InvalidState(
                "DATA command requires RCPT first".to_string(),
            ));
        }

        if parts.len() > 1 {
            return Err(SmtpError::InvalidSyntax(
                "DATA command takes no arguments".to_string(),
            ));
        }

        if session.is_done() {
            return Err(SmtpError::SessionEnded);
        }

        transaction.start_data_mode()?;

        Ok(SmtpResponse::data_start())
    }

    /// Handle RSET command
    fn handle_rset(&self, transaction: &mut SmtpTransaction) -> Result<SmtpResponse, SmtpError> {
        if !transaction.can_execute_command("RSET") {
            return Err(SmtpError::InvalidState(
                "RSET command requires HELO first".to_string(),
            ));
        }

        transaction.reset();
        Ok(SmtpResponse::ok())
    }

    /// Handle NOOP command
    fn handle_noop(&self) -> Result<SmtpResponse, SmtpError> {
        Ok(SmtpResponse::ok())
    }

    /// Handle QUIT command
    fn handle_quit(&self) -> Result<SmtpResponse, SmtpError> {
        Ok(SmtpResponse::quit())
    }

    /// Take the address out of `<...>` and validate it. Parameters after the
    /// closing bracket are ignored.
    fn extract_address<'l>(&self, argument: &'l str, keyword: &str) -> Result<&'l str, SmtpError> {
        let argument = argument.trim_start();
        let Some(addr) = argument
            .strip_prefix('<')
            .and_then(|rest| rest.split_once('>'))
            .map(|(addr, _params)| addr)
        else {
            return Err(SmtpError::InvalidSyntax(format!(
                "{keyword} address must be enclosed in angle brackets"
            )));
        };
        if addr.is_empty() {
            return Err(SmtpError::InvalidSyntax(format!(
                "{keyword} address cannot be empty"
            )));
        }

        if addr.len() > SmtpLimits::PATH_MAX_LENGTH {
            return Err(SmtpError::PathTooLong {
                max: SmtpLimits::PATH_MAX_LENGTH,
            });
        }

        self.validate_email_address(addr)?;
        Ok(addr)
    }

    /// Validate email address format and size limits
    fn validate_email_address(&self, addr: &str) -> Result<(), SmtpError> {
        // Check for @ symbol
        if let Some(at_pos) = addr.rfind('@') {
            let user_part = &addr[..at_pos];
            let domain_part = &addr[at_pos + 1..];

            // Check user part length
            if user_part.len() > SmtpLimits::USER_MAX_LENGTH {
                return Err(SmtpError::UserTooLong {
                    max: SmtpLimits::USER_MAX_LENGTH,
                });
            }

            // Check domain part length
            if domain_part.len() > SmtpLimits::DOMAIN_MAX_LENGTH {
                return Err(SmtpError::DomainTooLong {
                    max: SmtpLimits::DOMAIN_MAX_LENGTH,
                });
            }

            // Basic validation - must have user and domain parts
            if user_part.is_empty() || domain_part.is_empty() {
                return Err(SmtpError::InvalidSyntax(
                    "Invalid email address format".to_string(),
                ));
            }
        } else {
            return Err(SmtpError::InvalidSyntax(
                "Email address must contain @ symbol".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Rejection;
    use crate::handlers::{Handler, HandlerRegistry};

    fn open_session(dispatcher: &Dispatcher) -> (SmtpTransaction, Session) {
        let mut session = Session::new(None);
        dispatcher.connect(&mut session).unwrap();
        (SmtpTransaction::new(), session)
    }

    fn plain_dispatcher() -> Dispatcher {
        Dispatcher::new(HandlerRegistry::new(), Vec::new())
    }

    #[test]
    fn test_helo_command() {
        let dispatcher = plain_dispatcher();
        let handler = SmtpCommandHandler::new("test.local", &dispatcher);
        let (mut transaction, mut session) = open_session(&dispatcher);

        let response = handler
            .process_command("HELO client.local", &mut transaction, &mut session)
            .unwrap();

        assert_eq!(response.code, "250");
        assert_eq!(response.message, "test.local Hello client.local");
        assert_eq!(session.remote_host(), Some("client.local"));
        assert_eq!(session.transmission_type(), "SMTP");
    }

    #[test]
    fn test_helo_missing_domain() {
        let dispatcher = plain_dispatcher();
        let handler = SmtpCommandHandler::new("test.local", &dispatcher);
        let (mut transaction, mut session) = open_session(&dispatcher);

        let result = handler.process_command("HELO", &mut transaction, &mut session);
        assert!(matches!(result, Err(SmtpError::InvalidSyntax(_))));
    }

    #[test]
    fn test_mail_command_records_sender() {
        let dispatcher = plain_dispatcher();
        let handler = SmtpCommandHandler::new("test.local", &dispatcher);
        let (mut transaction, mut session) = open_session(&dispatcher);

        handler
            .process_command("HELO client.local", &mut transaction, &mut session)
            .unwrap();
        let response = handler
            .process_command("MAIL FROM:<sender@example.com>", &mut transaction, &mut session)
            .unwrap();

        assert_eq!(response.code, "250");
        assert_eq!(session.from(), Some("sender@example.com"));
    }

    #[test]
    fn test_mail_without_helo() {
        let dispatcher = plain_dispatcher();
        let handler = SmtpCommandHandler::new("test.local", &dispatcher);
        let (mut transaction, mut session) = open_session(&dispatcher);

        let result =
            handler.process_command("MAIL FROM:<sender@example.com>", &mut transaction, &mut session);
        assert!(matches!(result, Err(SmtpError::InvalidState(_))));
    }

    #[test]
    fn test_mail_invalid_syntax() {
        let dispatcher = plain_dispatcher();
        let handler = SmtpCommandHandler::new("test.local", &dispatcher);
        let (mut transaction, mut session) = open_session(&dispatcher);

        handler
            .process_command("HELO client.local", &mut transaction, &mut session)
            .unwrap();

        let result = handler.process_command("MAIL sender@example.com", &mut transaction, &mut session);
        assert!(result.is_err());
        let result = handler.process_command("MAIL FROM:<>", &mut transaction, &mut session);
        assert!(result.is_err());
    }

    #[test]
    fn test_rejected_sender_keeps_state() {
        let mut registry = HandlerRegistry::new();
        registry.push(Handler::sender(|_, _| {
            Err(Rejection::new("blocked", "Sender not welcome").into())
        }));
        let dispatcher = Dispatcher::new(registry, Vec::new());
        let handler = SmtpCommandHandler::new("test.local", &dispatcher);
        let (mut transaction, mut session) = open_session(&dispatcher);

        handler
            .process_command("HELO client.local", &mut transaction, &mut session)
            .unwrap();
        let response = handler
            .process_command("MAIL FROM:<spam@example.com>", &mut transaction, &mut session)
            .unwrap();

        assert_eq!(response.format(), "550 Sender not welcome\r\n");
        assert!(transaction.can_execute_command("MAIL"));
        assert!(!transaction.can_execute_command("RCPT"));
        assert!(session.from().is_none());
    }

    #[test]
    fn test_rcpt_command() {
        let dispatcher = plain_dispatcher();
        let handler = SmtpCommandHandler::new("test.local", &dispatcher);
        let (mut transaction, mut session) = open_session(&dispatcher);

        handler
            .process_command("HELO client.local", &mut transaction, &mut session)
            .unwrap();
        handler
            .process_command("MAIL FROM:<sender@example.com>", &mut transaction, &mut session)
            .unwrap();

        let response = handler
            .process_command("RCPT TO:<recipient@example.com>", &mut transaction, &mut session)
            .unwrap();

        assert_eq!(response.code, "250");
        assert_eq!(session.to(), ["recipient@example.com".to_string()]);
        assert_eq!(transaction.recipients, 1);
    }

    #[test]
    fn test_rcpt_without_mail() {
        let dispatcher = plain_dispatcher();
        let handler = SmtpCommandHandler::new("test.local", &dispatcher);
        let (mut transaction, mut session) = open_session(&dispatcher);

        handler
            .process_command("HELO client.local", &mut transaction, &mut session)
            .unwrap();

        let result =
            handler.process_command("RCPT TO:<recipient@example.com>", &mut transaction, &mut session);
        assert!(result.is_err());
    }

    #[test]
    fn test_data_command() {
        let dispatcher = plain_dispatcher();
        let handler = SmtpCommandHandler::new("test.local", &dispatcher);
        let (mut transaction, mut session) = open_session(&dispatcher);

        for line in [
            "HELO client.local",
            "MAIL FROM:<sender@example.com>",
            "RCPT TO:<recipient@example.com>",
        ] {
            handler
                .process_command(line, &mut transaction, &mut session)
                .unwrap();
        }

        let response = handler
            .process_command("DATA", &mut transaction, &mut session)
            .unwrap();

        assert_eq!(response.code, "354");
        assert!(transaction.in_data_mode);
    }

    #[test]
    fn test_data_after_session_ended() {
        let dispatcher = plain_dispatcher();
        let handler = SmtpCommandHandler::new("test.local", &dispatcher);
        let (mut transaction, mut session) = open_session(&dispatcher);

        for line in [
            "HELO client.local",
            "MAIL FROM:<sender@example.com>",
            "RCPT TO:<recipient@example.com>",
        ] {
            handler
                .process_command(line, &mut transaction, &mut session)
                .unwrap();
        }
        session.end();

        let result = handler.process_command("DATA", &mut transaction, &mut session);
        assert!(matches!(result, Err(SmtpError::SessionEnded)));
        assert!(!transaction.in_data_mode);
    }

    #[test]
    fn test_rset_and_quit() {
        let dispatcher = plain_dispatcher();
        let handler = SmtpCommandHandler::new("test.local", &dispatcher);
        let (mut transaction, mut session) = open_session(&dispatcher);

        assert!(handler
            .process_command("RSET", &mut transaction, &mut session)
            .is_err());
        handler
            .process_command("HELO client.local", &mut transaction, &mut session)
            .unwrap();
        let response = handler
            .process_command("RSET", &mut transaction, &mut session)
            .unwrap();
        assert_eq!(response.code, "250");

        let response = handler
            .process_command("NOOP", &mut transaction, &mut session)
            .unwrap();
        assert_eq!(response.code, "250");

        let response = handler
            .process_command("QUIT", &mut transaction, &mut session)
            .unwrap();
        assert_eq!(response.code, "221");
    }

    #[test]
    fn test_invalid_command() {
        let dispatcher = plain_dispatcher();
        let handler = SmtpCommandHandler::new("test.local", &dispatcher);
        let (mut transaction, mut session) = open_session(&dispatcher);

        let result = handler.process_command("INVALID", &mut transaction, &mut session);
        assert!(matches!(result, Err(SmtpError::InvalidCommand)));
    }

    #[test]
    fn test_command_line_too_long() {
        let dispatcher = plain_dispatcher();
        let handler = SmtpCommandHandler::new("test.local", &dispatcher);
        let (mut transaction, mut session) = open_session(&dispatcher);

        let long_command = "HELO ".to_string() + &"a".repeat(SmtpLimits::COMMAND_LINE_MAX_LENGTH);
        let result = handler.process_command(&long_command, &mut transaction, &mut session);
        assert!(matches!(result, Err(SmtpError::LineTooLong { .. })));
    }

    #[test]
    fn test_validate_email_address() {
        let dispatcher = plain_dispatcher();
        let handler = SmtpCommandHandler::new("test.local", &dispatcher);

        // Valid addresses
        assert!(handler.validate_email_address("user@example.com").is_ok());
        assert!(handler.validate_email_address("test@test.local").is_ok());

        // Invalid addresses
        assert!(handler.validate_email_address("invalid").is_err());
        assert!(handler.validate_email_address("@example.com").is_err());
        assert!(handler.validate_email_address("user@").is_err());

        // Too long user part
        let long_user = "a".repeat(SmtpLimits::USER_MAX_LENGTH + 1) + "@example.com";
        assert!(matches!(
            handler.validate_email_address(&long_user),
            Err(SmtpError::UserTooLong { .. })
        ));

        // Too long domain part
        let long_domain = "user@".to_string() + &"a".repeat(SmtpLimits::DOMAIN_MAX_LENGTH + 1);
        assert!(matches!(
            handler.validate_email_address(&long_domain),
            Err(SmtpError::DomainTooLong { .. })
        ));
    }

    #[test]
    fn test_path_too_long() {
        let dispatcher = plain_dispatcher();
        let handler = SmtpCommandHandler::new("test.local", &dispatcher);

        let long_path = format!("<user@{}>", "a".repeat(SmtpLimits::PATH_MAX_LENGTH));
        assert!(matches!(
            handler.extract_address(&long_path, "FROM"),
            Err(SmtpError::PathTooLong { .. })
        ));
    }
}
