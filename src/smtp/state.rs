//! Command sequencing for one SMTP connection

use crate::smtp::error::{SmtpError, SmtpLimits};

/// Represents the current state of an SMTP connection
#[derive(Debug, Clone, PartialEq)]
pub enum SmtpState {
    /// Initial state - waiting for HELO
    Initial,
    /// HELO received - ready for MAIL command
    GreetingReceived,
    /// MAIL FROM accepted - ready for RCPT commands
    MailReceived,
    /// At least one RCPT TO accepted - ready for DATA or more RCPT commands
    RecipientsReceived,
    /// DATA command accepted - the body is being streamed
    DataMode,
}

/// Protocol-level bookkeeping of one connection.
///
/// Addresses and data live in the dispatcher's session; this only tracks
/// which command may come next.
#[derive(Debug)]
pub struct SmtpTransaction {
    /// Current state of the connection
    pub state: SmtpState,
    /// Whether the next lines are message data
    pub in_data_mode: bool,
    /// Number of recipients accepted in this transaction
    pub recipients: usize,
    /// Client domain from HELO command
    pub client_domain: Option<String>,
}

impl SmtpTransaction {
    pub fn new() -> Self {
        Self {
            state: SmtpState::Initial,
            in_data_mode: false,
            recipients: 0,
            client_domain: None,
        }
    }

    /// Reset to post-HELO state
    pub fn reset(&mut self) {
        self.state = SmtpState::GreetingReceived;
        self.in_data_mode = false;
        self.recipients = 0;
        // Keep client_domain as it's set by HELO
    }

    /// Set the client domain from HELO command
    pub fn set_client_domain(&mut self, domain: &str) -> Result<(), SmtpError> {
        if domain.len() > SmtpLimits::DOMAIN_MAX_LENGTH {
            return Err(SmtpError::DomainTooLong {
                max: SmtpLimits::DOMAIN_MAX_LENGTH,
            });
        }

        self.client_domain = Some(domain.to_owned());
        self.reset(); // Clear any existing transaction
        Ok(())
    }

    pub fn sender_accepted(&mut self) {
        self.recipients = 0;
        self.state = SmtpState::MailReceived;
    }

    /// Fails once the recipient limit is reached
    pub fn check_recipient_limit(&self) -> Result<(), SmtpError> {
        if self.recipients >= SmtpLimits::MAX_RECIPIENTS {
            return Err(SmtpError::TooManyRecipients {
                max: SmtpLimits::MAX_RECIPIENTS,
            });
        }
        Ok(())
    }

    pub fn recipient_accepted(&mut self) {
        self.recipients += 1;
        self.state = SmtpState::RecipientsReceived;
    }

    /// Start data mode
    pub fn start_data_mode(&mut self) -> Result<(), SmtpError> {
        if self.state != SmtpState::RecipientsReceived {
            return Err(SmtpError::InvalidState(
                "DATA command requires RCPT first".to_string(),
            ));
        }

        self.in_data_mode = true;
        self.state = SmtpState::DataMode;
        Ok(())
    }

    /// Leave data mode once the body has been answered
    pub fn finish_data(&mut self) {
        self.reset();
    }

    /// Check if the connection is ready for a specific command
    pub fn can_execute_command(&self, command: &str) -> bool {
        match command.to_uppercase().as_str() {
            #[cfg(feature = "ehlo")]
            "EHLO" => true, // EHLO can be sent at any time
            "HELO" => true, // HELO can be sent at any time
            "MAIL" => self.state == SmtpState::GreetingReceived,
            "RCPT" => {
                self.state == SmtpState::MailReceived || self.state == SmtpState::RecipientsReceived
            }
            "DATA" => self.state == SmtpState::RecipientsReceived,
            "RSET" => self.state != SmtpState::Initial,
            "NOOP" => true, // NOOP can be sent at any time
            "QUIT" => true, // QUIT can be sent at any time
            _ => false,
        }
    }
}

impl Default for SmtpTransaction {
    fn default() -> Self {
        Self::new()
    }
}
