//! Per-connection protocol loop

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;

use log::{debug, trace, warn};

use crate::dispatch::Dispatcher;
use crate::session::Session;
use crate::smtp::commands::SmtpCommandHandler;
use crate::smtp::data::{DataReader, read_line_limited};
use crate::smtp::error::{SmtpError, SmtpLimits};
use crate::smtp::response::SmtpResponse;
use crate::smtp::state::SmtpTransaction;

/// Reply code for a connection refused by the connect chain
const CONNECT_REJECT_CODE: &str = "554";

/// Reply code for a message refused by the data chain
const DATA_REJECT_CODE: &str = "550";

/// Serve one client until it quits or disconnects.
///
/// The session lives exactly as long as this call; the dispatcher is told
/// about the close on every exit path.
pub fn handle_client(
    mut stream: TcpStream,
    dispatcher: &Dispatcher,
    hostname: &str,
) -> Result<(), SmtpError> {
    let mut session = Session::new(stream.peer_addr().ok());
    debug!(
        "session {}: connection from {:?}",
        session.id(),
        session.remote_address()
    );

    let result = serve_session(&mut stream, dispatcher, hostname, &mut session);
    dispatcher.close(&mut session);
    result
}

fn serve_session(
    stream: &mut TcpStream,
    dispatcher: &Dispatcher,
    hostname: &str,
    session: &mut Session,
) -> Result<(), SmtpError> {
    if let Err(rejection) = dispatcher.connect(session) {
        debug!("session {}: connection rejected", session.id());
        send_response(
            stream,
            &SmtpResponse::rejection(&rejection, CONNECT_REJECT_CODE),
        )?;
        return Ok(());
    }

    let mut reader = BufReader::new(stream.try_clone()?);
    let command_handler = SmtpCommandHandler::new(hostname, dispatcher);
    let mut transaction = SmtpTransaction::new();

    // Send greeting
    send_response(stream, &SmtpResponse::greeting(hostname))?;

    let mut line_buffer = Vec::new();
    loop {
        line_buffer.clear();

        match read_line_limited(
            &mut reader,
            &mut line_buffer,
            SmtpLimits::COMMAND_LINE_MAX_LENGTH,
        ) {
            Ok((0, _)) => break, // Connection closed
            Ok((_, true)) => {
                let too_long = SmtpError::LineTooLong {
                    max: SmtpLimits::COMMAND_LINE_MAX_LENGTH,
                };
                send_response(stream, &SmtpResponse::from_error(&too_long))?;
            }
            Ok(_) => {
                // Invalid UTF-8 is replaced rather than rejected
                let line = String::from_utf8_lossy(&line_buffer);
                let command = line.trim();
                if command.is_empty() {
                    continue;
                }
                trace!("session {}: > {command}", session.id());

                let response = match command_handler.process_command(
                    command,
                    &mut transaction,
                    session,
                ) {
                    Ok(response) => response,
                    Err(e) => SmtpResponse::from_error(&e),
                };
                send_response(stream, &response)?;

                if response.code == "221" {
                    break; // QUIT command
                }

                if transaction.in_data_mode {
                    let Some(response) = receive_data(&mut reader, dispatcher, session) else {
                        debug!("session {}: connection closed during DATA", session.id());
                        break;
                    };
                    send_response(stream, &response)?;
                    transaction.finish_data();
                }
            }
            Err(e) => {
                warn!("session {}: error reading from client: {e}", session.id());
                break;
            }
        }
    }

    Ok(())
}

/// Stream the DATA section to the dispatcher and pick the reply.
///
/// Returns `None` when the client went away before the terminator line.
fn receive_data<R: BufRead>(
    reader: &mut R,
    dispatcher: &Dispatcher,
    session: &mut Session,
) -> Option<SmtpResponse> {
    let mut body = DataReader::new(reader);
    let outcome = dispatcher.data(session, &mut body);
    trace!("session {}: received {} bytes", session.id(), body.size());

    match body.violation() {
        Some(SmtpError::ConnectionClosed) => None,
        Some(violation) => Some(SmtpResponse::from_error(violation)),
        None => Some(match outcome {
            Ok(()) => SmtpResponse::ok(),
            Err(rejection) => SmtpResponse::rejection(&rejection, DATA_REJECT_CODE),
        }),
    }
}

/// Send a response to the client
fn send_response(stream: &mut TcpStream, response: &SmtpResponse) -> Result<(), SmtpError> {
    // Ensure response doesn't exceed maximum line length
    let formatted = response.format();
    if formatted.len() > SmtpLimits::REPLY_LINE_MAX_LENGTH {
        // Truncate message if too long
        let truncated_response = SmtpResponse::new(&response.code, "Response too long (truncated)");
        stream.write_all(truncated_response.format().as_bytes())?;
    } else {
        stream.write_all(formatted.as_bytes())?;
    }
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Event, Observer};
    use crate::error::Rejection;
    use crate::handlers::{Handler, HandlerRegistry};
    use crate::message::{self, MESSAGE_KEY, Message};
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::{Arc, mpsc};
    use std::thread;
    use std::time::Duration;

    /// What a finished session looked like
    #[derive(Debug)]
    struct Delivery {
        from: Option<String>,
        to: Vec<String>,
        message: Option<Message>,
    }

    fn start_test_server(mut registry: HandlerRegistry) -> (String, mpsc::Receiver<Delivery>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = mpsc::channel();

        registry.push(message::parser());
        let tx = std::sync::Mutex::new(tx);
        let observer: Observer = Box::new(move |event| {
            if let Event::End { session } = event {
                let delivery = Delivery {
                    from: session.from().map(str::to_owned),
                    to: session.to().to_vec(),
                    message: session.get::<Message>(MESSAGE_KEY).cloned(),
                };
                let _ = tx.lock().unwrap().send(delivery);
            }
        });
        let dispatcher = Arc::new(Dispatcher::new(registry, vec![observer]));

        // Start server in background thread
        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let dispatcher = Arc::clone(&dispatcher);
                        thread::spawn(move || {
                            let _ = handle_client(stream, &dispatcher, "test.local");
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        (addr, rx)
    }

    fn connect(addr: &str) -> (TcpStream, BufReader<TcpStream>, String) {
        let stream = TcpStream::connect(addr).unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut greeting = String::new();
        reader.read_line(&mut greeting).unwrap();
        (stream, reader, greeting)
    }

    fn send_command(
        stream: &mut TcpStream,
        reader: &mut BufReader<TcpStream>,
        command: &str,
    ) -> String {
        write!(stream, "{command}\r\n").unwrap();
        stream.flush().unwrap();

        let mut response = String::new();
        reader.read_line(&mut response).unwrap();
        response.trim().to_string()
    }

    fn send_body(stream: &mut TcpStream, reader: &mut BufReader<TcpStream>, body: &str) -> String {
        stream.write_all(body.as_bytes()).unwrap();
        stream.write_all(b".\r\n").unwrap();
        stream.flush().unwrap();

        let mut response = String::new();
        reader.read_line(&mut response).unwrap();
        response.trim().to_string()
    }

    #[test]
    fn test_complete_smtp_session() {
        let (addr, rx) = start_test_server(HandlerRegistry::new());
        let (mut stream, mut reader, greeting) = connect(&addr);
        assert!(greeting.starts_with("220 test.local"));

        let response = send_command(&mut stream, &mut reader, "HELO client.local");
        assert!(response.starts_with("250"));
        let response = send_command(&mut stream, &mut reader, "MAIL FROM:<test@example.com>");
        assert!(response.starts_with("250"));
        let response = send_command(&mut stream, &mut reader, "RCPT TO:<recipient@example.com>");
        assert!(response.starts_with("250"));
        let response = send_command(&mut stream, &mut reader, "DATA");
        assert!(response.starts_with("354"));

        let response = send_body(
            &mut stream,
            &mut reader,
            "Subject: Test Email\r\n\r\nThis is a test email.\r\n",
        );
        assert!(response.starts_with("250"));

        let response = send_command(&mut stream, &mut reader, "QUIT");
        assert!(response.starts_with("221"));

        let delivery = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(delivery.from.as_deref(), Some("test@example.com"));
        assert_eq!(delivery.to, vec!["recipient@example.com"]);
        let message = delivery.message.unwrap();
        assert_eq!(message.subject(), Some("Test Email"));
        assert!(message.contains_text("This is a test email."));

        // end fires once, on completion rather than on QUIT
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_error_handling() {
        let (addr, _rx) = start_test_server(HandlerRegistry::new());
        let (mut stream, mut reader, _) = connect(&addr);

        let response = send_command(&mut stream, &mut reader, "INVALID");
        assert!(response.starts_with("500"));

        let response = send_command(&mut stream, &mut reader, "MAIL FROM:<test@example.com>");
        assert!(response.starts_with("503"));

        let response = send_command(&mut stream, &mut reader, "QUIT");
        assert!(response.starts_with("221"));
    }

    #[test]
    fn test_multiple_recipients() {
        let (addr, rx) = start_test_server(HandlerRegistry::new());
        let (mut stream, mut reader, _) = connect(&addr);

        send_command(&mut stream, &mut reader, "HELO client.local");
        send_command(&mut stream, &mut reader, "MAIL FROM:<sender@example.com>");
        send_command(&mut stream, &mut reader, "RCPT TO:<recipient1@example.com>");
        send_command(&mut stream, &mut reader, "RCPT TO:<recipient2@example.com>");
        send_command(&mut stream, &mut reader, "DATA");

        let response = send_body(
            &mut stream,
            &mut reader,
            "Subject: Multiple Recipients\r\n\r\nTest message for multiple recipients\r\n",
        );
        assert!(response.starts_with("250"));
        send_command(&mut stream, &mut reader, "QUIT");

        let delivery = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(
            delivery.to,
            vec!["recipient1@example.com", "recipient2@example.com"]
        );
    }

    #[test]
    fn test_rset_cannot_rewind_session() {
        let (addr, rx) = start_test_server(HandlerRegistry::new());
        let (mut stream, mut reader, _) = connect(&addr);

        send_command(&mut stream, &mut reader, "HELO client.local");
        send_command(&mut stream, &mut reader, "MAIL FROM:<sender@example.com>");
        send_command(&mut stream, &mut reader, "RCPT TO:<recipient@example.com>");

        let response = send_command(&mut stream, &mut reader, "RSET");
        assert!(response.starts_with("250"));

        // one transaction per session: the sender phase is already behind us
        let response = send_command(&mut stream, &mut reader, "MAIL FROM:<newsender@example.com>");
        assert_eq!(response, "503 Bad sequence of commands");

        send_command(&mut stream, &mut reader, "QUIT");
        let delivery = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(delivery.from.as_deref(), Some("sender@example.com"));
        assert!(delivery.message.is_none());
    }

    #[test]
    fn test_unterminated_command_line_is_rejected() {
        let (addr, _rx) = start_test_server(HandlerRegistry::new());
        let (mut stream, mut reader, _) = connect(&addr);

        stream.write_all(b"HELO ").unwrap();
        stream.write_all(&vec![b'a'; 1024 * 1024]).unwrap();
        let response = send_command(&mut stream, &mut reader, "");
        assert!(response.starts_with("500"));

        // the rest of the line was skipped, so the next command is in sync
        let response = send_command(&mut stream, &mut reader, "HELO client.local");
        assert!(response.starts_with("250"));
    }

    #[test]
    fn test_connect_rejection_closes_connection() {
        let mut registry = HandlerRegistry::new();
        registry.push(Handler::connect(|_| {
            Err(Rejection::message("Go away").into())
        }));
        let (addr, rx) = start_test_server(registry);
        let (_stream, mut reader, greeting) = connect(&addr);

        assert_eq!(greeting.trim(), "554 Go away");
        let mut rest = String::new();
        assert_eq!(reader.read_line(&mut rest).unwrap(), 0);

        let delivery = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(delivery.from.is_none());
    }

    #[test]
    fn test_data_rejection_uses_client_code() {
        let mut registry = HandlerRegistry::new();
        registry.push(Handler::data(|_, _| {
            Err(Rejection::with_client_error(
                "queue full",
                crate::error::ClientError::new("Try again later").with_code(451),
            )
            .into())
        }));
        let (addr, _rx) = start_test_server(registry);
        let (mut stream, mut reader, _) = connect(&addr);

        send_command(&mut stream, &mut reader, "HELO client.local");
        send_command(&mut stream, &mut reader, "MAIL FROM:<sender@example.com>");
        send_command(&mut stream, &mut reader, "RCPT TO:<recipient@example.com>");
        send_command(&mut stream, &mut reader, "DATA");

        let response = send_body(&mut stream, &mut reader, "Subject: x\r\n\r\nbody\r\n");
        assert_eq!(response, "451 Try again later");

        // the stream was drained, so the connection is still in sync
        let response = send_command(&mut stream, &mut reader, "NOOP");
        assert!(response.starts_with("250"));
    }

    #[test]
    fn test_text_line_too_long() {
        let (addr, _rx) = start_test_server(HandlerRegistry::new());
        let (mut stream, mut reader, _) = connect(&addr);

        send_command(&mut stream, &mut reader, "HELO client.local");
        send_command(&mut stream, &mut reader, "MAIL FROM:<sender@example.com>");
        send_command(&mut stream, &mut reader, "RCPT TO:<recipient@example.com>");
        send_command(&mut stream, &mut reader, "DATA");

        let long_line = "a".repeat(SmtpLimits::TEXT_LINE_MAX_LENGTH + 10);
        let response = send_body(&mut stream, &mut reader, &format!("{long_line}\r\n"));
        assert!(response.starts_with("500"));

        let response = send_command(&mut stream, &mut reader, "MAIL FROM:<again@example.com>");
        assert!(response.starts_with("503"));
    }

    #[cfg(feature = "ehlo")]
    #[test]
    fn test_ehlo_command() {
        let (addr, rx) = start_test_server(HandlerRegistry::new());
        let (mut stream, mut reader, _) = connect(&addr);

        write!(stream, "EHLO client.local\r\n").unwrap();
        stream.flush().unwrap();
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let last = line.as_bytes().get(3) == Some(&b' ');
            lines.push(line);
            if last {
                break;
            }
        }
        assert!(lines[0].starts_with("250-test.local Hello client.local"));

        send_command(&mut stream, &mut reader, "MAIL FROM:<test@example.com>");
        send_command(&mut stream, &mut reader, "RCPT TO:<recipient@example.com>");
        send_command(&mut stream, &mut reader, "DATA");
        let response = send_body(
            &mut stream,
            &mut reader,
            "Subject: EHLO Test Email\r\n\r\nThis is a test.\r\n",
        );
        assert!(response.starts_with("250"));
        send_command(&mut stream, &mut reader, "QUIT");

        let delivery = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(
            delivery.message.unwrap().subject(),
            Some("EHLO Test Email")
        );
    }
}
