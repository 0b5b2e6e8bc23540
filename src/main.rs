use clap::Parser;
use log::{error, info};
use usemail::{Config, Event, MESSAGE_KEY, Message, Usemail, message};

/// SMTP server that logs every transaction it receives
#[derive(Parser, Debug)]
#[command(name = "usemail", version, about)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "USEMAIL_ADDR", default_value = "127.0.0.1:2525")]
    addr: String,

    /// Hostname announced to clients
    #[arg(long, env = "USEMAIL_HOSTNAME", default_value = "usemail.local")]
    hostname: String,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    info!("Starting usemail SMTP server...");
    info!("Address: {}", args.addr);
    info!("Hostname: {}", args.hostname);

    let mut usemail = Usemail::with_config(Config {
        hostname: args.hostname,
    });
    usemail
        .on_from(|address, session| {
            info!("session {}: sender {address}", session.id());
            Ok(())
        })
        .on_to(|address, session| {
            info!("session {}: recipient {address}", session.id());
            Ok(())
        })
        .on_event(|event| match event {
            Event::Failed {
                phase,
                error,
                session,
            } => error!("session {}: {phase} failed: {error}", session.id()),
            Event::End { session } => {
                let Some(message) = session.get::<Message>(MESSAGE_KEY) else {
                    info!("session {} ended without a message", session.id());
                    return;
                };
                info!(
                    "Received message from: {} to: {:?}",
                    session.from().unwrap_or("<>"),
                    session.to()
                );
                if let Some(subject) = message.subject() {
                    info!("  Subject: {subject}");
                }
            }
            Event::Phase { .. } => {}
        });

    if let Err(e) = usemail.register("use", message::parser()) {
        error!("Failed to register message parser: {e}");
        std::process::exit(1);
    }

    let server = match usemail.listen(args.addr.as_str()) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start server: {e}");
            std::process::exit(1);
        }
    };

    server.join();
}
