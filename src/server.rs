//! Handler registration and the TCP listener

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use log::{info, warn};

use crate::dispatch::{Dispatcher, Event, Observer};
use crate::error::{HandlerResult, UsemailError};
use crate::handlers::{Handler, HandlerRegistry};
use crate::session::Session;
use crate::smtp::connection::handle_client;

/// Server settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Name announced in the greeting and HELO replies
    pub hostname: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: "usemail.local".to_owned(),
        }
    }
}

/// Collects handlers and observers, then starts listening.
///
/// Registration happens before [`Usemail::listen`]; after that the chains are
/// frozen and shared by every connection.
#[derive(Default)]
pub struct Usemail {
    config: Config,
    handlers: HandlerRegistry,
    observers: Vec<Observer>,
}

impl Usemail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            config,
            handlers: HandlerRegistry::new(),
            observers: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Append `handler` to the chain of the phase called `phase`
    /// (`connect`, `from`, `to`, `use` or its alias `data`).
    pub fn register(&mut self, phase: &str, handler: Handler) -> Result<&mut Self, UsemailError> {
        self.handlers.register(phase, handler)?;
        Ok(self)
    }

    pub fn on_connect<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut Session) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers.push(Handler::connect(f));
        self
    }

    pub fn on_from<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&str, &mut Session) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers.push(Handler::sender(f));
        self
    }

    pub fn on_to<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&str, &mut Session) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers.push(Handler::recipient(f));
        self
    }

    pub fn on_data<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut Session, &mut dyn std::io::Read) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers.push(Handler::data(f));
        self
    }

    /// Subscribe to phase, failure and end notifications
    pub fn on_event<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&Event<'_>) + Send + Sync + 'static,
    {
        self.observers.push(Box::new(f));
        self
    }

    /// Freeze the registered chains without starting a listener
    pub fn into_dispatcher(self) -> Dispatcher {
        Dispatcher::new(self.handlers, self.observers)
    }

    /// Bind `addr` and start accepting connections in the background
    pub fn listen(self, addr: impl ToSocketAddrs) -> Result<Server, UsemailError> {
        let listener = TcpListener::bind(addr)?;
        self.serve(listener)
    }

    /// Start accepting connections on an already bound listener
    pub fn serve(self, listener: TcpListener) -> Result<Server, UsemailError> {
        let local_addr = listener.local_addr()?;
        let hostname: Arc<str> = Arc::from(self.config.hostname.as_str());
        let dispatcher = Arc::new(self.into_dispatcher());
        let shutdown = Arc::new(AtomicBool::new(false));

        let accept = {
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("usemail-accept".to_owned())
                .spawn(move || accept_loop(listener, dispatcher, hostname, shutdown))?
        };

        info!("SMTP server listening on {local_addr}");
        Ok(Server {
            local_addr,
            shutdown,
            accept: Some(accept),
        })
    }
}

impl fmt::Debug for Usemail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Usemail")
            .field("config", &self.config)
            .field("handlers", &self.handlers)
            .field("observers", &self.observers.len())
            .finish()
    }
}

fn accept_loop(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    hostname: Arc<str>,
    shutdown: Arc<AtomicBool>,
) {
    for stream in listener.incoming() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        match stream {
            Ok(stream) => {
                let dispatcher = Arc::clone(&dispatcher);
                let hostname = Arc::clone(&hostname);
                let spawned = thread::Builder::new()
                    .name("usemail-conn".to_owned())
                    .spawn(move || {
                        if let Err(e) = handle_client(stream, &dispatcher, &hostname) {
                            warn!("Error handling client: {e}");
                        }
                    });
                if let Err(e) = spawned {
                    warn!("Error spawning connection thread: {e}");
                }
            }
            Err(e) => {
                warn!("Error accepting connection: {e}");
            }
        }
    }
}

/// A running listener. Dropping it stops accepting new connections;
/// connections already accepted run to completion.
#[derive(Debug)]
pub struct Server {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    accept: Option<JoinHandle<()>>,
}

impl Server {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn address(&self) -> IpAddr {
        self.local_addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop accepting connections and wait for the listener thread
    pub fn close(mut self) {
        self.stop();
    }

    /// Block until the listener thread exits
    pub fn join(mut self) {
        if let Some(accept) = self.accept.take() {
            if accept.join().is_err() {
                warn!("listener thread for {} panicked", self.local_addr);
            }
        }
    }

    fn stop(&mut self) {
        let Some(accept) = self.accept.take() else {
            return;
        };

        self.shutdown.store(true, Ordering::SeqCst);

        // Wake the blocking accept call
        let mut wake_addr = self.local_addr;
        if wake_addr.ip().is_unspecified() {
            wake_addr.set_ip(match wake_addr {
                SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            });
        }
        if let Err(e) = TcpStream::connect(wake_addr) {
            // The thread exits on the next accepted connection instead
            warn!("could not wake listener on {wake_addr}: {e}");
            return;
        }

        if accept.join().is_err() {
            warn!("listener thread for {} panicked", self.local_addr);
        }
        info!("SMTP server on {} closed", self.local_addr);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
