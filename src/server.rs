//! Module with the [`Server`], running the reactor.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use std::{fmt, io};

use log::{debug, error, info, trace, warn};
use mio::net::TcpListener;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use socket2::{Domain, Protocol, Type};

use crate::channel::{Channel, ServerContext};
use crate::dispatcher::ThreadedTaskDispatcher;
use crate::{Application, Config};

/// Token used for the listener.
const LISTENER: Token = Token(0);
/// Token used to wake up the reactor.
const WAKER: Token = Token(1);
/// First token used for a connection.
const FIRST_CHANNEL: usize = 2;

/// HTTP server.
///
/// The server runs a single reactor thread (the thread calling
/// [`Server::run`]) that accepts connections and reads and writes all
/// connection's bytes. Requests are handled by the application on a pool of
/// worker threads, see [`ThreadedTaskDispatcher`].
///
/// # Examples
///
/// ```no_run
/// use hearth::{AppError, Body, Config, Environ, Server, StartResponse};
///
/// fn app(_: Environ, start_response: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
///     start_response.start("200 OK", Vec::new())?;
///     Ok(Body::from("Hello world"))
/// }
///
/// # fn main() -> std::io::Result<()> {
/// let server = Server::bind(Config::default(), app)?;
/// server.run()
/// # }
/// ```
pub struct Server {
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    /// Whether or not the listener is registered, i.e. we're accepting
    /// connections.
    accepting: bool,
    context: Arc<ServerContext>,
    dispatcher: Arc<ThreadedTaskDispatcher>,
    channels: HashMap<Token, Connection>,
    next_token: usize,
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

/// Connection registered with the reactor.
struct Connection {
    fd: RawFd,
    channel: Arc<Channel>,
    /// Currently registered interest, if any.
    interest: Option<Interest>,
}

impl Server {
    /// Bind a new server to [`Config::listen`], using `application` to
    /// handle requests.
    pub fn bind<A>(config: Config, application: A) -> io::Result<Server>
    where
        A: Application,
    {
        let address = config.listen;
        let socket = socket2::Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&address.into())?;
        socket.listen(config.backlog)?;
        let mut listener = TcpListener::from_std(socket.into());
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let dispatcher = Arc::new(ThreadedTaskDispatcher::new());
        let context = ServerContext::new(Arc::new(config), Arc::new(application), dispatcher.clone())
            .with_address(local_addr)
            .with_trigger(waker.clone());
        debug!(address:% = local_addr; "bound server");

        Ok(Server {
            poll,
            listener,
            local_addr,
            accepting: true,
            context: Arc::new(context),
            dispatcher,
            channels: HashMap::new(),
            next_token: FIRST_CHANNEL,
            shutdown: Arc::new(AtomicBool::new(false)),
            waker,
        })
    }

    /// Returns the address the server is bound to.
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns a handle to shut down the server.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shutdown.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Run the server until it's shut down using [`ServerHandle::shutdown`].
    pub fn run(mut self) -> io::Result<()> {
        let config = self.context.config.clone();
        self.dispatcher.set_thread_count(config.threads)?;
        info!(address:% = self.local_addr, threads = config.threads; "serving requests");

        let mut events = Events::with_capacity(128);
        let mut last_maintenance = Instant::now();
        while !self.shutdown.load(Ordering::Acquire) {
            self.update_interests();

            trace!("polling for events");
            if let Err(err) = self.poll.poll(&mut events, Some(config.poll_timeout)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept(),
                    // Only wakes us up to update the interests.
                    WAKER => {}
                    token => {
                        let channel = match self.channels.get(&token) {
                            Some(connection) => connection.channel.clone(),
                            None => continue,
                        };
                        if (event.is_readable() || event.is_read_closed()) && channel.readable() {
                            channel.handle_read();
                        }
                        if event.is_writable() && channel.writable() {
                            channel.handle_write();
                        }
                        if event.is_error() {
                            channel.handle_close();
                        }
                    }
                }
            }

            self.remove_closed();
            let now = Instant::now();
            if now.duration_since(last_maintenance) >= config.cleanup_interval {
                self.maintenance(now);
                last_maintenance = now;
            }
        }

        info!(address:% = self.local_addr; "shutting down server");
        for connection in self.channels.values() {
            connection.channel.handle_close();
        }
        self.channels.clear();
        if !self.dispatcher.shutdown(true, config.shutdown_timeout) {
            warn!("not all worker threads stopped");
        }
        Ok(())
    }

    /// Accept connections until either we would block or we're at the
    /// connection limit.
    fn accept(&mut self) {
        let limit = self.context.config.connection_limit;
        loop {
            if self.channels.len() >= limit {
                if self.accepting {
                    warn!(limit = limit; "connection limit reached, not accepting new connections");
                    if let Err(err) = self.poll.registry().deregister(&mut self.listener) {
                        error!(error:% = err; "failed to deregister listener");
                    }
                    self.accepting = false;
                }
                return;
            }

            let (stream, address) = match self.listener.accept() {
                Ok(ok) => ok,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!(error:% = err; "failed to accept connection");
                    return;
                }
            };
            debug!(address:% = address; "accepted connection");
            let fd = stream.as_raw_fd();
            let channel = Channel::new(Box::new(stream), address, self.context.clone());
            let token = Token(self.next_token);
            self.next_token = self.next_token.wrapping_add(1).max(FIRST_CHANNEL);
            let _ = self.channels.insert(
                token,
                Connection {
                    fd,
                    channel,
                    interest: None,
                },
            );
        }
    }

    /// Update the interest of all channels (and the listener).
    ///
    /// Channels are always reregistered, which rearms the readiness
    /// notifications.
    fn update_interests(&mut self) {
        let registry = self.poll.registry();
        if !self.accepting && self.channels.len() < self.context.config.connection_limit {
            match registry.register(&mut self.listener, LISTENER, Interest::READABLE) {
                Ok(()) => {
                    debug!("accepting connections again");
                    self.accepting = true;
                }
                Err(err) => error!(error:% = err; "failed to register listener"),
            }
        }

        for (token, connection) in &mut self.channels {
            let channel = connection.channel.clone();
            if !channel.is_connected() {
                continue;
            }
            let mut interest = None;
            if channel.readable() {
                interest = Some(Interest::READABLE);
            }
            if channel.writable() {
                interest = Some(interest.map_or(Interest::WRITABLE, |i| i | Interest::WRITABLE));
            }
            if let Err(err) = update_interest(registry, *token, connection, interest) {
                error!(address:% = channel.addr(), error:% = err; "failed to register connection");
                channel.handle_close();
            }
        }
    }

    /// Remove all channels that are closed.
    fn remove_closed(&mut self) {
        let registry = self.poll.registry();
        self.channels.retain(|_, connection| {
            if connection.channel.is_connected() {
                return true;
            }
            if connection.interest.is_some() {
                if let Err(err) = registry.deregister(&mut SourceFd(&connection.fd)) {
                    trace!(error:% = err; "failed to deregister connection");
                }
            }
            false
        });
    }

    /// Close channels that are idle for too long.
    fn maintenance(&self, now: Instant) {
        let timeout = self.context.config.channel_timeout;
        for connection in self.channels.values() {
            let _ = connection.channel.check_timeout(now, timeout);
        }
    }
}

fn update_interest(
    registry: &Registry,
    token: Token,
    connection: &mut Connection,
    interest: Option<Interest>,
) -> io::Result<()> {
    let mut source = SourceFd(&connection.fd);
    match (connection.interest, interest) {
        (None, Some(interest)) => registry.register(&mut source, token, interest)?,
        (Some(_), Some(interest)) => registry.reregister(&mut source, token, interest)?,
        (Some(_), None) => registry.deregister(&mut source)?,
        (None, None) => {}
    }
    connection.interest = interest;
    Ok(())
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("accepting", &self.accepting)
            .field("channels", &self.channels.len())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

/// Handle to shut down a [`Server`].
#[derive(Clone, Debug)]
pub struct ServerHandle {
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ServerHandle {
    /// Shut down the server.
    ///
    /// All connections are closed, requests waiting to be serviced are
    /// cancelled and [`Server::run`] returns once the worker threads are
    /// stopped (or [`Config::shutdown_timeout`] expires).
    pub fn shutdown(&self) -> io::Result<()> {
        self.shutdown.store(true, Ordering::Release);
        self.waker.wake()
    }
}
