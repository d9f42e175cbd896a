//! Module with [`Channel`], a single client connection.
//!
//! The channel is shared between the [`Server`]'s reactor thread and the
//! worker threads. The reactor reads bytes from the connection, passing them
//! to the request parser, and flushes the output buffers to the connection.
//! A worker thread services the completed requests using a [`Task`], writing
//! the response to the output buffers.
//!
//! At most one task per channel is in service at a time, which ensures the
//! responses are written in the same order as the requests were received.
//!
//! [`Server`]: crate::Server

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use log::{debug, error, info, trace};

use crate::buffer::{Buffer, FileWrapper, OutBuf};
use crate::dispatcher::{Dispatch, Job};
use crate::task::Task;
use crate::{parser, Application, Config, Error, RequestError};

/// Maximum number of bytes passed to [`Socket::send`] at a time.
const MAX_SEND_SIZE: usize = 256 * 1024;

/// Response to `Expect: 100-continue`.
const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Connection used by a [`Channel`].
///
/// Implemented for [`mio::net::TcpStream`]. Both `recv` and `send` must not
/// block, but return [`io::ErrorKind::WouldBlock`] instead.
pub trait Socket: Send + Sync {
    /// Receive bytes into `buf`, returning 0 if the peer closed the
    /// connection.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send bytes from `buf`, returning the number of bytes send.
    fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Close the connection.
    fn close(&self) -> io::Result<()>;
}

impl Socket for mio::net::TcpStream {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn close(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

/// Data written to a [`Channel`], see [`Channel::write_soon`].
#[derive(Debug)]
pub enum Payload<'a> {
    /// Bytes, copied into the output buffers.
    Bytes(&'a [u8]),
    /// A file, send as its own output buffer.
    File(FileWrapper),
}

impl<'a> From<&'a [u8]> for Payload<'a> {
    fn from(bytes: &'a [u8]) -> Payload<'a> {
        Payload::Bytes(bytes)
    }
}

impl<'a> From<FileWrapper> for Payload<'a> {
    fn from(file: FileWrapper) -> Payload<'a> {
        Payload::File(file)
    }
}

/// Context shared by all channels of a server.
pub struct ServerContext {
    pub(crate) config: Arc<Config>,
    pub(crate) application: Arc<dyn Application>,
    pub(crate) dispatcher: Arc<dyn Dispatch>,
    pub(crate) trigger: Option<Arc<mio::Waker>>,
    /// `SERVER_NAME`.
    pub(crate) server_name: String,
    /// `SERVER_PORT`, the port the server is actually bound to.
    pub(crate) effective_port: u16,
}

impl ServerContext {
    /// Create a new context.
    ///
    /// The server name and port are determined by [`Config::listen`].
    pub fn new(
        config: Arc<Config>,
        application: Arc<dyn Application>,
        dispatcher: Arc<dyn Dispatch>,
    ) -> ServerContext {
        let address = config.listen;
        ServerContext {
            server_name: config.server_name_for(address),
            effective_port: address.port(),
            config,
            application,
            dispatcher,
            trigger: None,
        }
    }

    /// Use `address` as the address the server is bound to.
    pub(crate) fn with_address(mut self, address: SocketAddr) -> ServerContext {
        self.server_name = self.config.server_name_for(address);
        self.effective_port = address.port();
        self
    }

    /// Use `waker` to wake up the server's reactor.
    pub(crate) fn with_trigger(mut self, waker: Arc<mio::Waker>) -> ServerContext {
        self.trigger = Some(waker);
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the server name, `SERVER_NAME`.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Returns the port the server is bound to, `SERVER_PORT`.
    pub const fn effective_port(&self) -> u16 {
        self.effective_port
    }

    /// Wake up the reactor, so it checks the channels again for output to
    /// flush.
    pub(crate) fn pull_trigger(&self) {
        if let Some(waker) = &self.trigger {
            if let Err(err) = waker.wake() {
                error!(error:% = err; "failed to wake up server");
            }
        }
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("config", &self.config)
            .field("server_name", &self.server_name)
            .field("effective_port", &self.effective_port)
            .finish()
    }
}

/// A single client connection.
pub struct Channel {
    /// Ourselves, used to add the channel as job to the dispatcher.
    me: Weak<Channel>,
    socket: Box<dyn Socket>,
    addr: SocketAddr,
    context: Arc<ServerContext>,
    /// Buffer to read into, reused for all reads.
    recv_buf: Mutex<Vec<u8>>,
    requests: Mutex<Requests>,
    outbufs: Mutex<OutBufs>,
    /// Notified when output is flushed or the channel is closed, waited upon
    /// by writers when too much output is buffered.
    outbuf_cond: Condvar,
    /// Total number of bytes in `outbufs`, only modified with the `outbufs`
    /// lock held.
    total_outbufs_len: AtomicU64,
    connected: AtomicBool,
    will_close: AtomicBool,
    close_when_flushed: AtomicBool,
    last_activity: Mutex<Instant>,
    creation_time: Instant,
}

/// Requests of a channel.
struct Requests {
    /// Request being received.
    current: Option<parser::Request>,
    /// Completely received requests, waiting to be serviced.
    ready: VecDeque<parser::Request>,
    /// Whether or not a task is in service.
    in_service: bool,
    /// Whether or not `100 Continue` was send for `current`.
    sent_continue: bool,
}

impl Requests {
    /// Number of requests serviced or waiting to be serviced.
    fn pending(&self) -> usize {
        self.ready.len() + usize::from(self.in_service)
    }
}

/// Output buffers of a channel.
struct OutBufs {
    /// Never empty, the last buffer is always a bytes buffer.
    bufs: VecDeque<OutBuf>,
    /// Number of bytes written to the last buffer.
    current_count: u64,
}

impl Channel {
    /// Create a new channel for the connection `socket`, connected to `addr`.
    pub fn new(socket: Box<dyn Socket>, addr: SocketAddr, context: Arc<ServerContext>) -> Arc<Channel> {
        let now = Instant::now();
        let overflow = context.config.outbuf_overflow;
        Arc::new_cyclic(|me| Channel {
            me: me.clone(),
            socket,
            addr,
            context,
            recv_buf: Mutex::new(Vec::new()),
            requests: Mutex::new(Requests {
                current: None,
                ready: VecDeque::new(),
                in_service: false,
                sent_continue: false,
            }),
            outbufs: Mutex::new(OutBufs {
                bufs: VecDeque::from([OutBuf::new(overflow)]),
                current_count: 0,
            }),
            outbuf_cond: Condvar::new(),
            total_outbufs_len: AtomicU64::new(0),
            connected: AtomicBool::new(true),
            will_close: AtomicBool::new(false),
            close_when_flushed: AtomicBool::new(false),
            last_activity: Mutex::new(now),
            creation_time: now,
        })
    }

    /// Returns the address of the client.
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the server context.
    pub fn context(&self) -> &ServerContext {
        &self.context
    }

    /// Returns `true` if the connection is still open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Returns `true` if the channel will be closed once possible.
    pub fn will_close(&self) -> bool {
        self.will_close.load(Ordering::Acquire)
    }

    /// Returns `true` if the channel will be closed once all output is
    /// flushed.
    pub fn close_when_flushed(&self) -> bool {
        self.close_when_flushed.load(Ordering::Acquire)
    }

    /// Returns the last time bytes were received or send.
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the time the channel was created.
    pub const fn creation_time(&self) -> Instant {
        self.creation_time
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn lock_requests(&self) -> MutexGuard<'_, Requests> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_outbufs(&self) -> MutexGuard<'_, OutBufs> {
        self.outbufs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the number of requests in service or waiting to be serviced.
    pub fn pending_requests(&self) -> usize {
        self.lock_requests().pending()
    }

    /// Returns the total number of bytes buffered for sending.
    pub fn total_outbufs_len(&self) -> u64 {
        self.total_outbufs_len.load(Ordering::Acquire)
    }

    /// Returns `true` if the channel wants to read more requests.
    ///
    /// This is not the case when we're closing the channel, or when requests
    /// are still pending or output is still buffered.
    pub fn readable(&self) -> bool {
        !(self.will_close()
            || self.close_when_flushed()
            || self.pending_requests() > 0
            || self.total_outbufs_len() > 0)
    }

    /// Returns `true` if the channel wants to write, i.e. it has buffered
    /// output or it needs to be closed.
    pub fn writable(&self) -> bool {
        self.total_outbufs_len() > 0 || self.will_close() || self.close_when_flushed()
    }

    /// Read from the connection, called when the connection is readable.
    pub fn handle_read(&self) {
        let mut buf = self.recv_buf.lock().unwrap_or_else(PoisonError::into_inner);
        buf.resize(self.context.config.recv_bytes, 0);
        match self.socket.recv(&mut buf[..]) {
            Ok(0) => {
                debug!(address:% = self.addr; "client closed connection");
                self.handle_close();
            }
            Ok(n) => {
                self.touch();
                let _ = self.received(&buf[..n]);
            }
            Err(ref err) if is_retryable(err) => {}
            Err(err) => {
                if self.context.config.log_socket_errors {
                    error!(address:% = self.addr, error:% = err; "socket error reading from connection");
                }
                self.handle_close();
            }
        }
    }

    /// Process received bytes, adding completed requests to the server's
    /// dispatcher.
    ///
    /// Returns `false` if `data` is empty.
    pub fn received(&self, mut data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }

        let config = &self.context.config;
        let mut requests = self.lock_requests();
        let Requests {
            current,
            ready,
            in_service,
            sent_continue,
        } = &mut *requests;
        while !data.is_empty() {
            let request = current.get_or_insert_with(|| parser::Request::new(config));
            let n = request.received(data);

            // If requests are queued we can't send the continue response yet,
            // responses need to be send in order.
            if request.expect_continue()
                && request.headers_finished()
                && ready.is_empty()
                && !*in_service
                && !*sent_continue
            {
                request.continue_sent();
                *sent_continue = true;
                self.send_continue();
            }

            if request.is_completed() {
                *sent_continue = false;
                if let Some(request) = current.take() {
                    if !request.is_empty() {
                        trace!(address:% = self.addr, path = request.path(); "received request");
                        let close = request.connection_close() || request.error().is_some();
                        let idle = ready.is_empty() && !*in_service;
                        ready.push_back(request);
                        if idle {
                            // Otherwise `service` adds the task after the
                            // request in service is done.
                            self.add_task();
                        }
                        if close {
                            // Everything after this request is ignored.
                            break;
                        }
                    }
                }
            }

            if n >= data.len() {
                break;
            }
            data = &data[n..];
        }
        true
    }

    /// Add ourselves to the dispatcher to service the next request.
    fn add_task(&self) {
        if let Some(me) = self.me.upgrade() {
            if let Err(err) = self.context.dispatcher.add_task(me) {
                error!(address:% = self.addr, error:% = err; "failed to add task");
                self.will_close.store(true, Ordering::Release);
            }
        }
    }

    /// Send `100 Continue`, bypassing the ordering of responses.
    fn send_continue(&self) {
        let mut outbufs = self.lock_outbufs();
        if let Err(err) = self.append(&mut outbufs, CONTINUE) {
            error!(address:% = self.addr, error:% = err; "failed to buffer continue response");
            self.will_close.store(true, Ordering::Release);
            return;
        }
        if let Err(err) = self.flush_some(&mut outbufs) {
            self.flush_error(&err);
        }
    }

    /// Append `data` to the last output buffer.
    fn append(&self, outbufs: &mut OutBufs, data: &[u8]) -> io::Result<()> {
        if outbufs.bufs.is_empty() {
            let overflow = self.context.config.outbuf_overflow;
            outbufs.bufs.push_back(OutBuf::new(overflow));
            outbufs.current_count = 0;
        }
        if let Some(last) = outbufs.bufs.back_mut() {
            last.append(data)?;
        }
        outbufs.current_count += data.len() as u64;
        let _ = self
            .total_outbufs_len
            .fetch_add(data.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    /// Flush output, called when the connection is writable.
    pub fn handle_write(&self) {
        if !self.is_connected() {
            return;
        }

        let pending = self.pending_requests();
        let total = self.total_outbufs_len();
        let result = if pending == 0 {
            // No task is writing, flush everything we got.
            let mut outbufs = self.lock_outbufs();
            let result = self.flush_some(&mut outbufs);
            self.outbuf_cond.notify_all();
            result
        } else if total >= self.context.config.send_bytes {
            // A task is writing, only flush if we don't have to wait for it
            // and if we have enough bytes to make it worth while.
            match self.outbufs.try_lock() {
                Ok(mut outbufs) => {
                    let result = self.flush_some(&mut outbufs);
                    if self.total_outbufs_len() < self.context.config.outbuf_high_watermark {
                        self.outbuf_cond.notify_all();
                    }
                    result
                }
                Err(_) => Ok(false),
            }
        } else {
            Ok(false)
        };
        if let Err(err) = result {
            self.flush_error(&err);
        }

        if self.close_when_flushed() && self.total_outbufs_len() == 0 {
            self.close_when_flushed.store(false, Ordering::Release);
            self.will_close.store(true, Ordering::Release);
        }

        if self.will_close() {
            self.handle_close();
        }
    }

    fn flush_error(&self, err: &io::Error) {
        if self.context.config.log_socket_errors {
            error!(address:% = self.addr, error:% = err; "socket error writing to connection");
        }
        self.will_close.store(true, Ordering::Release);
    }

    /// Send as much output as possible without blocking.
    ///
    /// Returns `true` if any bytes were send.
    fn flush_some(&self, outbufs: &mut OutBufs) -> io::Result<bool> {
        let mut sent = 0;
        loop {
            let outbuf = match outbufs.bufs.front_mut() {
                Some(outbuf) => outbuf,
                None => break,
            };
            let mut len = outbuf.len();
            let mut blocked = false;
            while len > 0 {
                let chunk = outbuf.get(MAX_SEND_SIZE)?;
                let n = match self.socket.send(&chunk) {
                    Ok(n) => n,
                    Err(ref err) if is_retryable(err) => 0,
                    Err(err) => return Err(err),
                };
                if n == 0 {
                    blocked = true;
                    break;
                }
                outbuf.skip(n as u64)?;
                len -= n as u64;
                sent += n as u64;
                let _ = self.total_outbufs_len.fetch_sub(n as u64, Ordering::AcqRel);
            }
            if blocked {
                break;
            }

            if outbufs.bufs.len() > 1 {
                if let Some(mut outbuf) = outbufs.bufs.pop_front() {
                    if let Err(err) = outbuf.close() {
                        error!(error:% = err; "failed to close output buffer");
                    }
                }
            } else {
                // Caught up, the last buffer stays for writing.
                break;
            }
        }

        if sent > 0 {
            trace!(address:% = self.addr, sent = sent; "flushed output");
            self.touch();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Close the channel, releasing the output buffers and closing the
    /// connection.
    pub fn handle_close(&self) {
        let was_connected = {
            let mut outbufs = self.lock_outbufs();
            for outbuf in outbufs.bufs.iter_mut() {
                // Close all buffers, even if one fails.
                if let Err(err) = outbuf.close() {
                    error!(error:% = err; "failed to close output buffer");
                }
            }
            self.total_outbufs_len.store(0, Ordering::Release);
            let was_connected = self.connected.swap(false, Ordering::AcqRel);
            self.outbuf_cond.notify_all();
            was_connected
        };
        if was_connected {
            if let Err(err) = self.socket.close() {
                trace!(address:% = self.addr, error:% = err; "error closing connection");
            }
            debug!(address:% = self.addr; "closed connection");
        }
    }

    /// Write `payload` to the connection, once the reactor can.
    ///
    /// Bytes are appended to the last output buffer. Files are added as their
    /// own output buffer, followed by a new buffer for bytes written after
    /// it. Blocks while more than [`Config::outbuf_high_watermark`] bytes are
    /// buffered.
    ///
    /// Returns the number of bytes queued, or [`Error::ClientDisconnected`]
    /// if the channel is closed.
    pub fn write_soon(&self, payload: Payload<'_>) -> Result<u64, Error> {
        if !self.is_connected() {
            // Interrupts the task, so it stops producing output.
            return Err(Error::ClientDisconnected);
        }

        let config = &self.context.config;
        let len = match &payload {
            Payload::Bytes(data) => data.len() as u64,
            Payload::File(file) => file.len(),
        };
        if len == 0 {
            return Ok(0);
        }

        let outbufs = self.lock_outbufs();
        let mut outbufs = self.wait_below_high_watermark(outbufs);
        if !self.is_connected() {
            return Err(Error::ClientDisconnected);
        }
        match payload {
            Payload::Bytes(data) => {
                if outbufs.current_count >= config.outbuf_high_watermark {
                    // Rotate to a new buffer to avoid it growing unbounded.
                    outbufs.bufs.push_back(OutBuf::new(config.outbuf_overflow));
                    outbufs.current_count = 0;
                }
                self.append(&mut outbufs, data)?;
            }
            Payload::File(file) => {
                outbufs.bufs.push_back(OutBuf::File(file));
                outbufs.bufs.push_back(OutBuf::new(config.outbuf_overflow));
                outbufs.current_count = 0;
                let _ = self.total_outbufs_len.fetch_add(len, Ordering::AcqRel);
            }
        }
        drop(outbufs);

        if self.total_outbufs_len() >= config.send_bytes {
            self.context.pull_trigger();
        }
        Ok(len)
    }

    /// Block until the output is below the high watermark (or the channel is
    /// closed).
    fn wait_below_high_watermark<'a>(
        &self,
        mut outbufs: MutexGuard<'a, OutBufs>,
    ) -> MutexGuard<'a, OutBufs> {
        let high_watermark = self.context.config.outbuf_high_watermark;
        while self.is_connected() && self.total_outbufs_len() > high_watermark {
            self.context.pull_trigger();
            outbufs = self
                .outbuf_cond
                .wait_timeout(outbufs, Duration::from_millis(100))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        outbufs
    }

    /// Service the next request.
    ///
    /// Called on a worker thread. If more requests are ready after servicing
    /// the request the channel adds itself to the dispatcher again.
    pub fn service(&self) {
        let request = {
            let mut requests = self.lock_requests();
            if requests.in_service {
                error!(address:% = self.addr; "channel already has a task in service");
                return;
            }
            match requests.ready.pop_front() {
                Some(request) => {
                    requests.in_service = true;
                    request
                }
                None => return,
            }
        };

        let mut task = Task::new(self, request);
        let result = if self.is_connected() {
            panic::catch_unwind(AssertUnwindSafe(|| task.service()))
                .unwrap_or_else(|panic| Err(Error::panic(panic)))
        } else {
            task.set_close_on_finish();
            Ok(())
        };

        match result {
            Ok(()) => {}
            Err(Error::ClientDisconnected) => {
                info!(address:% = self.addr, path = task.request().path(); "client disconnected while serving request");
                task.set_close_on_finish();
            }
            Err(err) => {
                error!(address:% = self.addr, path = task.request().path(), error:% = err; "error while serving request");
                if !task.wrote_header() {
                    self.service_internal_error(&task, &err);
                }
                // Either the error response or the partial response is the
                // last response on this connection.
                task.set_close_on_finish();
            }
        }

        let close = task.close_on_finish();
        // Releases the request.
        drop(task);

        if close {
            let mut requests = self.lock_requests();
            self.close_when_flushed.store(true, Ordering::Release);
            requests.ready.clear();
            requests.in_service = false;
        } else {
            if !self.lock_requests().ready.is_empty() {
                let outbufs = self.lock_outbufs();
                drop(self.wait_below_high_watermark(outbufs));
            }

            {
                // Force the next request to use a new output buffer, so
                // buffers are released regularly on long lived connections.
                let mut outbufs = self.lock_outbufs();
                if outbufs.current_count > 0 {
                    outbufs.current_count = self.context.config.outbuf_high_watermark;
                }
            }

            let mut requests = self.lock_requests();
            requests.in_service = false;
            let continue_pending = requests.current.as_ref().map_or(false, |request| {
                request.expect_continue() && request.headers_finished()
            });
            if self.is_connected() && !requests.ready.is_empty() {
                self.add_task();
            } else if self.is_connected() && continue_pending && !requests.sent_continue {
                // Couldn't send it while requests were being processed, as
                // the output needs to be kept in order.
                if let Some(request) = requests.current.as_mut() {
                    request.continue_sent();
                }
                requests.sent_continue = true;
                self.send_continue();
            }
        }

        if self.is_connected() {
            self.context.pull_trigger();
        }
        self.touch();
    }

    /// Respond with `500 Internal Server Error` to the request of `task`.
    fn service_internal_error(&self, task: &Task<'_>, err: &Error) {
        let config = &self.context.config;
        let detail = if config.expose_tracebacks {
            err.to_string()
        } else {
            "The server encountered an unexpected internal server error".to_owned()
        };
        let request = parser::Request::with_error(
            config,
            RequestError::InternalServerError(detail),
            task.version(),
            task.request().header("CONNECTION").map(str::to_owned),
        );
        let mut error_task = Task::new(self, request);
        if let Err(err) = error_task.service() {
            debug!(address:% = self.addr, error:% = err; "failed to write error response");
        }
    }

    /// Cancel all pending requests and close the channel.
    pub fn cancel(&self) {
        self.will_close.store(true, Ordering::Release);
        self.connected.store(false, Ordering::Release);
        self.touch();
        self.lock_requests().ready.clear();
    }

    /// Mark the channel to be closed if it's idle for longer than `timeout`.
    ///
    /// Returns `true` if the channel will be closed.
    pub(crate) fn check_timeout(&self, now: Instant, timeout: Duration) -> bool {
        if self.pending_requests() == 0 && now.saturating_duration_since(self.last_activity()) > timeout {
            debug!(address:% = self.addr; "closing idle connection");
            self.will_close.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }
}

impl Job for Channel {
    fn service(&self) {
        Channel::service(self);
    }

    fn cancel(&self) {
        Channel::cancel(self);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("addr", &self.addr)
            .field("connected", &self.is_connected())
            .field("will_close", &self.will_close())
            .field("close_when_flushed", &self.close_when_flushed())
            .field("total_outbufs_len", &self.total_outbufs_len())
            .field("creation_time", &self.creation_time)
            .finish()
    }
}

/// Returns `true` if the operation can be retried once the connection is
/// ready again.
fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
