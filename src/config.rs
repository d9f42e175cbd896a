//! Module with [`Config`].

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Configuration of the [`Server`] and the components it uses.
///
/// This type implements a builder pattern, it is created via
/// [`Config::default`] after which the setter methods can be used to change
/// the configuration.
///
/// [`Server`]: crate::Server
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use hearth::Config;
///
/// let config = Config::default()
///     .listen(([127, 0, 0, 1], 8000).into())
///     .threads(8)
///     .url_prefix("/app")
///     .channel_timeout(Duration::from_secs(30));
/// # drop(config);
/// ```
#[derive(Clone, Debug)]
#[must_use = "`hearth::Config` doesn't do anything until it's used to create a `Server`"]
pub struct Config {
    pub(crate) listen: SocketAddr,
    pub(crate) threads: usize,
    pub(crate) backlog: i32,
    pub(crate) url_scheme: String,
    /// Either empty or starting with a single `/` and no trailing `/`.
    pub(crate) url_prefix: String,
    pub(crate) ident: String,
    pub(crate) server_name: Option<String>,
    pub(crate) trusted_proxies: HashSet<IpAddr>,
    pub(crate) recv_bytes: usize,
    pub(crate) send_bytes: u64,
    pub(crate) outbuf_overflow: u64,
    pub(crate) outbuf_high_watermark: u64,
    pub(crate) inbuf_overflow: u64,
    pub(crate) connection_limit: usize,
    pub(crate) cleanup_interval: Duration,
    pub(crate) channel_timeout: Duration,
    pub(crate) log_socket_errors: bool,
    pub(crate) max_request_header_size: u64,
    pub(crate) max_request_body_size: u64,
    pub(crate) expose_tracebacks: bool,
    pub(crate) poll_timeout: Duration,
    pub(crate) shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080),
            threads: 4,
            backlog: 1024,
            url_scheme: "http".to_owned(),
            url_prefix: String::new(),
            ident: "hearth".to_owned(),
            server_name: None,
            trusted_proxies: HashSet::new(),
            recv_bytes: 8192,
            send_bytes: 18000,
            outbuf_overflow: 1024 * 1024,
            outbuf_high_watermark: 16 * 1024 * 1024,
            inbuf_overflow: 512 * 1024,
            connection_limit: 100,
            cleanup_interval: Duration::from_secs(30),
            channel_timeout: Duration::from_secs(120),
            log_socket_errors: true,
            max_request_header_size: 256 * 1024,
            max_request_body_size: 1024 * 1024 * 1024,
            expose_tracebacks: false,
            poll_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Set the address to listen on, defaults to `0.0.0.0:8080`.
    pub fn listen(mut self, address: SocketAddr) -> Config {
        self.listen = address;
        self
    }

    /// Returns the address to listen on.
    pub const fn get_listen(&self) -> SocketAddr {
        self.listen
    }

    /// Set the number of worker threads that run the application, defaults to
    /// four.
    pub fn threads(mut self, n: usize) -> Config {
        assert!(n != 0, "Can't create zero worker threads, 1 is the minimum");
        self.threads = n;
        self
    }

    /// Returns the number of worker threads.
    pub const fn get_threads(&self) -> usize {
        self.threads
    }

    /// Set the backlog of the listening socket, defaults to 1024.
    pub fn backlog(mut self, backlog: i32) -> Config {
        self.backlog = backlog;
        self
    }

    /// Set the default URL scheme, defaults to `http`.
    ///
    /// This is overwritten by the scheme in an absolute request URI or by the
    /// `X-Forwarded-Proto` header of a trusted proxy, see
    /// [`Config::trusted_proxy`].
    pub fn url_scheme<S: Into<String>>(mut self, scheme: S) -> Config {
        self.url_scheme = scheme.into();
        self
    }

    /// Set the URL prefix the application is mounted on, defaults to none.
    ///
    /// Request paths starting with the prefix have it removed from `PATH_INFO`
    /// and it is set as `SCRIPT_NAME`. Leading and trailing slashes are
    /// normalised, i.e. `app/` and `/app` are the same prefix.
    pub fn url_prefix(mut self, prefix: &str) -> Config {
        let prefix = prefix.trim_matches('/');
        self.url_prefix = if prefix.is_empty() {
            String::new()
        } else {
            format!("/{prefix}")
        };
        self
    }

    /// Set the identity of the server, used in the `Server` (or `Via`)
    /// response header and `SERVER_SOFTWARE`. Defaults to `hearth`.
    pub fn ident<S: Into<String>>(mut self, ident: S) -> Config {
        self.ident = ident.into();
        self
    }

    /// Set the server name, used in `SERVER_NAME`.
    ///
    /// Defaults to the IP address the server is listening on, or `localhost`
    /// if it's listening on all addresses.
    pub fn server_name<S: Into<String>>(mut self, name: S) -> Config {
        self.server_name = Some(name.into());
        self
    }

    /// Add a trusted proxy.
    ///
    /// Only requests from a trusted proxy may set the URL scheme using the
    /// `X-Forwarded-Proto` header, for all other requests it's ignored.
    pub fn trusted_proxy(mut self, address: IpAddr) -> Config {
        let _ = self.trusted_proxies.insert(address);
        self
    }

    /// Set the number of bytes read from a connection at a time, defaults to
    /// 8192.
    pub fn recv_bytes(mut self, n: usize) -> Config {
        assert!(n != 0, "Can't receive zero bytes at a time");
        self.recv_bytes = n;
        self
    }

    /// Set the minimum number of bytes buffered before sending them while the
    /// application is still writing the response, defaults to 18000.
    pub fn send_bytes(mut self, n: u64) -> Config {
        self.send_bytes = n;
        self
    }

    /// Set the number of bytes of output buffered in memory before using a
    /// temporary file, defaults to 1 MiB.
    pub fn outbuf_overflow(mut self, n: u64) -> Config {
        self.outbuf_overflow = n;
        self
    }

    /// Set the number of bytes of output buffered after which the application
    /// is blocked until some of it is send, defaults to 16 MiB.
    pub fn outbuf_high_watermark(mut self, n: u64) -> Config {
        self.outbuf_high_watermark = n;
        self
    }

    /// Set the number of bytes of a request body buffered in memory before
    /// using a temporary file, defaults to 512 KiB.
    pub fn inbuf_overflow(mut self, n: u64) -> Config {
        self.inbuf_overflow = n;
        self
    }

    /// Set the maximum number of open connections, defaults to 100.
    ///
    /// No new connections are accepted while at the limit.
    pub fn connection_limit(mut self, n: usize) -> Config {
        self.connection_limit = n;
        self
    }

    /// Set the interval at which idle connections are checked, defaults to 30
    /// seconds.
    pub fn cleanup_interval(mut self, interval: Duration) -> Config {
        self.cleanup_interval = interval;
        self
    }

    /// Set the time after which an idle connection is closed, defaults to 120
    /// seconds.
    pub fn channel_timeout(mut self, timeout: Duration) -> Config {
        self.channel_timeout = timeout;
        self
    }

    /// Set whether or not to log socket errors, defaults to `true`.
    pub fn log_socket_errors(mut self, log: bool) -> Config {
        self.log_socket_errors = log;
        self
    }

    /// Set the maximum size of the request head, defaults to 256 KiB.
    ///
    /// Larger request heads get a `431 Request Header Fields Too Large`
    /// response.
    pub fn max_request_header_size(mut self, n: u64) -> Config {
        self.max_request_header_size = n;
        self
    }

    /// Set the maximum size of the request body, defaults to 1 GiB.
    ///
    /// Larger request bodies get a `413 Request Entity Too Large` response.
    pub fn max_request_body_size(mut self, n: u64) -> Config {
        self.max_request_body_size = n;
        self
    }

    /// Set whether or not to include details about an internal error in the
    /// response body, defaults to `false`.
    pub fn expose_tracebacks(mut self, expose: bool) -> Config {
        self.expose_tracebacks = expose;
        self
    }

    /// Set the maximum time the server waits for events before doing
    /// maintenance, defaults to one second.
    pub fn poll_timeout(mut self, timeout: Duration) -> Config {
        self.poll_timeout = timeout;
        self
    }

    /// Set the time to wait for worker threads to stop when shutting down,
    /// defaults to five seconds.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Config {
        self.shutdown_timeout = timeout;
        self
    }

    /// Returns `true` if `address` is a trusted proxy.
    pub(crate) fn is_trusted_proxy(&self, address: IpAddr) -> bool {
        self.trusted_proxies.contains(&address)
    }

    /// Returns the server name to use for a server listening on `address`.
    pub(crate) fn server_name_for(&self, address: SocketAddr) -> String {
        match &self.server_name {
            Some(name) => name.clone(),
            None if address.ip().is_unspecified() => "localhost".to_owned(),
            None => address.ip().to_string(),
        }
    }
}
