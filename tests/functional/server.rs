//! End-to-end tests using a real server and TCP connections.

use std::io::{self, Read, Write};
use std::net::{self, SocketAddr};
use std::thread;
use std::time::{Duration, Instant};

use hearth::{AppError, Body, Config, Environ, Server, ServerHandle, StartResponse};

use crate::util::{assert_send, init_logger, Response};

fn app(mut environ: Environ, start: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
    let path = environ.get("PATH_INFO").unwrap_or_default().to_owned();
    match path.as_str() {
        "/echo" => {
            let mut body = Vec::new();
            let _ = environ.input().read_to_end(&mut body)?;
            start.start("200 OK", Vec::new())?;
            Ok(Body::from(body))
        }
        "/stream" => {
            start.start("200 OK", Vec::new())?;
            Ok(Body::stream(
                vec![Ok(b"hello ".to_vec()), Ok(b"world".to_vec())].into_iter(),
            ))
        }
        "/environ" => {
            let body = format!(
                "{} {} {}",
                environ.get("SERVER_NAME").unwrap_or_default(),
                environ.get("SERVER_PORT").unwrap_or_default(),
                environ.get("REMOTE_ADDR").unwrap_or_default(),
            );
            start.start("200 OK", Vec::new())?;
            Ok(Body::from(body.into_bytes()))
        }
        _ => {
            start.start("200 OK", Vec::new())?;
            Ok(Body::from("OK"))
        }
    }
}

struct TestServer {
    address: SocketAddr,
    handle: ServerHandle,
    thread: thread::JoinHandle<io::Result<()>>,
}

impl TestServer {
    fn spawn(config: Config) -> TestServer {
        init_logger();
        let config = config.listen("127.0.0.1:0".parse().unwrap()).threads(2);
        let server = Server::bind(config, app).unwrap();
        let address = server.local_addr();
        let handle = server.handle();
        let thread = thread::spawn(move || server.run());
        TestServer {
            address,
            handle,
            thread,
        }
    }

    fn connect(&self) -> net::TcpStream {
        let stream = net::TcpStream::connect(self.address).unwrap();
        stream.set_nodelay(true).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn shutdown(self) {
        self.handle.shutdown().unwrap();
        self.thread.join().unwrap().unwrap();
    }
}

/// Macro to run with a test server.
macro_rules! with_test_server {
    (|$server: ident, $stream: ident| $test: block) => {
        with_test_server!(Config::default(), |$server, $stream| $test);
    };
    ($config: expr, |$server: ident, $stream: ident| $test: block) => {
        let $server = TestServer::spawn($config);
        {
            let mut $stream = $server.connect();
            $test
        }
        $server.shutdown();
    };
}

/// Read from `stream` until `count` complete responses are read.
fn read_responses(stream: &mut net::TcpStream, count: usize) -> String {
    let mut output = String::new();
    let mut buf = [0; 4096];
    loop {
        if let Some(rest) = parse_responses(&output, count) {
            assert_eq!(rest, "");
            return output;
        }
        let n = stream.read(&mut buf).unwrap();
        assert!(n != 0, "connection closed early, read: {output:?}");
        output.push_str(std::str::from_utf8(&buf[..n]).unwrap());
    }
}

/// Returns the rest of the output if `count` complete responses (with a
/// `Content-Length` header) are in `output`.
fn parse_responses(output: &str, count: usize) -> Option<&str> {
    let mut rest = output;
    for _ in 0..count {
        let (head, body) = rest.split_once("\r\n\r\n")?;
        let length: usize = head
            .split("\r\n")
            .find_map(|line| line.strip_prefix("Content-Length: "))?
            .parse()
            .ok()?;
        if body.len() < length {
            return None;
        }
        rest = &body[length..];
    }
    Some(rest)
}

/// Read until the server closes the connection.
fn read_to_close(stream: &mut net::TcpStream) -> String {
    let mut output = String::new();
    let _ = stream.read_to_string(&mut output).unwrap();
    output
}

#[test]
fn server_is_send() {
    assert_send::<Server>();
    assert_send::<ServerHandle>();
}

#[test]
fn get() {
    with_test_server!(|server, stream| {
        stream.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
        let output = read_responses(&mut stream, 1);
        let response = Response::parse_single(&output);
        assert_eq!(response.status_line, "HTTP/1.1 200 OK");
        assert_eq!(response.header("Content-Length"), Some("2"));
        assert_eq!(response.header("Server"), Some("hearth"));
        assert!(response.header("Date").is_some());
        assert_eq!(response.body, "OK");
    });
}

#[test]
fn keep_alive() {
    with_test_server!(|server, stream| {
        for _ in 0..3 {
            stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
            let output = read_responses(&mut stream, 1);
            assert_eq!(Response::parse_single(&output).body, "OK");
        }
    });
}

#[test]
fn pipelining() {
    with_test_server!(|server, stream| {
        stream
            .write_all(b"POST /echo HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcGET / HTTP/1.1\r\n\r\n")
            .unwrap();
        let output = read_responses(&mut stream, 2);
        let (first, rest) = Response::parse(&output);
        let second = Response::parse_single(rest);
        assert_eq!(first.body, "abc");
        assert_eq!(second.body, "OK");
    });
}

#[test]
fn request_body() {
    with_test_server!(|server, stream| {
        let body = "abcdefghij".repeat(1000);
        let request = format!("POST /echo HTTP/1.1\r\nContent-Length: {}\r\n\r\n{body}", body.len());
        stream.write_all(request.as_bytes()).unwrap();
        let output = read_responses(&mut stream, 1);
        assert_eq!(Response::parse_single(&output).body, body);
    });
}

#[test]
fn chunked_response_closes_connection() {
    with_test_server!(|server, stream| {
        stream.write_all(b"GET /stream HTTP/1.1\r\n\r\n").unwrap();
        let output = read_to_close(&mut stream);
        let response = Response::parse_single(&output);
        assert_eq!(response.header("Transfer-Encoding"), Some("chunked"));
        assert_eq!(response.header("Connection"), Some("close"));
        assert_eq!(response.body, "hello world");
    });
}

#[test]
fn http10() {
    with_test_server!(|server, stream| {
        stream.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        let output = read_to_close(&mut stream);
        let response = Response::parse_single(&output);
        assert_eq!(response.status_line, "HTTP/1.0 200 OK");
        assert_eq!(response.header("Connection"), Some("close"));
        assert_eq!(response.body, "OK");
    });
}

#[test]
fn bad_request() {
    with_test_server!(|server, stream| {
        stream.write_all(b"GET / HTTP/1.1\r\nContent-Length: x\r\n\r\n").unwrap();
        let output = read_to_close(&mut stream);
        let response = Response::parse_single(&output);
        assert_eq!(response.status_line, "HTTP/1.1 400 Bad Request");
    });
}

#[test]
fn environ() {
    with_test_server!(|server, stream| {
        stream.write_all(b"GET /environ HTTP/1.1\r\n\r\n").unwrap();
        let output = read_responses(&mut stream, 1);
        let response = Response::parse_single(&output);
        let local = stream.local_addr().unwrap();
        assert_eq!(
            response.body,
            format!("127.0.0.1 {} {}", server.address.port(), local.ip())
        );
    });
}

#[test]
fn multiple_connections() {
    with_test_server!(|server, stream| {
        let mut streams: Vec<net::TcpStream> = (0..4).map(|_| server.connect()).collect();
        streams.push(stream);
        for stream in streams.iter_mut() {
            stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        }
        for stream in streams.iter_mut() {
            let output = read_responses(stream, 1);
            assert_eq!(Response::parse_single(&output).body, "OK");
        }
    });
}

#[test]
fn idle_connection_timeout() {
    let config = Config::default()
        .channel_timeout(Duration::from_millis(50))
        .cleanup_interval(Duration::from_millis(10))
        .poll_timeout(Duration::from_millis(10));
    with_test_server!(config, |server, stream| {
        let start = Instant::now();
        let output = read_to_close(&mut stream);
        assert_eq!(output, "");
        assert!(start.elapsed() < Duration::from_secs(5));
    });
}

#[test]
fn connection_limit() {
    let config = Config::default().connection_limit(1);
    with_test_server!(config, |server, stream| {
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let _ = read_responses(&mut stream, 1);

        // Accepted by the OS, but not by the server.
        let mut second = server.connect();
        second.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        second
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let mut buf = [0; 64];
        let err = second.read(&mut buf).unwrap_err();
        assert!(matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ));

        // Once the first connection is closed the second one is accepted.
        drop(stream);
        second
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let output = read_responses(&mut second, 1);
        assert_eq!(Response::parse_single(&output).body, "OK");
    });
}

#[test]
fn shutdown_with_open_connection() {
    let server = TestServer::spawn(Config::default());
    let mut stream = server.connect();
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    let _ = read_responses(&mut stream, 1);
    let start = Instant::now();
    server.shutdown();
    assert!(start.elapsed() < Duration::from_secs(5));
    // Server closed the connection.
    let mut buf = [0; 64];
    let n = stream.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0);
}
