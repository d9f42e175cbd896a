//! Tests for the responses written by a task.

use std::io::Cursor;
use std::time::SystemTime;

use hearth::{parser, AppError, Body, Config, Environ, Error, StartResponse, Task};
use log::Level;

use crate::util::{capture_logs, Response, TestConnection, Zeroes};

fn text_headers() -> Vec<(String, String)> {
    vec![("Content-Type".to_owned(), "text/plain".to_owned())]
}

fn single_chunk(_: Environ, start: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
    start.start("200 OK", Vec::new())?;
    Ok(Body::from(b"abc".to_vec()))
}

fn streaming(_: Environ, start: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
    start.start("200 OK", Vec::new())?;
    Ok(Body::stream(vec![Ok(b"abc".to_vec())].into_iter()))
}

#[test]
fn single_chunk_sets_content_length() {
    let conn = TestConnection::new(Config::default(), single_chunk);
    let output = conn.request(b"GET / HTTP/1.1\r\n\r\n");
    let response = Response::parse_single(&output);
    assert_eq!(response.status_line, "HTTP/1.1 200 OK");
    assert_eq!(response.header("Content-Length"), Some("3"));
    assert_eq!(response.header("Transfer-Encoding"), None);
    assert_eq!(response.header("Connection"), None);
    assert_eq!(response.body, "abc");
    // Keep-alive.
    assert!(conn.channel.is_connected());
    assert!(!conn.socket.is_closed());
}

#[test]
fn streaming_body_is_chunked() {
    let conn = TestConnection::new(Config::default(), streaming);
    let output = conn.request(b"GET / HTTP/1.1\r\n\r\n");
    assert!(output.ends_with("\r\n\r\n3\r\nabc\r\n0\r\n\r\n"), "{output:?}");
    let response = Response::parse_single(&output);
    assert_eq!(response.header("Transfer-Encoding"), Some("chunked"));
    assert_eq!(response.header("Content-Length"), None);
    // Chunked responses close the connection.
    assert_eq!(response.header("Connection"), Some("close"));
    assert_eq!(response.body, "abc");
    assert!(conn.socket.is_closed());
}

#[test]
fn content_length_overrun_is_not_truncated() {
    fn app(_: Environ, start: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
        start.start(
            "200 OK",
            vec![("Content-Length".to_owned(), "1".to_owned())],
        )?;
        Ok(Body::from(b"abc".to_vec()))
    }

    let conn = TestConnection::new(Config::default(), app);
    let output = conn.request(b"GET / HTTP/1.1\r\n\r\n");
    let (head, body) = output.split_once("\r\n\r\n").unwrap();
    assert!(head.contains("\r\nContent-Length: 1\r\n"), "{head:?}");
    assert_eq!(body, "abc");
    // Client can't determine the end of the response, so we close.
    assert!(conn.socket.is_closed());
}

#[test]
fn content_length_mismatch_warns_once() {
    fn app(_: Environ, start: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
        start.start(
            "200 OK",
            vec![("Content-Length".to_owned(), "1".to_owned())],
        )?;
        Ok(Body::from(vec![b"abc".to_vec(), b"def".to_vec()]))
    }

    let conn = TestConnection::new(Config::default(), app);
    let (output, logs) = capture_logs(|| conn.request(b"GET / HTTP/1.1\r\n\r\n"));
    assert!(output.ends_with("\r\n\r\nabcdef"), "{output:?}");
    assert!(conn.socket.is_closed());
    let warnings = logs
        .iter()
        .filter(|log| log.level == Level::Warn && log.message.contains("Content-Length"))
        .count();
    assert_eq!(warnings, 1, "{logs:?}");
}

#[test]
fn content_length_underrun_closes_connection() {
    fn app(_: Environ, start: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
        start.start(
            "200 OK",
            vec![("Content-Length".to_owned(), "10".to_owned())],
        )?;
        Ok(Body::from(b"abc".to_vec()))
    }

    let conn = TestConnection::new(Config::default(), app);
    let output = conn.request(b"GET / HTTP/1.1\r\n\r\n");
    assert!(output.ends_with("\r\n\r\nabc"), "{output:?}");
    assert!(conn.socket.is_closed());
}

#[test]
fn http10_keep_alive_without_length() {
    let conn = TestConnection::new(Config::default(), streaming);
    let output = conn.request(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
    let response = Response::parse_single(&output);
    assert_eq!(response.status_line, "HTTP/1.0 200 OK");
    assert_eq!(response.header("Connection"), Some("close"));
    assert!(!output.contains("Keep-Alive"));
    assert_eq!(response.header("Transfer-Encoding"), None);
    assert_eq!(response.body, "abc");
    assert!(conn.socket.is_closed());
}

#[test]
fn http10_keep_alive_with_length() {
    let conn = TestConnection::new(Config::default(), single_chunk);
    let output = conn.request(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
    let response = Response::parse_single(&output);
    assert_eq!(response.status_line, "HTTP/1.0 200 OK");
    assert_eq!(response.header("Connection"), Some("Keep-Alive"));
    assert_eq!(response.header("Content-Length"), Some("3"));
    assert_eq!(response.body, "abc");
    assert!(!conn.socket.is_closed());
}

#[test]
fn http10_keep_alive_application_error() {
    let conn = TestConnection::new(Config::default(), failing);
    let output = conn.request(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
    let response = Response::parse_single(&output);
    assert_eq!(response.status_line, "HTTP/1.0 500 Internal Server Error");
    assert_eq!(output.matches("Connection:").count(), 1, "{output:?}");
    assert_eq!(response.header("Connection"), Some("close"));
    assert!(conn.socket.is_closed());
}

#[test]
fn http10_keep_alive_bad_request() {
    let conn = TestConnection::new(Config::default(), single_chunk);
    let output = conn.request(
        b"POST / HTTP/1.0\r\nConnection: keep-alive\r\nContent-Length: x\r\n\r\n",
    );
    let response = Response::parse_single(&output);
    assert_eq!(response.status_line, "HTTP/1.0 400 Bad Request");
    assert_eq!(output.matches("Connection:").count(), 1, "{output:?}");
    assert_eq!(response.header("Connection"), Some("close"));
    assert!(conn.socket.is_closed());
}

#[test]
fn http10_without_keep_alive() {
    let conn = TestConnection::new(Config::default(), single_chunk);
    let output = conn.request(b"GET / HTTP/1.0\r\n\r\n");
    let response = Response::parse_single(&output);
    assert_eq!(response.header("Connection"), Some("close"));
    assert_eq!(response.body, "abc");
    assert!(conn.socket.is_closed());
}

#[test]
fn http11_client_close() {
    let conn = TestConnection::new(Config::default(), single_chunk);
    let output = conn.request(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
    let response = Response::parse_single(&output);
    assert_eq!(response.header("Connection"), Some("close"));
    assert_eq!(response.header("Content-Length"), Some("3"));
    assert!(conn.socket.is_closed());
}

#[test]
fn headers_sorted_by_name() {
    fn app(_: Environ, start: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
        start.start(
            "200 OK",
            vec![
                ("C".to_owned(), "b".to_owned()),
                ("A".to_owned(), "b".to_owned()),
                ("A".to_owned(), "a".to_owned()),
            ],
        )?;
        Ok(Body::from(b"abc".to_vec()))
    }

    let conn = TestConnection::new(Config::default(), app);
    let output = conn.request(b"GET / HTTP/1.1\r\n\r\n");
    assert!(
        output.starts_with("HTTP/1.1 200 OK\r\nA: b\r\nA: a\r\nC: b\r\nContent-Length: 3\r\n"),
        "{output:?}"
    );
    let response = Response::parse_single(&output);
    assert_eq!(
        response.header_names(),
        ["A", "A", "C", "Content-Length", "Date", "Server"]
    );
}

#[test]
fn date_and_server_headers() {
    let before = SystemTime::now() - std::time::Duration::from_secs(1);
    let conn = TestConnection::new(Config::default().ident("test-server"), single_chunk);
    let output = conn.request(b"GET / HTTP/1.1\r\n\r\n");
    let response = Response::parse_single(&output);
    assert_eq!(response.header("Server"), Some("test-server"));
    assert_eq!(response.header("Via"), None);
    let date = httpdate::parse_http_date(response.header("Date").unwrap()).unwrap();
    assert!(date >= before);
}

#[test]
fn application_server_header_adds_via() {
    fn app(_: Environ, start: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
        start.start(
            "200 OK",
            vec![
                ("Server".to_owned(), "my-app".to_owned()),
                ("Date".to_owned(), "yesterday".to_owned()),
            ],
        )?;
        Ok(Body::from(b"abc".to_vec()))
    }

    let conn = TestConnection::new(Config::default(), app);
    let output = conn.request(b"GET / HTTP/1.1\r\n\r\n");
    let response = Response::parse_single(&output);
    assert_eq!(response.header("Server"), Some("my-app"));
    assert_eq!(response.header("Via"), Some("hearth"));
    assert_eq!(response.header("Date"), Some("yesterday"));
}

#[test]
fn head_request_has_no_body() {
    let conn = TestConnection::new(Config::default(), single_chunk);
    let output = conn.request(b"HEAD / HTTP/1.1\r\n\r\n");
    assert!(output.ends_with("\r\n\r\n"), "{output:?}");
    assert!(output.contains("\r\nContent-Length: 3\r\n"), "{output:?}");
    assert!(!output.contains("abc"));
    assert!(!conn.socket.is_closed());
}

#[test]
fn no_content_status_has_no_body() {
    fn app(_: Environ, start: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
        start.start(
            "204 No Content",
            vec![("Content-Length".to_owned(), "3".to_owned())],
        )?;
        Ok(Body::from(b"abc".to_vec()))
    }

    let conn = TestConnection::new(Config::default(), app);
    let output = conn.request(b"GET / HTTP/1.1\r\n\r\n");
    assert!(output.starts_with("HTTP/1.1 204 No Content\r\n"), "{output:?}");
    assert!(output.ends_with("\r\n\r\n"), "{output:?}");
    assert!(!output.contains("Content-Length"), "{output:?}");
    assert!(!output.contains("Transfer-Encoding"), "{output:?}");
    assert!(!output.contains("abc"));
}

#[test]
fn empty_streaming_body() {
    fn app(_: Environ, start: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
        start.start("200 OK", text_headers())?;
        Ok(Body::stream(Vec::<Result<Vec<u8>, AppError>>::new().into_iter()))
    }

    let conn = TestConnection::new(Config::default(), app);
    let output = conn.request(b"GET / HTTP/1.1\r\n\r\n");
    assert!(output.ends_with("\r\n\r\n0\r\n\r\n"), "{output:?}");
    let response = Response::parse_single(&output);
    assert_eq!(response.header("Content-Type"), Some("text/plain"));
    assert_eq!(response.body, "");
}

#[test]
fn empty_chunks_are_skipped() {
    fn app(_: Environ, start: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
        start.start("200 OK", Vec::new())?;
        Ok(Body::stream(
            vec![Ok(Vec::new()), Ok(b"ab".to_vec()), Ok(Vec::new()), Ok(b"c".to_vec())].into_iter(),
        ))
    }

    let conn = TestConnection::new(Config::default(), app);
    let output = conn.request(b"GET / HTTP/1.1\r\n\r\n");
    assert!(output.ends_with("\r\n\r\n2\r\nab\r\n1\r\nc\r\n0\r\n\r\n"), "{output:?}");
}

#[test]
fn crlf_in_header_value_rejected() {
    fn app(_: Environ, start: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
        start.start(
            "200 OK",
            vec![("X-Evil".to_owned(), "a\r\nSet-Cookie: b".to_owned())],
        )?;
        Ok(Body::from(b"abc".to_vec()))
    }

    let conn = TestConnection::new(Config::default(), app);
    let output = conn.request(b"GET / HTTP/1.1\r\n\r\n");
    let response = Response::parse_single(&output);
    assert_eq!(response.status_line, "HTTP/1.1 500 Internal Server Error");
    assert!(!output.contains("Set-Cookie"), "{output:?}");
    assert!(conn.socket.is_closed());
}

#[test]
fn crlf_in_header_name_and_status_rejected() {
    fn app(_: Environ, start: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
        let err = start
            .start("200 OK", vec![("X\nEvil".to_owned(), "a".to_owned())])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidHeaderName(..)));
        let err = start
            .start_after_error("200 OK\r\n", Vec::new(), "retry".into())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStatus(..)));
        start.start_after_error("200 OK", Vec::new(), "retry".into())?;
        Ok(Body::from(b"abc".to_vec()))
    }

    let conn = TestConnection::new(Config::default(), app);
    let output = conn.request(b"GET / HTTP/1.1\r\n\r\n");
    let response = Response::parse_single(&output);
    assert_eq!(response.status_line, "HTTP/1.1 200 OK");
    assert_eq!(response.body, "abc");
}

#[test]
fn hop_by_hop_header_rejected() {
    fn app(_: Environ, start: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
        let err = start
            .start("200 OK", vec![("Connection".to_owned(), "close".to_owned())])
            .unwrap_err();
        assert!(matches!(err, Error::HopByHopHeader(ref name) if name == "Connection"));
        Err(err.into())
    }

    let conn = TestConnection::new(Config::default(), app);
    let output = conn.request(b"GET / HTTP/1.1\r\n\r\n");
    let response = Response::parse_single(&output);
    assert_eq!(response.status_line, "HTTP/1.1 500 Internal Server Error");
}

#[test]
fn start_twice() {
    fn app(_: Environ, start: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
        start.start("200 OK", Vec::new())?;
        let err = start.start("404 Not Found", Vec::new()).unwrap_err();
        assert!(matches!(err, Error::StartedTwice));
        Ok(Body::from(b"abc".to_vec()))
    }

    let conn = TestConnection::new(Config::default(), app);
    let output = conn.request(b"GET / HTTP/1.1\r\n\r\n");
    let response = Response::parse_single(&output);
    assert_eq!(response.status_line, "HTTP/1.1 200 OK");
}

#[test]
fn start_after_error_replaces_headers() {
    fn app(_: Environ, start: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
        start.start(
            "200 OK",
            vec![
                ("X-Original".to_owned(), "1".to_owned()),
                ("Content-Length".to_owned(), "100".to_owned()),
            ],
        )?;
        start.start_after_error("503 Service Unavailable", text_headers(), "oops".into())?;
        Ok(Body::from(b"unavailable".to_vec()))
    }

    let conn = TestConnection::new(Config::default(), app);
    let output = conn.request(b"GET / HTTP/1.1\r\n\r\n");
    let response = Response::parse_single(&output);
    assert_eq!(response.status_line, "HTTP/1.1 503 Service Unavailable");
    assert_eq!(response.header("X-Original"), None);
    assert_eq!(response.header("Content-Type"), Some("text/plain"));
    assert_eq!(response.header("Content-Length"), Some("11"));
    assert_eq!(response.body, "unavailable");
}

#[test]
fn start_after_error_already_sent() {
    fn app(_: Environ, start: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
        start.start("200 OK", Vec::new())?;
        start.write(b"partial")?;
        let err = start
            .start_after_error("500 Internal Server Error", Vec::new(), "oops".into())
            .unwrap_err();
        match err {
            Error::AlreadySent(err) => assert_eq!(err.to_string(), "oops"),
            err => panic!("unexpected error: {err}"),
        }
        Ok(Body::empty())
    }

    let conn = TestConnection::new(Config::default(), app);
    let output = conn.request(b"GET / HTTP/1.1\r\n\r\n");
    let response = Response::parse_single(&output);
    assert_eq!(response.status_line, "HTTP/1.1 200 OK");
    assert_eq!(response.header("Transfer-Encoding"), Some("chunked"));
    assert_eq!(response.body, "partial");
}

#[test]
fn body_without_starting_response() {
    fn app(_: Environ, _: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
        Ok(Body::from(b"abc".to_vec()))
    }

    let conn = TestConnection::new(Config::default(), app);
    let output = conn.request(b"GET / HTTP/1.1\r\n\r\n");
    let response = Response::parse_single(&output);
    assert_eq!(response.status_line, "HTTP/1.1 500 Internal Server Error");
    assert!(conn.socket.is_closed());
}

#[test]
fn invalid_content_length() {
    fn app(_: Environ, start: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
        start.start(
            "200 OK",
            vec![("Content-Length".to_owned(), "abc".to_owned())],
        )?;
        Ok(Body::empty())
    }

    let conn = TestConnection::new(Config::default(), app);
    let output = conn.request(b"GET / HTTP/1.1\r\n\r\n");
    let response = Response::parse_single(&output);
    assert_eq!(response.status_line, "HTTP/1.1 500 Internal Server Error");
}

fn failing(_: Environ, _: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
    Err("database unavailable".into())
}

#[test]
fn application_error() {
    let conn = TestConnection::new(Config::default(), failing);
    let output = conn.request(b"GET / HTTP/1.1\r\n\r\n");
    let response = Response::parse_single(&output);
    assert_eq!(response.status_line, "HTTP/1.1 500 Internal Server Error");
    assert_eq!(response.header("Content-Type"), Some("text/plain"));
    assert!(!response.body.contains("database unavailable"));
    assert!(response.body.ends_with("(generated by hearth)"));
}

#[test]
fn application_error_exposed() {
    let conn = TestConnection::new(Config::default().expose_tracebacks(true), failing);
    let output = conn.request(b"GET / HTTP/1.1\r\n\r\n");
    let response = Response::parse_single(&output);
    assert_eq!(response.status_line, "HTTP/1.1 500 Internal Server Error");
    assert!(response.body.contains("database unavailable"), "{:?}", response.body);
}

#[test]
fn application_panic() {
    fn app(_: Environ, _: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
        panic!("oh no");
    }

    let conn = TestConnection::new(Config::default(), app);
    let output = conn.request(b"GET / HTTP/1.1\r\n\r\n");
    let response = Response::parse_single(&output);
    assert_eq!(response.status_line, "HTTP/1.1 500 Internal Server Error");
    assert!(conn.socket.is_closed());
}

#[test]
fn error_in_body_after_header() {
    fn app(_: Environ, start: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
        start.start("200 OK", Vec::new())?;
        Ok(Body::stream(
            vec![Ok(b"abc".to_vec()), Err("broken".into())].into_iter(),
        ))
    }

    let conn = TestConnection::new(Config::default(), app);
    let output = conn.request(b"GET / HTTP/1.1\r\n\r\n");
    // Response can't be completed, the connection is closed instead.
    assert!(output.starts_with("HTTP/1.1 200 OK\r\n"), "{output:?}");
    assert!(output.ends_with("\r\n\r\n3\r\nabc\r\n"), "{output:?}");
    assert!(conn.socket.is_closed());
}

#[test]
fn file_body() {
    fn app(environ: Environ, start: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
        start.start("200 OK", text_headers())?;
        let file = environ.file_wrapper(Cursor::new(b"hello file".to_vec()), None);
        Ok(Body::from(file))
    }

    let conn = TestConnection::new(Config::default(), app);
    let output = conn.request(b"GET / HTTP/1.1\r\n\r\n");
    let response = Response::parse_single(&output);
    assert_eq!(response.header("Content-Length"), Some("10"));
    assert_eq!(response.body, "hello file");
    assert!(!conn.socket.is_closed());
}

#[test]
fn file_body_wrong_content_length() {
    fn app(environ: Environ, start: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
        start.start(
            "200 OK",
            vec![("Content-Length".to_owned(), "100".to_owned())],
        )?;
        let mut file = Cursor::new(b"skipped: hello file".to_vec());
        file.set_position(9);
        Ok(Body::from(environ.file_wrapper(file, Some(4))))
    }

    let conn = TestConnection::new(Config::default(), app);
    let output = conn.request(b"GET / HTTP/1.1\r\n\r\n");
    let response = Response::parse_single(&output);
    assert_eq!(response.header("Content-Length"), Some("10"));
    assert_eq!(response.body, "hello file");
}

#[test]
fn file_body_limited_by_content_length() {
    fn app(environ: Environ, start: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
        start.start("200 OK", vec![("Content-Length".to_owned(), "5".to_owned())])?;
        Ok(Body::from(environ.file_wrapper(Cursor::new(b"hello file".to_vec()), None)))
    }

    let conn = TestConnection::new(Config::default(), app);
    let output = conn.request(b"GET / HTTP/1.1\r\n\r\n");
    let response = Response::parse_single(&output);
    assert_eq!(response.header("Content-Length"), Some("5"));
    assert_eq!(response.body, "hello");
}

#[test]
fn head_request_file_body() {
    fn app(environ: Environ, start: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
        start.start("200 OK", Vec::new())?;
        Ok(Body::from(environ.file_wrapper(Cursor::new(b"hello file".to_vec()), None)))
    }

    let conn = TestConnection::new(Config::default(), app);
    let output = conn.request(b"HEAD / HTTP/1.1\r\n\r\n");
    assert!(output.contains("\r\nContent-Length: 10\r\n"), "{output:?}");
    assert!(output.ends_with("\r\n\r\n"), "{output:?}");
}

#[test]
fn file_body_larger_than_4gb() {
    const SIZE: u64 = 5_000_000_000;

    fn app(environ: Environ, start: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
        start.start("200 OK", Vec::new())?;
        Ok(Body::from(environ.file_wrapper(Zeroes::new(SIZE), None)))
    }

    let conn = TestConnection::new(Config::default(), app);
    let _ = conn.channel.received(b"GET / HTTP/1.1\r\n\r\n");
    assert_eq!(conn.dispatcher.run_all(), 1);
    // Not flushing the entire file, but all of it is queued.
    let total = conn.channel.total_outbufs_len();
    assert!(total > SIZE && total < SIZE + 1024, "{total}");

    let head = conn.socket.take_sent();
    assert!(head.is_empty());
    conn.channel.handle_close();
    assert_eq!(conn.channel.total_outbufs_len(), 0);
}

#[test]
fn large_content_length_header() {
    fn app(_: Environ, start: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
        start.start(
            "200 OK",
            vec![("Content-Length".to_owned(), "5000000000".to_owned())],
        )?;
        Ok(Body::from(b"abc".to_vec()))
    }

    let conn = TestConnection::new(Config::default(), app);
    let output = conn.request(b"GET / HTTP/1.1\r\n\r\n");
    assert!(output.contains("\r\nContent-Length: 5000000000\r\n"), "{output:?}");
    assert!(output.ends_with("\r\n\r\nabc"), "{output:?}");
    assert!(conn.socket.is_closed());
}

#[test]
fn write_directly() {
    fn app(_: Environ, start: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
        start.start("200 OK", vec![("Content-Length".to_owned(), "6".to_owned())])?;
        start.write(b"abc")?;
        Ok(Body::from(b"def".to_vec()))
    }

    let conn = TestConnection::new(Config::default(), app);
    let output = conn.request(b"GET / HTTP/1.1\r\n\r\n");
    let response = Response::parse_single(&output);
    assert_eq!(response.body, "abcdef");
    assert!(!conn.socket.is_closed());
}

#[test]
fn finish_twice() {
    let conn = TestConnection::new(Config::default(), single_chunk);
    let mut request = parser::Request::new(conn.channel.context().config());
    let _ = request.received(b"GET / HTTP/1.1\r\n\r\n");
    assert!(request.is_completed());

    let mut task = Task::new(&conn.channel, request);
    task.start_response("200 OK".to_owned(), Vec::new(), None).unwrap();
    task.write(b"abc").unwrap();
    assert!(task.chunked_response());
    task.finish().unwrap();
    task.finish().unwrap();
    drop(task);

    let output = conn.output();
    assert_eq!(output.matches("HTTP/1.1 200 OK").count(), 1, "{output:?}");
    assert!(output.ends_with("\r\n\r\n3\r\nabc\r\n0\r\n\r\n"), "{output:?}");
    assert_eq!(output.matches("0\r\n\r\n").count(), 1, "{output:?}");
}
