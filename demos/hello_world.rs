use std::io;

use hearth::{AppError, Body, Config, Environ, Server, StartResponse};
use log::info;

fn main() -> io::Result<()> {
    std_logger::Config::logfmt().init();

    let address = "127.0.0.1:7890".parse().unwrap();
    let config = Config::default().listen(address).threads(4);
    let server = Server::bind(config, app)?;
    info!(address:% = server.local_addr(); "listening");
    server.run()
}

/// Responds with the IP address of the client on `/` and with a 404 for all
/// other paths.
fn app(environ: Environ, start_response: &mut StartResponse<'_, '_>) -> Result<Body, AppError> {
    let headers = vec![("Content-Type".to_owned(), "text/plain".to_owned())];
    if environ.get("PATH_INFO") != Some("/") {
        start_response.start("404 Not Found", headers)?;
        return Ok(Body::from("Not found"));
    }

    match environ.get("REQUEST_METHOD") {
        Some("GET" | "HEAD") => {
            let ip = environ.get("REMOTE_ADDR").unwrap_or("unknown").to_owned();
            start_response.start("200 OK", headers)?;
            Ok(Body::from(ip.into_bytes()))
        }
        _ => {
            let mut headers = headers;
            headers.push(("Allow".to_owned(), "GET, HEAD".to_owned()));
            start_response.start("405 Method Not Allowed", headers)?;
            Ok(Body::from("Method not allowed"))
        }
    }
}
