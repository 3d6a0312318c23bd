//! Test helpers shared across modules

use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::thread;

/// A canned HTTP response for a request path
#[derive(Debug, Clone)]
pub struct Route {
    pub method: &'static str,
    pub path: &'static str,
    pub status: u16,
    pub body: &'static str,
}

pub const fn get(path: &'static str, status: u16, body: &'static str) -> Route {
    Route {
        method: "GET",
        path,
        status,
        body,
    }
}

pub const fn put(path: &'static str, status: u16, body: &'static str) -> Route {
    Route {
        method: "PUT",
        path,
        status,
        body,
    }
}

/// Serve `routes` on an ephemeral localhost port; unknown paths get 404
///
/// The server thread lives until the test process exits.
pub fn serve(routes: Vec<Route>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let mut reader = BufReader::new(stream.try_clone().unwrap());

            let mut request_line = String::new();
            if reader.read_line(&mut request_line).is_err() {
                continue;
            }
            loop {
                let mut header = String::new();
                match reader.read_line(&mut header) {
                    Ok(0) | Err(_) => break,
                    Ok(_) if header == "\r\n" || header == "\n" => break,
                    Ok(_) => {}
                }
            }

            let mut parts = request_line.split_whitespace();
            let method = parts.next().unwrap_or("");
            let path = parts.next().unwrap_or("");
            let (status, body) = routes
                .iter()
                .find(|r| r.method == method && r.path == path)
                .map_or((404, "not found"), |r| (r.status, r.body));

            let _ = write!(
                stream,
                "HTTP/1.1 {status} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.flush();
        }
    });

    port
}

/// A localhost port with nothing listening
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
