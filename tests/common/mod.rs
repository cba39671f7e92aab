//! Shared helpers for integration tests
//!
//! A loopback HTTP/1.1 server that serves fixed bodies with optional
//! failure injection, range support and slow transfers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// How one path is served
#[derive(Debug, Clone, Default)]
pub struct Route {
    pub body: Vec<u8>,
    /// Answer this many requests with 503 before serving the body
    pub fail_first: usize,
    /// Always answer with this status and no body
    pub status: Option<u16>,
    /// Pause between body chunks
    pub chunk_delay: Option<Duration>,
    pub chunk_size: usize,
}

impl Route {
    pub fn body(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            chunk_size: 16 * 1024,
            ..Default::default()
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failing_first(mut self, count: usize) -> Self {
        self.fail_first = count;
        self
    }

    pub fn slow(mut self, chunk_size: usize, delay: Duration) -> Self {
        self.chunk_size = chunk_size;
        self.chunk_delay = Some(delay);
        self
    }
}

/// A request as seen by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hit {
    pub path: String,
    pub range_start: Option<u64>,
    pub user_agent: Option<String>,
}

#[derive(Default)]
struct State {
    routes: Mutex<HashMap<String, Route>>,
    hits: Mutex<Vec<Hit>>,
}

pub struct TestServer {
    addr: SocketAddr,
    state: Arc<State>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(State::default());

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    // Clients hanging up mid-body is expected in cancel tests
                    let _ = handle(stream, state).await;
                });
            }
        });

        Self { addr, state }
    }

    pub fn route(&self, path: &str, route: Route) {
        self.state
            .routes
            .lock()
            .unwrap()
            .insert(path.to_string(), route);
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn hits(&self, path: &str) -> Vec<Hit> {
        self.state
            .hits
            .lock()
            .unwrap()
            .iter()
            .filter(|h| h.path == path)
            .cloned()
            .collect()
    }
}

async fn handle(stream: TcpStream, state: Arc<State>) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();

    let mut range_start = None;
    let mut user_agent = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("range") {
                range_start = value
                    .trim()
                    .strip_prefix("bytes=")
                    .and_then(|r| r.trim_end_matches('-').parse::<u64>().ok());
            } else if name.eq_ignore_ascii_case("user-agent") {
                user_agent = Some(value.trim().to_string());
            }
        }
    }

    state.hits.lock().unwrap().push(Hit {
        path: path.clone(),
        range_start,
        user_agent,
    });

    let route = {
        let mut routes = state.routes.lock().unwrap();
        match routes.get_mut(&path) {
            Some(route) if route.fail_first > 0 => {
                route.fail_first -= 1;
                Err(503)
            }
            Some(route) => match route.status {
                Some(status) => Err(status),
                None => Ok(route.clone()),
            },
            None => Err(404),
        }
    };

    let route = match route {
        Ok(route) => route,
        Err(status) => {
            let head = format!(
                "HTTP/1.1 {} Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                status
            );
            write.write_all(head.as_bytes()).await?;
            return write.shutdown().await;
        }
    };

    let len = route.body.len() as u64;
    let (head, start) = match range_start {
        Some(start) if start >= len => {
            let head = format!(
                "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                len
            );
            write.write_all(head.as_bytes()).await?;
            return write.shutdown().await;
        }
        Some(start) => (
            format!(
                "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes {}-{}/{}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                start,
                len - 1,
                len,
                len - start
            ),
            start as usize,
        ),
        None => (
            format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                len
            ),
            0,
        ),
    };

    write.write_all(head.as_bytes()).await?;
    for chunk in route.body[start..].chunks(route.chunk_size.max(1)) {
        write.write_all(chunk).await?;
        write.flush().await?;
        if let Some(delay) = route.chunk_delay {
            tokio::time::sleep(delay).await;
        }
    }
    write.shutdown().await
}

/// Deterministic non-repeating test payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}
