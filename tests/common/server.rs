//! A minimal in-process HTTP/1.1 server for exercising the download
//! engine without the network.
//!
//! Serves one payload for every request path, honoring (or deliberately
//! ignoring) Range headers. Every response carries `Connection: close`,
//! so each request arrives on its own connection and can be counted.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// How the server treats incoming requests.
#[derive(Clone, Copy, Debug)]
pub enum Behavior {
    /// Honor Range requests with 206 responses.
    Normal,
    /// Ignore Range headers and always send the whole payload with 200.
    IgnoreRange,
    /// Answer the first `n` requests with 500, then behave normally.
    FailFirst(usize),
    /// Always answer with this status code and a short body.
    AlwaysStatus(u16),
}

/// Handle to a running test server.
pub struct TestServer {
    /// Base URL, e.g. `http://127.0.0.1:PORT`.
    pub url: String,
    hits: Arc<AtomicUsize>,
    ranges: Arc<Mutex<Vec<Option<(u64, u64)>>>>,
}

impl TestServer {
    /// Start a server for `data` on an ephemeral port.
    pub async fn start(data: Vec<u8>, behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        let data = Arc::new(data);
        let hits = Arc::new(AtomicUsize::new(0));
        let ranges = Arc::new(Mutex::new(Vec::new()));

        {
            let data = Arc::clone(&data);
            let hits = Arc::clone(&hits);
            let ranges = Arc::clone(&ranges);
            tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        return;
                    };
                    let data = Arc::clone(&data);
                    let hits = Arc::clone(&hits);
                    let ranges = Arc::clone(&ranges);
                    tokio::spawn(async move {
                        let _ = handle(socket, data, behavior, hits, ranges).await;
                    });
                }
            });
        }

        Self {
            url: format!("http://{addr}"),
            hits,
            ranges,
        }
    }

    /// Number of requests served so far.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// The Range header of each request, in arrival order. `None` for
    /// requests without one.
    pub fn ranges(&self) -> Vec<Option<(u64, u64)>> {
        self.ranges.lock().unwrap().clone()
    }
}

async fn handle(
    mut socket: TcpStream,
    data: Arc<Vec<u8>>,
    behavior: Behavior,
    hits: Arc<AtomicUsize>,
    ranges: Arc<Mutex<Vec<Option<(u64, u64)>>>>,
) -> std::io::Result<()> {
    let request = read_request(&mut socket).await?;
    let range = parse_range(&request);
    let hit = hits.fetch_add(1, Ordering::SeqCst);
    ranges.lock().unwrap().push(range);

    let response = match behavior {
        Behavior::AlwaysStatus(status) => error_response(status),
        Behavior::FailFirst(n) if hit < n => error_response(500),
        Behavior::IgnoreRange => full_response(&data),
        Behavior::Normal | Behavior::FailFirst(_) => match range {
            Some((start, end)) => partial_response(&data, start, end),
            None => full_response(&data),
        },
    };

    socket.write_all(&response).await?;
    socket.flush().await?;
    socket.shutdown().await?;
    Ok(())
}

async fn read_request(socket: &mut TcpStream) -> std::io::Result<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    // GET requests have no body; read until the blank line.
    while !buf.ends_with(b"\r\n\r\n") {
        let n = socket.read(&mut byte).await?;
        if n == 0 {
            break;
        }
        buf.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn parse_range(request: &str) -> Option<(u64, u64)> {
    let line = request
        .lines()
        .find(|l| l.to_ascii_lowercase().starts_with("range:"))?;
    let spec = line.split_once(':')?.1.trim();
    let spec = spec.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

fn partial_response(data: &[u8], start: u64, end: u64) -> Vec<u8> {
    let total = data.len() as u64;
    let end = end.min(total.saturating_sub(1));
    let body: &[u8] = if start < total {
        &data[start as usize..=end as usize]
    } else {
        &[]
    };
    let mut response = format!(
        "HTTP/1.1 206 Partial Content\r\n\
         Content-Length: {}\r\n\
         Content-Range: bytes {start}-{end}/{total}\r\n\
         Connection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);
    response
}

fn full_response(data: &[u8]) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        data.len()
    )
    .into_bytes();
    response.extend_from_slice(data);
    response
}

fn error_response(status: u16) -> Vec<u8> {
    let reason = match status {
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Error",
    };
    format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Length: 5\r\n\
         Connection: close\r\n\r\nerror"
    )
    .into_bytes()
}
