//! Network services for coverage-rs
//!
//!  A line-oriented TCP input for observations and station commands, and a
//!  small HTTP server exposing status, the station registry and bucket rows.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::Engine;
use crate::key::{AccumulatorKind, CellId, StationId};
use crate::record::{CellRow, Observation};

const MAX_REQUEST: usize = 16 * 1024 * 1024;

/// One line of the observation input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputLine {
    /// `station,cell_hex,altitude,agl,crc_errors,signal,gap`
    Observation {
        station: String,
        cell: CellId,
        obs: Observation,
    },
    /// `INVALID <station>`
    Invalid(String),
    /// `VALID <station>`
    Valid(String),
}

impl InputLine {
    /// Parse one line. Blank lines and `#` comments yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        if let Some((command, name)) = line.split_once(char::is_whitespace) {
            let name = name.trim();
            match command {
                "INVALID" if !name.is_empty() => {
                    return Ok(Some(InputLine::Invalid(name.to_string())));
                }
                "VALID" if !name.is_empty() => {
                    return Ok(Some(InputLine::Valid(name.to_string())));
                }
                _ => {}
            }
        }

        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 7 {
            return Err(format!("expected 7 fields, got {}", fields.len()));
        }
        if fields[0].is_empty() {
            return Err("empty station name".to_string());
        }

        fn num<T: std::str::FromStr>(field: &str, name: &str) -> Result<T, String> {
            field.parse().map_err(|_| format!("bad {}: {:?}", name, field))
        }

        let cell: CellId = fields[1]
            .parse()
            .map_err(|_| format!("bad cell: {:?}", fields[1]))?;
        let obs = Observation {
            altitude: num(fields[2], "altitude")?,
            agl: num(fields[3], "agl")?,
            crc_errors: num(fields[4], "crc_errors")?,
            signal: num(fields[5], "signal")?,
            gap: num(fields[6], "gap")?,
            station: 0,
        };
        Ok(Some(InputLine::Observation {
            station: fields[0].to_string(),
            cell,
            obs,
        }))
    }
}

pub async fn run_servers(
    config: Config,
    engine: Arc<Engine>,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut input_handle = {
        let port = config.net_input_port;
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if let Err(e) = run_input_server(port, engine).await {
                error!("Input server error: {}", e);
            }
        })
    };

    let mut http_handle = {
        let port = config.net_http_port;
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if let Err(e) = run_http_server(port, engine).await {
                error!("HTTP server error: {}", e);
            }
        })
    };

    tokio::select! {
        _ = cancel.cancelled() => {
            info!("Network services stopping");
        }
        _ = &mut input_handle => {}
        _ = &mut http_handle => {}
    }

    input_handle.abort();
    http_handle.abort();
    Ok(())
}

async fn run_input_server(
    port: u16,
    engine: Arc<Engine>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("Observation input listening on port {}", port);

    loop {
        let (socket, addr) = listener.accept().await?;
        debug!("Input client connected: {}", addr);

        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let reader = BufReader::new(socket);
            let mut lines = reader.lines();
            let mut rejected = 0u64;

            while let Ok(Some(line)) = lines.next_line().await {
                match InputLine::parse(&line) {
                    Ok(None) => {}
                    Ok(Some(input)) => {
                        if let Err(e) = handle_input(&engine, input).await {
                            rejected += 1;
                            debug!("Observation from {} not recorded: {}", addr, e);
                        }
                    }
                    Err(e) => {
                        rejected += 1;
                        debug!("Bad input line from {}: {}", addr, e);
                    }
                }
            }
            if rejected > 0 {
                warn!("Input client {} had {} rejected lines", addr, rejected);
            }
            debug!("Input client disconnected: {}", addr);
        });
    }
}

async fn handle_input(engine: &Engine, input: InputLine) -> crate::error::Result<()> {
    match input {
        InputLine::Observation { station, cell, obs } => {
            engine.ingest(&station, cell, obs).await?;
        }
        InputLine::Invalid(station) => {
            if engine.mark_invalid(&station).is_none() {
                warn!("INVALID for unknown station {}", station);
            }
        }
        InputLine::Valid(station) => {
            if engine.mark_valid(&station).is_none() {
                warn!("VALID for unknown station {}", station);
            }
        }
    }
    Ok(())
}

async fn run_http_server(
    port: u16,
    engine: Arc<Engine>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("HTTP server listening on port {}", port);

    loop {
        let (socket, addr) = listener.accept().await?;
        debug!("HTTP client connected: {}", addr);

        let engine = Arc::clone(&engine);

        tokio::spawn(async move {
            if let Err(e) = handle_http_request(socket, engine).await {
                debug!("HTTP error: {}", e);
            }
        });
    }
}

/// Requested bucket, `/<what>/<owner>/<kind>/<bucket>`
#[derive(Debug, PartialEq, Eq)]
struct BucketPath {
    owner: StationId,
    kind: AccumulatorKind,
    bucket: u32,
}

fn parse_bucket_path(rest: &str) -> Option<BucketPath> {
    let mut parts = rest.trim_matches('/').split('/');
    let owner = parts.next()?.parse().ok()?;
    let kind_name = parts.next()?;
    let kind = AccumulatorKind::ALL
        .into_iter()
        .find(|kind| kind.as_str() == kind_name)?;
    let bucket = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(BucketPath { owner, kind, bucket })
}

// Reads headers and, when a Content-Length is given, the whole body
async fn read_request(socket: &mut TcpStream) -> std::io::Result<Option<(String, Vec<u8>)>> {
    let mut buffer = Vec::with_capacity(8192);
    let mut chunk = vec![0u8; 8192];

    let header_end = loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buffer.len() > MAX_REQUEST {
            return Ok(None);
        }
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0)
        .min(MAX_REQUEST);

    let mut body = buffer[header_end..].to_vec();
    while body.len() < content_length {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);
    Ok(Some((head, body)))
}

async fn handle_http_request(
    mut socket: TcpStream,
    engine: Arc<Engine>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Some((request, body)) = read_request(&mut socket).await? else {
        return Ok(());
    };

    let first_line = request.lines().next().unwrap_or("");
    let parts: Vec<&str> = first_line.split_whitespace().collect();
    if parts.len() < 2 {
        return Ok(());
    }
    let (method, url) = (parts[0], parts[1]);

    let (status, content) = match (method, url) {
        ("GET", "/status") => ("200 OK", engine.status().to_string()),
        ("GET", "/stations") => ("200 OK", serde_json::to_string(&engine.stations())?),
        ("GET", path) if path.starts_with("/rows/") => {
            match parse_bucket_path(&path["/rows/".len()..]) {
                Some(p) => match engine.rows(p.owner, p.kind, p.bucket).await {
                    Ok(rows) => ("200 OK", serde_json::to_string(&rows)?),
                    Err(e) => ("500 Internal Server Error", error_json(&e.to_string())),
                },
                None => (
                    "400 Bad Request",
                    error_json("expected /rows/<owner>/<kind>/<bucket>"),
                ),
            }
        }
        ("POST", path) if path.starts_with("/rebuild/") => {
            match parse_bucket_path(&path["/rebuild/".len()..]) {
                Some(p) => match serde_json::from_slice::<Vec<CellRow>>(&body) {
                    Ok(rows) => match engine.rebuild(p.owner, p.kind, p.bucket, rows).await {
                        Ok(n) => ("200 OK", serde_json::json!({ "rebuilt": n }).to_string()),
                        Err(e) => ("422 Unprocessable Entity", error_json(&e.to_string())),
                    },
                    Err(e) => ("400 Bad Request", error_json(&e.to_string())),
                },
                None => (
                    "400 Bad Request",
                    error_json("expected /rebuild/<owner>/<kind>/<bucket>"),
                ),
            }
        }
        _ => ("404 Not Found", error_json("not found")),
    };

    let header = format!(
        "HTTP/1.1 {}\r\n\
         Server: coverage-rs\r\n\
         Content-Type: application/json;charset=utf-8\r\n\
         Connection: close\r\n\
         Content-Length: {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         \r\n",
        status,
        content.len()
    );

    socket.write_all(header.as_bytes()).await?;
    socket.write_all(content.as_bytes()).await?;

    Ok(())
}

fn error_json(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}
