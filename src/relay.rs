use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::RwLock;
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use rand::RngCore;
use serde::Deserialize;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};

use crate::{get_session_by_cwd, load_config, send_file, send_message};

pub(crate) const MAX_TELEGRAM_FILE_SIZE: u64 = 50 * 1024 * 1024;
const DEFAULT_RELAY_URL: &str = "https://ccc-relay.fly.dev";
const STREAM_CHUNK_SIZE: usize = 32 * 1024;
const CHANNEL_DEPTH: usize = 100;
const TRANSFER_TTL: Duration = Duration::from_secs(15 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DOWNLOAD_WAIT: Duration = Duration::from_secs(10 * 60);

// ── Server state ────────────────────────────────────────────────────────
//
// Pure pass-through: bytes go sender → bounded channel → receiver, never
// to disk. Channel endpoints are parked here until the matching HTTP
// request claims them.

struct RelayTransfer {
    filename: String,
    size: i64,
    status: String,
    created: Instant,
    /// Claimed by the sender's `/stream` request.
    data_tx: Option<SyncSender<Vec<u8>>>,
    done_rx: std::sync::Mutex<Option<Receiver<()>>>,
    /// Claimed by the receiver's `/d` request.
    data_rx: std::sync::Mutex<Option<Receiver<Vec<u8>>>>,
    done_tx: Option<mpsc::Sender<()>>,
}

static TRANSFERS: Lazy<RwLock<HashMap<String, RelayTransfer>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn transfers_read() -> std::sync::RwLockReadGuard<'static, HashMap<String, RelayTransfer>> {
    TRANSFERS.read().unwrap_or_else(|e| e.into_inner())
}

fn transfers_write() -> std::sync::RwLockWriteGuard<'static, HashMap<String, RelayTransfer>> {
    TRANSFERS.write().unwrap_or_else(|e| e.into_inner())
}

#[derive(Deserialize)]
struct RegisterRequest {
    token: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    size: i64,
}

pub(crate) fn run_relay_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    // Sweep abandoned transfers; dropping the entry closes both channel
    // ends, which unblocks any party still waiting.
    thread::spawn(|| loop {
        thread::sleep(SWEEP_INTERVAL);
        let mut map = transfers_write();
        map.retain(|token, t| {
            let expired = t.created.elapsed() > TRANSFER_TTL;
            if expired {
                t.status = "cancelled".to_string();
                println!("🧹 Expired: {} ({})", t.filename, token_prefix(token));
            }
            !expired
        });
    });

    let server = Server::http(("0.0.0.0", port))
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("relay server: {e}")))?;
    println!("🚀 Streaming relay server on :{port}");
    println!("   No files stored - direct sender→relay→receiver streaming!");

    for request in server.incoming_requests() {
        thread::spawn(move || handle_relay_request(request));
    }
    Ok(())
}

fn token_prefix(token: &str) -> &str {
    &token[..token.len().min(8)]
}

fn respond_text(request: Request, status: u16, body: &str) {
    let response = Response::from_string(body).with_status_code(StatusCode(status));
    let _ = request.respond(response);
}

fn handle_relay_request(request: Request) {
    let url = request.url().to_string();
    let method = request.method().clone();

    if url == "/health" {
        respond_text(request, 200, "OK");
        return;
    }
    if url == "/register" {
        if method != Method::Post {
            respond_text(request, 405, "Method not allowed");
            return;
        }
        handle_register(request);
        return;
    }
    if let Some(token) = url.strip_prefix("/status/") {
        let status = {
            let map = transfers_read();
            map.get(token).map(|t| t.status.clone())
        };
        respond_text(request, 200, &status.unwrap_or_else(|| "not_found".to_string()));
        return;
    }
    if let Some(token) = url.strip_prefix("/cancel/") {
        {
            let mut map = transfers_write();
            if let Some(mut t) = map.remove(token) {
                t.status = "cancelled".to_string();
            }
        }
        respond_text(request, 200, "");
        return;
    }
    if let Some(token) = url.strip_prefix("/stream/") {
        if method != Method::Post {
            respond_text(request, 405, "Method not allowed");
            return;
        }
        handle_stream(request, token.to_string());
        return;
    }
    if let Some(rest) = url.strip_prefix("/d/") {
        handle_download(request, rest.to_string());
        return;
    }

    respond_text(request, 404, "Not found");
}

fn handle_register(mut request: Request) {
    let mut body = String::new();
    if request.as_reader().take(64 * 1024).read_to_string(&mut body).is_err() {
        respond_text(request, 400, "Invalid body");
        return;
    }
    let Ok(data) = serde_json::from_str::<RegisterRequest>(&body) else {
        respond_text(request, 400, "Invalid JSON");
        return;
    };

    {
        let mut map = transfers_write();
        map.insert(
            data.token.clone(),
            RelayTransfer {
                filename: data.filename.clone(),
                size: data.size,
                status: "waiting".to_string(),
                created: Instant::now(),
                data_tx: None,
                done_rx: std::sync::Mutex::new(None),
                data_rx: std::sync::Mutex::new(None),
                done_tx: None,
            },
        );
    }

    println!("📋 Registered: {} ({})", data.filename, token_prefix(&data.token));
    respond_text(request, 200, "");
}

/// Sender push: only legal once a receiver moved the transfer to
/// `ready`. Bytes are forwarded chunk by chunk; a dead receiver surfaces
/// as a channel send error.
fn handle_stream(mut request: Request, token: String) {
    let claimed = {
        let mut map = transfers_write();
        match map.get_mut(&token) {
            Some(t) if t.status == "ready" => match (t.data_tx.take(), t.done_rx.lock().unwrap_or_else(|e| e.into_inner()).take()) {
                (Some(data_tx), Some(done_rx)) => {
                    t.status = "streaming".to_string();
                    Some((data_tx, done_rx, t.filename.clone()))
                }
                _ => None,
            },
            _ => None,
        }
    };
    let Some((data_tx, done_rx, filename)) = claimed else {
        respond_text(request, 400, "Transfer not ready");
        return;
    };

    println!("📤 Streaming: {} ({})", filename, token_prefix(&token));

    let mut bytes_sent: u64 = 0;
    let mut early_exit = false;
    {
        let reader = request.as_reader();
        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    bytes_sent += n as u64;
                    if data_tx.send(buf[..n].to_vec()).is_err() {
                        // Receiver finished or disconnected early.
                        println!(
                            "📤 Receiver done early: {} ({}) after {} bytes",
                            filename,
                            token_prefix(&token),
                            bytes_sent
                        );
                        early_exit = true;
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    }

    if !early_exit {
        // EOF: close our end, then wait for the receiver to flush. The
        // transfer entry stays alive so the same link can serve again.
        drop(data_tx);
        let _ = done_rx.recv();
        println!(
            "✅ Stream complete: {} ({}) - {} bytes",
            filename,
            token_prefix(&token),
            bytes_sent
        );
    }
    respond_text(request, 200, "");
}

/// Reads chunks off the relay channel for the HTTP response body.
struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
}

impl Read for ChannelReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.offset >= self.pending.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.offset = 0;
                }
                // Channel closed: sender is done.
                Err(_) => return Ok(0),
            }
        }
        let n = (self.pending.len() - self.offset).min(out.len());
        out[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c == '"' || c == '\n' || c == '\r' || (c as u32) < 32 {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// Receiver download. Link-preview crawlers are turned away so the
/// one-time stream is not burned by Telegram's URL preview fetch.
fn handle_download(request: Request, path_rest: String) {
    let user_agent = request
        .headers()
        .iter()
        .find(|h| h.field.equiv("User-Agent"))
        .map(|h| h.value.as_str().to_string())
        .unwrap_or_default();
    if user_agent.contains("Telegram") {
        println!("🚫 Ignored Telegram preview bot: {user_agent}");
        respond_text(request, 403, "Preview not available");
        return;
    }
    if *request.method() == Method::Head {
        println!("🚫 Ignored HEAD request");
        respond_text(request, 200, "");
        return;
    }

    // URL format: /d/{token}/{filename}; only the token matters.
    let token = path_rest.split('/').next().unwrap_or("").to_string();

    let claimed = {
        let mut map = transfers_write();
        match map.get_mut(&token) {
            None => None,
            Some(t) => {
                if t.status == "waiting" {
                    // Fresh channels for this download round.
                    let (data_tx, data_rx) = mpsc::sync_channel(CHANNEL_DEPTH);
                    let (done_tx, done_rx) = mpsc::channel();
                    t.status = "ready".to_string();
                    t.data_tx = Some(data_tx);
                    *t.done_rx.lock().unwrap_or_else(|e| e.into_inner()) = Some(done_rx);
                    *t.data_rx.lock().unwrap_or_else(|e| e.into_inner()) = Some(data_rx);
                    t.done_tx = Some(done_tx);
                }
                if t.status != "ready" && t.status != "streaming" {
                    Some(Err(409))
                } else {
                    match (
                        t.data_rx.lock().unwrap_or_else(|e| e.into_inner()).take(),
                        t.done_tx.take(),
                    ) {
                        (Some(data_rx), Some(done_tx)) => {
                            Some(Ok((data_rx, done_tx, t.filename.clone(), t.size)))
                        }
                        // Another receiver already holds the stream.
                        _ => Some(Err(409)),
                    }
                }
            }
        }
    };

    let (data_rx, done_tx, filename, size) = match claimed {
        None => {
            respond_text(request, 404, "File not found - sender may have disconnected");
            return;
        }
        Some(Err(status)) => {
            respond_text(request, status, "Transfer in progress, please wait and retry");
            return;
        }
        Some(Ok(parts)) => parts,
    };

    println!(
        "📥 Download started: {} ({}) from {}",
        filename,
        token_prefix(&token),
        user_agent
    );

    let mut headers: Vec<Header> = Vec::new();
    if let Ok(h) = Header::from_bytes(
        &b"Content-Disposition"[..],
        format!("attachment; filename=\"{}\"", sanitize_filename(&filename)).as_bytes(),
    ) {
        headers.push(h);
    }
    if let Ok(h) = Header::from_bytes(&b"Content-Type"[..], &b"application/octet-stream"[..]) {
        headers.push(h);
    }

    let reader = ChannelReader {
        rx: data_rx,
        pending: Vec::new(),
        offset: 0,
    };
    let content_length = if size > 0 { Some(size as usize) } else { None };
    let response = Response::new(StatusCode(200), headers, reader, content_length, None);

    // Blocks until the sender closes the channel or the client drops.
    let result = request.respond(response);

    // Signal the sender we are done, then rearm the link for the next
    // download within the transfer's lifetime.
    drop(done_tx);
    {
        let mut map = transfers_write();
        if let Some(t) = map.get_mut(&token) {
            t.status = "waiting".to_string();
        }
    }
    match result {
        Ok(()) => println!("📥 Download complete: {} ({})", filename, token_prefix(&token)),
        Err(_) => println!(
            "📥 Download failed: {} ({}) - allowing retry",
            filename,
            token_prefix(&token)
        ),
    }
}

// ── Client side: `ccc send <file>` ──────────────────────────────────────

pub(crate) fn handle_send_file(file_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config().map_err(|e| format!("no config found: {e}"))?;

    let file_path = if file_path.is_absolute() {
        file_path.to_path_buf()
    } else {
        std::env::current_dir()?.join(file_path)
    };
    let file_info = std::fs::metadata(&file_path).map_err(|e| format!("file not found: {e}"))?;

    // The session comes from the directory `send` runs in.
    let cwd = std::env::current_dir()?.to_string_lossy().into_owned();
    let Some((sess_name, topic_id)) = get_session_by_cwd(&config, &cwd) else {
        return Err("no session found for current directory".into());
    };
    if topic_id == 0 || config.group_id == 0 {
        return Err("no session found for current directory".into());
    }

    let file_name = file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let file_size = file_info.len();

    if file_size < MAX_TELEGRAM_FILE_SIZE {
        println!("📤 Sending {} ({} MB) via Telegram...", file_name, file_size / (1024 * 1024));
        return send_file(&config, config.group_id, topic_id, &file_path, "");
    }

    let relay_url = if config.relay_url.is_empty() {
        DEFAULT_RELAY_URL.to_string()
    } else {
        config.relay_url.clone()
    };

    println!(
        "📤 Preparing {} ({} MB) for streaming relay...",
        file_name,
        file_size / (1024 * 1024)
    );

    let token = generate_token();

    let agent = relay_agent();
    agent
        .post(&format!("{relay_url}/register"))
        .send_json(serde_json::json!({
            "token": token,
            "filename": file_name,
            "size": file_size,
        }))
        .map_err(|e| format!("failed to register with relay: {e}"))?;

    // Filename in the URL keeps browsers happy about the download name.
    let download_url = format!("{relay_url}/d/{token}/{file_name}");
    let msg = format!(
        "📦 {} ({} MB)\n\n🔗 Download:\n{}",
        file_name,
        file_size / (1024 * 1024),
        download_url
    );
    println!("📤 Sending link to {sess_name}...");
    send_message(&config, config.group_id, topic_id, &msg)?;

    println!("⏳ Waiting for download (link expires in 10 min)...");
    stream_file_to_relay(&relay_url, &token, &file_path, &file_name, file_size)
}

pub(crate) fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn relay_agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(10))
        .timeout_read(Duration::from_secs(30 * 60))
        .build()
}

/// Poll `/status` and stream the file on every `ready`, looping so the
/// link can serve several downloads until the wait window closes.
fn stream_file_to_relay(
    relay_url: &str,
    token: &str,
    file_path: &Path,
    file_name: &str,
    file_size: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let agent = relay_agent();
    let deadline = Instant::now() + DOWNLOAD_WAIT;
    let mut download_count = 0u32;

    loop {
        if Instant::now() >= deadline {
            let _ = agent.get(&format!("{relay_url}/cancel/{token}")).call();
            if download_count > 0 {
                println!("⏰ Session expired after {download_count} download(s)");
                return Ok(());
            }
            return Err("download timed out (10 min)".into());
        }
        thread::sleep(Duration::from_secs(1));

        let Ok(response) = agent.get(&format!("{relay_url}/status/{token}")).call() else {
            continue;
        };
        let status = response.into_string().unwrap_or_default();

        match status.as_str() {
            "waiting" => continue,
            "ready" => {
                download_count += 1;
                println!("📤 Streaming {file_name} (download #{download_count})...");

                let file = File::open(file_path)?;
                let result = agent
                    .post(&format!("{relay_url}/stream/{token}"))
                    .set("Content-Type", "application/octet-stream")
                    .set("X-Filename", file_name)
                    .set("Content-Length", &file_size.to_string())
                    .send(file);
                if let Err(err) = result {
                    println!("⚠️ Streaming error: {err}");
                    continue;
                }
                println!("✅ Download #{download_count} complete! Waiting for more requests...");
            }
            "cancelled" | "not_found" => {
                if download_count > 0 {
                    return Ok(());
                }
                return Err(format!("transfer {status}").into());
            }
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_transfer(token: &str, status: &str) {
        let mut map = transfers_write();
        map.insert(
            token.to_string(),
            RelayTransfer {
                filename: "huge.zip".to_string(),
                size: 120_000_000,
                status: status.to_string(),
                created: Instant::now(),
                data_tx: None,
                done_rx: std::sync::Mutex::new(None),
                data_rx: std::sync::Mutex::new(None),
                done_tx: None,
            },
        );
    }

    fn remove_transfer(token: &str) {
        transfers_write().remove(token);
    }

    #[test]
    fn test_generate_token_shape() {
        let token = generate_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(generate_token(), generate_token());
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("a\"b\nc\rd"), "a_b_c_d");
        assert_eq!(sanitize_filename("tab\tname"), "tab_name");
    }

    #[test]
    fn test_status_lookup() {
        insert_transfer("tok-status", "waiting");
        {
            let map = transfers_read();
            assert_eq!(map.get("tok-status").unwrap().status, "waiting");
            assert!(map.get("tok-missing").is_none());
        }
        remove_transfer("tok-status");
    }

    #[test]
    fn test_waiting_to_ready_creates_channels() {
        insert_transfer("tok-ready", "waiting");
        {
            let mut map = transfers_write();
            let t = map.get_mut("tok-ready").unwrap();
            // The transition handle_download performs.
            let (data_tx, data_rx) = mpsc::sync_channel(CHANNEL_DEPTH);
            let (done_tx, done_rx) = mpsc::channel();
            t.status = "ready".to_string();
            t.data_tx = Some(data_tx);
            *t.done_rx.lock().unwrap() = Some(done_rx);
            *t.data_rx.lock().unwrap() = Some(data_rx);
            t.done_tx = Some(done_tx);
        }
        {
            let map = transfers_read();
            let t = map.get("tok-ready").unwrap();
            assert_eq!(t.status, "ready");
            assert!(t.data_tx.is_some() && t.data_rx.lock().unwrap().is_some());
        }
        remove_transfer("tok-ready");
    }

    #[test]
    fn test_channel_reader_reassembles_chunks() {
        let (tx, rx) = mpsc::sync_channel(4);
        tx.send(b"hello ".to_vec()).unwrap();
        tx.send(b"world".to_vec()).unwrap();
        drop(tx);

        let mut reader = ChannelReader {
            rx,
            pending: Vec::new(),
            offset: 0,
        };
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn test_channel_reader_partial_reads() {
        let (tx, rx) = mpsc::sync_channel(1);
        tx.send(vec![1, 2, 3, 4, 5]).unwrap();
        drop(tx);

        let mut reader = ChannelReader {
            rx,
            pending: Vec::new(),
            offset: 0,
        };
        let mut buf = [0u8; 2];
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [1, 2]);
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [3, 4]);
        assert_eq!(reader.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], 5);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_sender_sees_receiver_disconnect() {
        let (data_tx, data_rx) = mpsc::sync_channel::<Vec<u8>>(1);
        drop(data_rx);
        assert!(data_tx.send(vec![0u8; 8]).is_err());
    }

    #[test]
    fn test_done_channel_signals_on_drop() {
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let waiter = thread::spawn(move || done_rx.recv());
        drop(done_tx);
        // recv errors out once the receiver's handle is gone; the sender
        // is released rather than stuck.
        assert!(waiter.join().unwrap().is_err());
    }

    #[test]
    fn test_full_transfer_round_trip_through_channels() {
        // Sender thread pushes three chunks; reader drains them like the
        // download response body would.
        let (data_tx, data_rx) = mpsc::sync_channel(CHANNEL_DEPTH);
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let sender = thread::spawn(move || {
            for chunk in [&b"abc"[..], &b"defg"[..], &b"hi"[..]] {
                data_tx.send(chunk.to_vec()).unwrap();
            }
            drop(data_tx);
            // Wait for the receiver to finish flushing.
            let _ = done_rx.recv();
        });

        let mut reader = ChannelReader {
            rx: data_rx,
            pending: Vec::new(),
            offset: 0,
        };
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcdefghi");
        drop(done_tx);
        sender.join().unwrap();
    }
}
