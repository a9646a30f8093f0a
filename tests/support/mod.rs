#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration as StdDuration;

use anyhow::{Result, anyhow};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use api_recorder::cli::LogFormat;
use api_recorder::settings::Settings;

pub fn find_free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

pub async fn wait_for_listener(addr: SocketAddr) -> Result<()> {
    for _ in 0..50 {
        match timeout(StdDuration::from_millis(50), TcpStream::connect(addr)).await {
            Ok(Ok(mut stream)) => {
                stream.shutdown().await.ok();
                return Ok(());
            }
            _ => sleep(StdDuration::from_millis(50)).await,
        }
    }
    Err(anyhow!("listener {addr} did not become ready"))
}

pub async fn read_http_response(stream: &mut TcpStream) -> Result<String> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).to_string())
}

/// Minimal scripted HTTP upstream that counts the requests it serves.
pub struct MockUpstream {
    listener: TcpListener,
    pub requests: Arc<AtomicUsize>,
    status_line: String,
    body: String,
}

impl MockUpstream {
    pub async fn new(status_line: &str, body: &str) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        Ok(Self {
            listener,
            requests: Arc::new(AtomicUsize::new(0)),
            status_line: status_line.to_string(),
            body: body.to_string(),
        })
    }

    pub async fn ok(body: &str) -> Result<Self> {
        Self::new("HTTP/1.1 200 OK", body).await
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    pub fn run(self) -> JoinHandle<()> {
        let MockUpstream {
            listener,
            requests,
            status_line,
            body,
        } = self;
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => break,
                };
                let requests = requests.clone();
                let status_line = status_line.clone();
                let body = body.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let mut data = Vec::new();
                    loop {
                        let n = socket.read(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        data.extend_from_slice(&buf[..n]);
                        if data.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    if data.is_empty() {
                        return;
                    }
                    requests.fetch_add(1, Ordering::SeqCst);

                    let response = format!(
                        "{}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status_line,
                        body.len(),
                        body
                    );
                    socket.write_all(response.as_bytes()).await.ok();
                    socket.shutdown().await.ok();
                });
            }
        })
    }
}

/// A running recorder instance over a temp cache directory.
pub struct RecorderHarness {
    pub addr: SocketAddr,
    pub cache_dir: PathBuf,
    _temp: TempDir,
    handle: JoinHandle<()>,
}

impl RecorderHarness {
    pub async fn spawn(upstream_port: u16) -> Result<Self> {
        Self::spawn_with(upstream_port, false).await
    }

    pub async fn spawn_pass_through(upstream_port: u16) -> Result<Self> {
        Self::spawn_with(upstream_port, true).await
    }

    async fn spawn_with(upstream_port: u16, pass_through: bool) -> Result<Self> {
        let temp = TempDir::new()?;
        let cache_dir = temp.path().join("recordings");
        let port = find_free_port()?;
        let addr: SocketAddr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

        let settings = Settings {
            listen: addr,
            upstream_host: "127.0.0.1".to_string(),
            upstream_port,
            cache_dir: cache_dir.clone(),
            pass_through,
            log: LogFormat::Text,
            client_timeout: 5,
            upstream_connect_timeout: 2,
            upstream_timeout: 5,
            max_header_size: 32 * 1024,
            max_body_size: 1024 * 1024,
        };
        settings.validate()?;

        let handle = tokio::spawn(async move {
            let _ = api_recorder::run(settings).await;
        });
        wait_for_listener(addr).await?;

        Ok(Self {
            addr,
            cache_dir,
            _temp: temp,
            handle,
        })
    }

    pub async fn request(&self, raw: &str) -> Result<String> {
        let mut stream = TcpStream::connect(self.addr).await?;
        stream.write_all(raw.as_bytes()).await?;
        read_http_response(&mut stream).await
    }

    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

impl Drop for RecorderHarness {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
