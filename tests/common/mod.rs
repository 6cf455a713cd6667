//! Shared harness for the integration tests: spin up a runtime with one
//! worker on an ephemeral loopback port and speak raw HTTP to it.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use server_core::{
    spawn_workers, AppConfig, Hooks, ListenConfig, LocationConfig, Runtime, ServerConfig,
};

pub struct TestServer {
    pub rt: Arc<Runtime>,
    pub addr: String,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.rt.shutdown();
    }
}

pub fn start(config: AppConfig, hooks: Hooks) -> TestServer {
    start_workers(config, hooks, 1)
}

pub fn start_workers(config: AppConfig, hooks: Hooks, workers: usize) -> TestServer {
    let rt = Runtime::build_with(config, hooks).expect("runtime builds");
    let addr = rt.listeners[0].bound.local_addr();
    let _handles = spawn_workers(&rt, workers);
    // Give the workers a moment to register their listeners.
    std::thread::sleep(Duration::from_millis(100));
    TestServer { rt, addr }
}

/// A server rooted at `root` with a catch-all location plus any extras.
pub fn basic_config(root: &str, extra_locations: Vec<LocationConfig>) -> AppConfig {
    let mut locations = vec![LocationConfig::default()];
    locations.extend(extra_locations);
    let mut config = AppConfig::default();
    config.http.servers.push(ServerConfig {
        listen: vec![ListenConfig {
            addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        }],
        root: root.to_string(),
        default_server: true,
        locations,
        ..Default::default()
    });
    config
}

/// Fresh scratch directory under the system tmp area.
pub fn temp_root(name: &str) -> PathBuf {
    let dir = std::env::temp_dir()
        .join("server_core_tests")
        .join(format!("{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("create test root");
    dir
}

/// Send a request and collect everything until the server closes.
pub fn roundtrip(addr: &str, request: &str) -> String {
    let mut client = Client::connect(addr);
    client.send(request);
    let mut response = Vec::new();
    let _ = client.stream.read_to_end(&mut response);
    String::from_utf8_lossy(&response).into_owned()
}

pub struct Response {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A raw HTTP client that frames responses by Content-Length, keeping
/// pipelined bytes buffered for the next read.
pub struct Client {
    pub stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    pub fn connect(addr: &str) -> Client {
        let stream = TcpStream::connect(addr).expect("connect to test server");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        Client {
            stream,
            buf: Vec::new(),
        }
    }

    pub fn send(&mut self, request: &str) {
        self.stream
            .write_all(request.as_bytes())
            .expect("send request");
    }

    /// Read one framed response: status line, headers, Content-Length
    /// bytes of body.
    pub fn read_response(&mut self) -> Response {
        let mut scratch = [0u8; 2048];
        let header_end = loop {
            if let Some(pos) = find_blank_line(&self.buf) {
                break pos;
            }
            let n = self.stream.read(&mut scratch).expect("read response");
            assert!(n > 0, "connection closed before headers completed");
            self.buf.extend_from_slice(&scratch[..n]);
        };

        let head = String::from_utf8_lossy(&self.buf[..header_end]).into_owned();
        let mut lines = head.split("\r\n");
        let status_line = lines.next().expect("status line");
        let status: u16 = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| panic!("bad status line: {status_line}"));

        let mut headers = HashMap::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        let content_length: usize = headers
            .get("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        self.buf.drain(..header_end + 4);
        while self.buf.len() < content_length {
            let n = self.stream.read(&mut scratch).expect("read body");
            assert!(n > 0, "connection closed mid-body");
            self.buf.extend_from_slice(&scratch[..n]);
        }
        let body = self.buf.drain(..content_length).collect();

        Response {
            status,
            headers,
            body,
        }
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
