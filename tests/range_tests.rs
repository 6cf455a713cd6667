//! Range requests against file-backed responses: single ranges are
//! served zero-copy from the file window, multiple ranges become a
//! multipart/byteranges body, and nonsense is answered with 416.

mod common;

use std::fs;

use common::{basic_config, roundtrip, start, temp_root, Client};
use server_core::Hooks;

fn file_4096() -> Vec<u8> {
    (0..4096u32).map(|i| (i % 251) as u8).collect()
}

fn serve_big(name: &str) -> (common::TestServer, Vec<u8>) {
    let root = temp_root(name);
    let data = file_4096();
    fs::write(root.join("big.bin"), &data).unwrap();
    let server = start(basic_config(root.to_str().unwrap(), vec![]), Hooks::default());
    (server, data)
}

#[test]
fn single_range_returns_the_window() {
    let (server, data) = serve_big("range-single");

    let mut client = Client::connect(&server.addr);
    client.send("GET /big.bin HTTP/1.1\r\nHost: x\r\nRange: bytes=100-199\r\n\r\n");
    let response = client.read_response();

    assert_eq!(response.status, 206);
    assert_eq!(
        response.header("content-range"),
        Some("bytes 100-199/4096")
    );
    assert_eq!(response.header("content-length"), Some("100"));
    assert_eq!(response.body, &data[100..200]);
}

#[test]
fn suffix_and_open_ranges() {
    let (server, data) = serve_big("range-suffix");

    let mut client = Client::connect(&server.addr);
    client.send("GET /big.bin HTTP/1.1\r\nHost: x\r\nRange: bytes=-100\r\n\r\n");
    let response = client.read_response();
    assert_eq!(response.status, 206);
    assert_eq!(
        response.header("content-range"),
        Some("bytes 3996-4095/4096")
    );
    assert_eq!(response.body, &data[3996..]);

    client.send("GET /big.bin HTTP/1.1\r\nHost: x\r\nRange: bytes=4000-\r\n\r\n");
    let response = client.read_response();
    assert_eq!(response.status, 206);
    assert_eq!(response.body, &data[4000..]);
}

#[test]
fn unsatisfiable_range_is_416() {
    let (server, _) = serve_big("range-416");

    let mut client = Client::connect(&server.addr);
    client.send("GET /big.bin HTTP/1.1\r\nHost: x\r\nRange: bytes=9000-9100\r\n\r\n");
    let response = client.read_response();
    assert_eq!(response.status, 416);
    assert_eq!(response.header("content-range"), Some("bytes */4096"));
    assert!(response.body.is_empty());
}

#[test]
fn malformed_range_serves_the_full_entity() {
    let (server, data) = serve_big("range-garbage");

    let mut client = Client::connect(&server.addr);
    client.send("GET /big.bin HTTP/1.1\r\nHost: x\r\nRange: bytes=oops\r\n\r\n");
    let response = client.read_response();
    assert_eq!(response.status, 200);
    assert_eq!(response.body.len(), data.len());
}

#[test]
fn multiple_ranges_build_a_multipart_body() {
    let root = temp_root("range-multi");
    let data = file_4096();
    fs::write(root.join("big.bin"), &data).unwrap();
    let server = start(basic_config(root.to_str().unwrap(), vec![]), Hooks::default());

    // HTTP/1.0 keeps the multipart body close-delimited and easy to
    // inspect raw.
    let response = roundtrip(
        &server.addr,
        "GET /big.bin HTTP/1.0\r\nHost: x\r\nRange: bytes=0-1,-2\r\n\r\n",
    );
    assert!(response.starts_with("HTTP/1.1 206"), "got: {response}");
    assert!(response.contains("Content-Type: multipart/byteranges; boundary="));
    assert!(response.contains("Content-Range: bytes 0-1/4096"));
    assert!(response.contains("Content-Range: bytes 4094-4095/4096"));
    let boundary_count = response.matches("--").count();
    assert!(boundary_count >= 3, "two parts plus the terminator");
}
