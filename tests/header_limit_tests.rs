//! Large-header handling: requests overflowing the small client header
//! buffer migrate into large buffers without losing bytes; exhausting
//! the large-buffer budget answers 414 (request line) or 400 (headers).

mod common;

use std::fs;

use common::{basic_config, start, temp_root, Client};
use server_core::Hooks;

fn tight_config(root: &str) -> server_core::AppConfig {
    let mut config = basic_config(root, vec![]);
    config.http.client_header_buffer_size = 64;
    config.http.large_client_header_buffers = server_core::config::BufSpec {
        count: 2,
        size: 512,
    };
    config
}

#[test]
fn uri_spilling_the_small_buffer_still_parses() {
    let root = temp_root("hdr-spill");
    let name = "a".repeat(200);
    fs::write(root.join(&name), "long name file").unwrap();
    let server = start(tight_config(root.to_str().unwrap()), Hooks::default());

    // Request line is ~220 bytes: three buffer migrations' worth of
    // parser span relocation.
    let mut client = Client::connect(&server.addr);
    client.send(&format!("GET /{name} HTTP/1.1\r\nHost: x\r\n\r\n"));
    let response = client.read_response();
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "long name file");
}

#[test]
fn request_line_exceeding_large_buffers_is_414() {
    let root = temp_root("hdr-414");
    let server = start(tight_config(root.to_str().unwrap()), Hooks::default());

    let mut client = Client::connect(&server.addr);
    let long = "x".repeat(2000);
    client.send(&format!("GET /{long} HTTP/1.1\r\nHost: x\r\n\r\n"));
    let response = client.read_response();
    assert_eq!(response.status, 414);
}

#[test]
fn header_block_exceeding_large_buffers_is_400() {
    let root = temp_root("hdr-400");
    let server = start(tight_config(root.to_str().unwrap()), Hooks::default());

    let mut client = Client::connect(&server.addr);
    let long_value = "v".repeat(2000);
    client.send(&format!(
        "GET / HTTP/1.1\r\nHost: x\r\nX-Big: {long_value}\r\n\r\n"
    ));
    let response = client.read_response();
    assert_eq!(response.status, 400);
}

#[test]
fn request_exactly_filling_the_small_buffer() {
    let root = temp_root("hdr-exact");
    fs::write(root.join("f.txt"), "fits").unwrap();
    let server = start(tight_config(root.to_str().unwrap()), Hooks::default());

    // Pad the header block to land exactly on the 64-byte boundary.
    let mut request = "GET /f.txt HTTP/1.1\r\nHost: x\r\n".to_string();
    let padding = 64 - request.len() - "\r\n".len() - "X-P: \r\n".len();
    request.push_str(&format!("X-P: {}\r\n\r\n", "p".repeat(padding)));
    assert_eq!(request.len(), 64);

    let mut client = Client::connect(&server.addr);
    client.send(&request);
    let response = client.read_response();
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "fits");
}
