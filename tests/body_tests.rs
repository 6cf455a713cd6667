//! Request-body intake over real sockets: identity and chunked bodies,
//! Expect: 100-continue, the body timeout, and oversized payloads.

mod common;

use std::time::Duration;

use common::{basic_config, start, temp_root, Client};
use server_core::{Buf, Chain, Fin, Hooks, LocationConfig, PhaseCode, Rid, Worker};

fn upload_handler(w: &mut Worker, rid: Rid) -> PhaseCode {
    w.read_client_request_body(rid, upload_done);
    PhaseCode::Done
}

fn upload_done(w: &mut Worker, rid: Rid) {
    let received = w
        .req(rid)
        .map(|r| r.body.received.len())
        .unwrap_or(0);
    let body = format!("got {received} bytes");
    {
        let Some(request) = w.req_mut(rid) else {
            return;
        };
        request.headers_out.status = 200;
        request.headers_out.content_type = Some("text/plain".to_string());
        request.headers_out.content_length = Some(body.len() as u64);
    }
    w.send_header(rid);
    let mut chain = Chain::new();
    let mut buf = Buf::mem(body.into_bytes());
    buf.last_buf = true;
    chain.push_back(buf);
    w.output_filter(rid, chain);
    w.finalize_request(rid, Fin::Ok);
}

fn upload_config(root: &str, body_timeout_ms: u64) -> (server_core::AppConfig, Hooks) {
    let mut config = basic_config(
        root,
        vec![LocationConfig {
            pattern: "/upload".to_string(),
            ..Default::default()
        }],
    );
    config.http.client_body_timeout_ms = body_timeout_ms;
    let mut hooks = Hooks::default();
    hooks
        .content_handlers
        .push(("/upload".to_string(), upload_handler));
    (config, hooks)
}

#[test]
fn identity_body_is_consumed_and_answered() {
    let root = temp_root("body-identity");
    let (config, hooks) = upload_config(root.to_str().unwrap(), 60_000);
    let server = start(config, hooks);

    let mut client = Client::connect(&server.addr);
    client.send(
        "POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\n\r\nhello world",
    );
    let response = client.read_response();
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "got 11 bytes");
}

#[test]
fn chunked_body_reassembles_across_writes() {
    let root = temp_root("body-chunked");
    let (config, hooks) = upload_config(root.to_str().unwrap(), 60_000);
    let server = start(config, hooks);

    let mut client = Client::connect(&server.addr);
    client.send(
        "POST /upload HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n",
    );
    std::thread::sleep(Duration::from_millis(50));
    client.send("5\r\nhello\r\n");
    std::thread::sleep(Duration::from_millis(50));
    // The next chunk-size line straddles two writes.
    client.send("7");
    std::thread::sleep(Duration::from_millis(50));
    client.send("\r\n world!\r\n0\r\n\r\n");

    let response = client.read_response();
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "got 12 bytes");
}

#[test]
fn expect_100_continue_interim_response() {
    let root = temp_root("body-expect");
    let (config, hooks) = upload_config(root.to_str().unwrap(), 60_000);
    let server = start(config, hooks);

    let mut client = Client::connect(&server.addr);
    client.send(
        "POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\n",
    );
    let interim = client.read_response();
    assert_eq!(interim.status, 100);

    client.send("data");
    let response = client.read_response();
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "got 4 bytes");
}

#[test]
fn stalled_body_times_out_with_408() {
    let root = temp_root("body-timeout");
    let (config, hooks) = upload_config(root.to_str().unwrap(), 300);
    let server = start(config, hooks);

    let mut client = Client::connect(&server.addr);
    client.send("POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: 100\r\n\r\n");
    client.send("only fifty bytes of the promised one hundred here");
    // Stall past the body timeout.
    std::thread::sleep(Duration::from_millis(900));

    let response = client.read_response();
    assert_eq!(response.status, 408);
    assert_eq!(response.header("connection"), Some("close"));

    // The server must close after the timeout response.
    let mut probe = Vec::new();
    use std::io::Read;
    let _ = client.stream.read_to_end(&mut probe);
    assert!(probe.is_empty());
}

#[test]
fn oversized_declared_body_is_rejected() {
    let root = temp_root("body-too-big");
    let (mut config, hooks) = upload_config(root.to_str().unwrap(), 60_000);
    config.http.servers[0].client_max_body_size = 16;
    let server = start(config, hooks);

    let mut client = Client::connect(&server.addr);
    client.send("POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: 64\r\n\r\n");
    let response = client.read_response();
    assert_eq!(response.status, 413);
}

#[test]
fn post_without_reader_still_closes_cleanly() {
    let root = temp_root("body-unread");
    std::fs::write(root.join("page.txt"), "static").unwrap();
    let server = start(
        basic_config(root.to_str().unwrap(), vec![]),
        Hooks::default(),
    );

    // The static handler never reads the body; the server answers 405
    // and must not treat the body bytes as a pipelined request.
    let mut client = Client::connect(&server.addr);
    client.send("POST /page.txt HTTP/1.1\r\nHost: x\r\nContent-Length: 12\r\n\r\nGET /bad HTTP");
    let response = client.read_response();
    assert_eq!(response.status, 405);
}
