//! Subrequest interleaving: output of a request tree appears on the wire
//! exactly in emission order, children spliced where the parent launched
//! them.

mod common;

use common::{basic_config, roundtrip, start, temp_root};
use server_core::{Buf, Chain, Hooks, LocationConfig, PhaseCode, Rid, Worker};

fn emit(w: &mut Worker, rid: Rid, text: &str, last: bool) {
    let mut chain = Chain::new();
    let mut buf = Buf::mem(text.as_bytes().to_vec());
    buf.last_buf = last;
    chain.push_back(buf);
    w.output_filter(rid, chain);
}

fn compose_handler(w: &mut Worker, rid: Rid) -> PhaseCode {
    {
        let Some(request) = w.req_mut(rid) else {
            return PhaseCode::Status(500);
        };
        request.headers_out.status = 200;
        request.headers_out.content_type = Some("text/plain".to_string());
        // Close-delimited body: the interleaved length is not known up
        // front.
        request.headers_out.content_length = None;
    }
    w.send_header(rid);

    emit(w, rid, "A", false);
    w.subrequest(rid, "/frag1", None, None);
    emit(w, rid, "B", false);
    w.subrequest(rid, "/frag2", None, None);
    emit(w, rid, "C", true);
    PhaseCode::Ok
}

fn frag1_handler(w: &mut Worker, rid: Rid) -> PhaseCode {
    emit(w, rid, "[S1]", true);
    PhaseCode::Ok
}

fn frag2_handler(w: &mut Worker, rid: Rid) -> PhaseCode {
    emit(w, rid, "[S2]", true);
    PhaseCode::Ok
}

fn location(pattern: &str) -> LocationConfig {
    LocationConfig {
        pattern: pattern.to_string(),
        ..Default::default()
    }
}

fn compose_hooks() -> Hooks {
    let mut hooks = Hooks::default();
    hooks
        .content_handlers
        .push(("/compose".to_string(), compose_handler));
    hooks
        .content_handlers
        .push(("/frag1".to_string(), frag1_handler));
    hooks
        .content_handlers
        .push(("/frag2".to_string(), frag2_handler));
    hooks
}

#[test]
fn subrequest_output_is_byte_exact_in_order() {
    let root = temp_root("subreq");
    let config = basic_config(
        root.to_str().unwrap(),
        vec![location("/compose"), location("/frag1"), location("/frag2")],
    );
    let server = start(config, compose_hooks());

    // HTTP/1.0 keeps the body close-delimited, so the raw wire bytes are
    // directly observable.
    let response = roundtrip(&server.addr, "GET /compose HTTP/1.0\r\nHost: x\r\n\r\n");
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .unwrap_or("");
    assert_eq!(body, "A[S1]B[S2]C");
}

fn nested_handler(w: &mut Worker, rid: Rid) -> PhaseCode {
    {
        let Some(request) = w.req_mut(rid) else {
            return PhaseCode::Status(500);
        };
        request.headers_out.status = 200;
        request.headers_out.content_length = None;
    }
    w.send_header(rid);
    emit(w, rid, "<", false);
    // The child itself composes further children.
    w.subrequest(rid, "/compose", None, None);
    emit(w, rid, ">", true);
    PhaseCode::Ok
}

#[test]
fn nested_subrequests_preserve_order() {
    let root = temp_root("subreq-nested");
    let mut hooks = compose_hooks();
    hooks
        .content_handlers
        .push(("/nested".to_string(), nested_handler));
    let config = basic_config(
        root.to_str().unwrap(),
        vec![
            location("/nested"),
            location("/compose"),
            location("/frag1"),
            location("/frag2"),
        ],
    );
    let server = start(config, hooks);

    let response = roundtrip(&server.addr, "GET /nested HTTP/1.0\r\nHost: x\r\n\r\n");
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .unwrap_or("");
    assert_eq!(body, "<A[S1]B[S2]C>");
}

fn greedy_handler(w: &mut Worker, rid: Rid) -> PhaseCode {
    // Far beyond any sane budget; the engine must cut this off before
    // any header leaves.
    for _ in 0..1000 {
        if w.subrequest(rid, "/frag1", None, None).is_none() {
            return PhaseCode::Done;
        }
    }
    emit(w, rid, "never", true);
    PhaseCode::Ok
}

#[test]
fn subrequest_budget_exhaustion_fails_the_request() {
    let root = temp_root("subreq-budget");
    let mut hooks = compose_hooks();
    hooks
        .content_handlers
        .push(("/greedy".to_string(), greedy_handler));
    let config = basic_config(
        root.to_str().unwrap(),
        vec![location("/greedy"), location("/frag1")],
    );
    let server = start(config, hooks);

    let response = roundtrip(&server.addr, "GET /greedy HTTP/1.0\r\nHost: x\r\n\r\n");
    assert!(
        response.starts_with("HTTP/1.1 500"),
        "budget exhaustion answers 500, got: {}",
        response.lines().next().unwrap_or("")
    );
}
