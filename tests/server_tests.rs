//! End-to-end tests over real sockets: static serving, keepalive and
//! pipelining, error pages, redirects, rewrites, access control and
//! conditional requests.

mod common;

use std::fs;

use common::{basic_config, roundtrip, start, temp_root, Client};
use server_core::{
    ErrorPage, Hooks, LocationConfig, LocationModifier, ReturnDirective, RewriteFlag,
    RewriteRule,
};

#[test]
fn serves_static_file_with_entity_headers() {
    let root = temp_root("static");
    fs::write(root.join("hello.txt"), "hello from disk").unwrap();
    let server = start(basic_config(root.to_str().unwrap(), vec![]), Hooks::default());

    let mut client = Client::connect(&server.addr);
    client.send("GET /hello.txt HTTP/1.1\r\nHost: localhost\r\n\r\n");
    let response = client.read_response();

    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-type"), Some("text/plain"));
    assert_eq!(response.header("content-length"), Some("15"));
    assert_eq!(response.header("accept-ranges"), Some("bytes"));
    assert!(response.header("last-modified").is_some());
    assert!(response.header("etag").is_some());
    assert!(response.header("date").is_some());
    assert_eq!(response.body_text(), "hello from disk");
}

#[test]
fn keepalive_pipelining_two_requests() {
    let root = temp_root("pipeline");
    fs::write(root.join("a.txt"), "first response").unwrap();
    fs::write(root.join("b.txt"), "second response").unwrap();
    let server = start(basic_config(root.to_str().unwrap(), vec![]), Hooks::default());

    let mut client = Client::connect(&server.addr);
    client.send(
        "GET /a.txt HTTP/1.1\r\nHost: x\r\n\r\nGET /b.txt HTTP/1.1\r\nHost: x\r\n\r\n",
    );

    let first = client.read_response();
    assert_eq!(first.status, 200);
    assert_eq!(first.body_text(), "first response");
    assert_eq!(first.header("connection"), Some("keep-alive"));

    // The second request was parsed out of the residue of the first
    // read; same connection, ordered responses.
    let second = client.read_response();
    assert_eq!(second.status, 200);
    assert_eq!(second.body_text(), "second response");
}

#[test]
fn missing_file_gets_canonical_404() {
    let root = temp_root("missing");
    let server = start(basic_config(root.to_str().unwrap(), vec![]), Hooks::default());

    let mut client = Client::connect(&server.addr);
    client.send("GET /nope.html HTTP/1.1\r\nHost: x\r\n\r\n");
    let response = client.read_response();
    assert_eq!(response.status, 404);
    assert_eq!(response.header("content-type"), Some("text/html"));
    assert!(response.body_text().contains("404 Not Found"));
}

#[test]
fn error_page_equals_form_rewrites_status() {
    let root = temp_root("errpage");
    fs::write(root.join("fallback.html"), "the fallback body").unwrap();

    let mut config = basic_config(root.to_str().unwrap(), vec![]);
    config.http.servers[0].error_pages.push(ErrorPage {
        codes: vec![404],
        // `error_page 404 = /fallback.html;` — status comes from the
        // redirected request.
        response: Some(0),
        uri: "/fallback.html".to_string(),
    });
    let server = start(config, Hooks::default());

    let mut client = Client::connect(&server.addr);
    client.send("GET /missing HTTP/1.1\r\nHost: x\r\n\r\n");
    let response = client.read_response();
    assert_eq!(response.status, 200, "the = form takes the fallback's status");
    assert_eq!(response.body_text(), "the fallback body");
}

#[test]
fn error_page_without_override_keeps_error_status() {
    let root = temp_root("errpage404");
    fs::write(root.join("404.html"), "custom not-found page").unwrap();

    let mut config = basic_config(root.to_str().unwrap(), vec![]);
    config.http.servers[0].error_pages.push(ErrorPage {
        codes: vec![404],
        response: None,
        uri: "/404.html".to_string(),
    });
    let server = start(config, Hooks::default());

    let mut client = Client::connect(&server.addr);
    client.send("GET /missing HTTP/1.1\r\nHost: x\r\n\r\n");
    let response = client.read_response();
    assert_eq!(response.status, 404);
    assert_eq!(response.body_text(), "custom not-found page");
}

#[test]
fn head_request_sends_headers_only() {
    let root = temp_root("head");
    fs::write(root.join("doc.txt"), "some contents here").unwrap();
    let server = start(basic_config(root.to_str().unwrap(), vec![]), Hooks::default());

    let response = roundtrip(
        &server.addr,
        "HEAD /doc.txt HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    );
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Content-Length: 18\r\n"));
    assert!(response.ends_with("\r\n\r\n"), "no body after the header block");
}

#[test]
fn location_auto_redirect_adds_slash() {
    let root = temp_root("autoredirect");
    let server = start(
        basic_config(
            root.to_str().unwrap(),
            vec![LocationConfig {
                pattern: "/app/".to_string(),
                ..Default::default()
            }],
        ),
        Hooks::default(),
    );

    let mut client = Client::connect(&server.addr);
    client.send("GET /app?x=1 HTTP/1.1\r\nHost: x\r\n\r\n");
    let response = client.read_response();
    assert_eq!(response.status, 301);
    assert_eq!(response.header("location"), Some("/app/?x=1"));
}

#[test]
fn directory_redirect_and_index_file() {
    let root = temp_root("dirindex");
    fs::create_dir_all(root.join("docs")).unwrap();
    fs::write(root.join("docs/index.html"), "<p>index body</p>").unwrap();
    let server = start(basic_config(root.to_str().unwrap(), vec![]), Hooks::default());

    let mut client = Client::connect(&server.addr);
    client.send("GET /docs HTTP/1.1\r\nHost: x\r\n\r\n");
    let redirect = client.read_response();
    assert_eq!(redirect.status, 301);
    assert_eq!(redirect.header("location"), Some("/docs/"));

    client.send("GET /docs/ HTTP/1.1\r\nHost: x\r\n\r\n");
    let index = client.read_response();
    assert_eq!(index.status, 200);
    assert_eq!(index.body_text(), "<p>index body</p>");
    assert_eq!(index.header("content-type"), Some("text/html"));
}

#[test]
fn rewrite_last_rematches_location() {
    let root = temp_root("rewrite");
    fs::create_dir_all(root.join("new")).unwrap();
    fs::write(root.join("new/page.txt"), "rewritten target").unwrap();

    let server = start(
        basic_config(
            root.to_str().unwrap(),
            vec![LocationConfig {
                pattern: "/old".to_string(),
                rewrites: vec![RewriteRule {
                    pattern: "^/old/(.*)$".to_string(),
                    replacement: "/new/$1".to_string(),
                    flag: RewriteFlag::Last,
                }],
                ..Default::default()
            }],
        ),
        Hooks::default(),
    );

    let mut client = Client::connect(&server.addr);
    client.send("GET /old/page.txt HTTP/1.1\r\nHost: x\r\n\r\n");
    let response = client.read_response();
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "rewritten target");
}

#[test]
fn rewrite_cycle_exhausts_budget_with_500() {
    let root = temp_root("rewriteloop");
    let server = start(
        basic_config(
            root.to_str().unwrap(),
            vec![LocationConfig {
                pattern: "/loop".to_string(),
                rewrites: vec![RewriteRule {
                    pattern: "^/loop$".to_string(),
                    replacement: "/loop".to_string(),
                    flag: RewriteFlag::Last,
                }],
                ..Default::default()
            }],
        ),
        Hooks::default(),
    );

    let mut client = Client::connect(&server.addr);
    client.send("GET /loop HTTP/1.1\r\nHost: x\r\n\r\n");
    let response = client.read_response();
    assert_eq!(response.status, 500);
}

#[test]
fn return_directive_emits_text_body() {
    let root = temp_root("return");
    let server = start(
        basic_config(
            root.to_str().unwrap(),
            vec![LocationConfig {
                pattern: "/teapot".to_string(),
                ret: Some(ReturnDirective {
                    code: 200,
                    text: Some("short and stout".to_string()),
                }),
                ..Default::default()
            }],
        ),
        Hooks::default(),
    );

    let mut client = Client::connect(&server.addr);
    client.send("GET /teapot HTTP/1.1\r\nHost: x\r\n\r\n");
    let response = client.read_response();
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "short and stout");
}

#[test]
fn deny_all_yields_403_from_post_access() {
    let root = temp_root("access");
    fs::create_dir_all(root.join("private")).unwrap();
    fs::write(root.join("private/secret.txt"), "secret").unwrap();

    let server = start(
        basic_config(
            root.to_str().unwrap(),
            vec![LocationConfig {
                pattern: "/private/".to_string(),
                access: vec![server_core::config::AccessRule {
                    allow: false,
                    source: "all".to_string(),
                }],
                ..Default::default()
            }],
        ),
        Hooks::default(),
    );

    let mut client = Client::connect(&server.addr);
    client.send("GET /private/secret.txt HTTP/1.1\r\nHost: x\r\n\r\n");
    let response = client.read_response();
    assert_eq!(response.status, 403);
}

#[test]
fn if_modified_since_yields_304() {
    let root = temp_root("conditional");
    fs::write(root.join("cached.txt"), "cache me").unwrap();
    let server = start(basic_config(root.to_str().unwrap(), vec![]), Hooks::default());

    let mut client = Client::connect(&server.addr);
    client.send("GET /cached.txt HTTP/1.1\r\nHost: x\r\n\r\n");
    let first = client.read_response();
    assert_eq!(first.status, 200);
    let last_modified = first.header("last-modified").expect("validator").to_string();

    client.send(&format!(
        "GET /cached.txt HTTP/1.1\r\nHost: x\r\nIf-Modified-Since: {last_modified}\r\n\r\n"
    ));
    let second = client.read_response();
    assert_eq!(second.status, 304);
    assert!(second.body.is_empty());
    assert_eq!(
        second.header("connection"),
        Some("keep-alive"),
        "304 keeps the connection"
    );
}

#[test]
fn keepalive_request_budget_closes_connection() {
    let root = temp_root("budget");
    fs::write(root.join("x.txt"), "x").unwrap();
    let mut config = basic_config(root.to_str().unwrap(), vec![]);
    config.http.keepalive_requests = 2;
    let server = start(config, Hooks::default());

    let mut client = Client::connect(&server.addr);
    client.send("GET /x.txt HTTP/1.1\r\nHost: x\r\n\r\n");
    let first = client.read_response();
    assert_eq!(first.header("connection"), Some("keep-alive"));

    client.send("GET /x.txt HTTP/1.1\r\nHost: x\r\n\r\n");
    let second = client.read_response();
    assert_eq!(
        second.header("connection"),
        Some("close"),
        "the final request of the budget announces the close"
    );
}

#[test]
fn host_header_is_required_for_http11() {
    let root = temp_root("nohost");
    let server = start(basic_config(root.to_str().unwrap(), vec![]), Hooks::default());
    let response = roundtrip(&server.addr, "GET / HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 400"), "got: {response}");
}

#[test]
fn virtual_host_selection_by_host_header() {
    let root_a = temp_root("vhost-a");
    let root_b = temp_root("vhost-b");
    fs::write(root_a.join("who.txt"), "server a").unwrap();
    fs::write(root_b.join("who.txt"), "server b").unwrap();

    let mut config = basic_config(root_a.to_str().unwrap(), vec![]);
    config.http.servers[0].server_names = vec!["a.example".to_string()];
    config.http.servers.push(server_core::ServerConfig {
        listen: config.http.servers[0].listen.clone(),
        server_names: vec!["b.example".to_string()],
        root: root_b.to_str().unwrap().to_string(),
        locations: vec![LocationConfig::default()],
        ..Default::default()
    });
    let server = start(config, Hooks::default());

    let mut client = Client::connect(&server.addr);
    client.send("GET /who.txt HTTP/1.1\r\nHost: b.example\r\n\r\n");
    assert_eq!(client.read_response().body_text(), "server b");

    client.send("GET /who.txt HTTP/1.1\r\nHost: a.example\r\n\r\n");
    assert_eq!(client.read_response().body_text(), "server a");

    // Unknown hosts land on the default server for the listener.
    client.send("GET /who.txt HTTP/1.1\r\nHost: other.example\r\n\r\n");
    assert_eq!(client.read_response().body_text(), "server a");
}

#[test]
fn try_files_probes_then_falls_back() {
    let root = temp_root("tryfiles");
    fs::write(root.join("present.txt"), "found by probe").unwrap();
    fs::write(root.join("default.txt"), "the fallback").unwrap();

    let server = start(
        basic_config(
            root.to_str().unwrap(),
            vec![LocationConfig {
                pattern: "/files/".to_string(),
                try_files: Some(server_core::TryFilesConfig {
                    probes: vec!["$uri".to_string(), "/present.txt".to_string()],
                    fallback: "/default.txt".to_string(),
                }),
                ..Default::default()
            }],
        ),
        Hooks::default(),
    );

    let mut client = Client::connect(&server.addr);
    client.send("GET /files/anything HTTP/1.1\r\nHost: x\r\n\r\n");
    let response = client.read_response();
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "found by probe");
}

#[test]
fn exact_location_wins_over_regex() {
    let root = temp_root("locorder");
    fs::write(root.join("page.php"), "raw file").unwrap();

    let server = start(
        basic_config(
            root.to_str().unwrap(),
            vec![
                LocationConfig {
                    pattern: "\\.php$".to_string(),
                    modifier: LocationModifier::Regex,
                    ret: Some(ReturnDirective {
                        code: 200,
                        text: Some("regex matched".to_string()),
                    }),
                    ..Default::default()
                },
                LocationConfig {
                    pattern: "/page.php".to_string(),
                    modifier: LocationModifier::Exact,
                    ret: Some(ReturnDirective {
                        code: 200,
                        text: Some("exact matched".to_string()),
                    }),
                    ..Default::default()
                },
            ],
        ),
        Hooks::default(),
    );

    let mut client = Client::connect(&server.addr);
    client.send("GET /page.php HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(client.read_response().body_text(), "exact matched");

    client.send("GET /other.php HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(client.read_response().body_text(), "regex matched");
}
