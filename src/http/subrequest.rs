//! Subrequests: logical requests sharing the client connection, executed
//! from the posted-request queue, their output interleaved byte-exactly
//! by the postpone filter.

use crate::http::lifecycle::Fin;
use crate::http::parse::uri_extension;
use crate::http::request::{Postponed, ReqHandler, Request};
use crate::http::Method;
use crate::prelude::*;

pub type PostSubrequestFn = fn(&mut Worker, Rid, u16);

impl Worker {
    /// Create a subrequest of `parent` for `uri`. It is queued on the
    /// posted-request list and runs when the current handler returns to
    /// the dispatcher; its bytes appear on the wire exactly where the
    /// parent stood when it called this.
    pub fn subrequest(
        &mut self,
        parent: Rid,
        uri: &str,
        args: Option<&str>,
        callback: Option<PostSubrequestFn>,
    ) -> Option<Rid> {
        let rt = Arc::clone(&self.rt);
        let now_ms = self.clock.now_ms;

        let over_budget = {
            let Some(parent_request) = self.req(parent) else {
                return None;
            };
            let main = parent_request.main;
            let Some(http) = self.conns.get(parent.conn).and_then(|c| c.http.as_ref()) else {
                return None;
            };
            http.request(main).map(|m| m.subrequests_left == 0).unwrap_or(true)
        };
        if over_budget {
            warn!(uri, "subrequest budget exhausted");
            self.finalize_request(parent, Fin::Status(HTTP_INTERNAL_SERVER_ERROR));
            return None;
        }

        let (srv, main, version, host) = {
            let Some(parent_request) = self.req(parent) else {
                return None;
            };
            (
                Arc::clone(&parent_request.srv),
                parent_request.main,
                parent_request.version,
                parent_request.headers_in.host.clone(),
            )
        };

        let underscores = rt.http.underscores_in_headers;
        let sub = {
            let Some(http) = self.conns.get_mut(parent.conn).and_then(|c| c.http.as_mut())
            else {
                return None;
            };
            let sub = http.alloc_request(|slot| {
                let mut request =
                    Request::new(slot, parent.conn, srv, &rt.http, now_ms, underscores);
                request.main = main;
                request.parent = Some(parent.req);
                request.method = Method::Get;
                request.version = version;
                request.internal = true;
                request.headers_in.host = host;
                request.uri = uri.to_string();
                request.exten = uri_extension(uri).to_string();
                request.args = args.unwrap_or("").to_string();
                request.request_line = format!("GET {uri} (subrequest)");
                request.post_subrequest = callback;
                request.read_handler = ReqHandler::Empty;
                request.write_handler = ReqHandler::RunPhases;
                request
            });
            if let Some(main_request) = http.request_mut(main) {
                main_request.count += 1;
                main_request.subrequests_left -= 1;
            }
            if let Some(parent_request) = http.request_mut(parent.req) {
                parent_request.postponed.push_back(Postponed::Sub(sub));
            }
            sub
        };

        let sub_rid = Rid::new(parent.conn, sub);
        debug!(uri, parent = parent.req, sub, "subrequest created");
        self.post_request(sub_rid);
        Some(sub_rid)
    }
}
