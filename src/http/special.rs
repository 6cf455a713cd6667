//! Special responses (canonical error pages and `error_page` redirects),
//! internal redirects, named-location jumps, and the TRY_FILES probe.

use crate::buf::{Buf, Chain};
use crate::config::ErrorPage;
use crate::http::filter::FilterCode;
use crate::http::lifecycle::Fin;
use crate::http::parse::uri_extension;
use crate::http::request::ReqHandler;
use crate::http::status_text;
use crate::prelude::*;

const ERROR_TAIL: &str = "<hr><center>server_core</center>\r\n</body>\r\n</html>\r\n";

impl Worker {
    /// Emit the response for an error (or redirect) status: either an
    /// `error_page` internal redirect or the built-in minimal HTML body.
    pub fn special_response(&mut self, rid: Rid, status: u16) {
        // 499 is bookkeeping only; the peer is gone.
        if status == HTTP_CLIENT_CLOSED_REQUEST {
            self.finalize_request(rid, Fin::Error);
            return;
        }

        // A configured error page redirects the request internally, once.
        if let Some(page) = self.lookup_error_page(rid, status) {
            let taken = {
                let Some(request) = self.req_mut(rid) else {
                    return;
                };
                if request.error_page {
                    false
                } else {
                    request.error_page = true;
                    request.err_status = match page.response {
                        None => Some(status),
                        Some(0) => None,
                        Some(code) => Some(code),
                    };
                    true
                }
            };
            if taken {
                debug!(status, uri = %page.uri, "error_page redirect");
                self.internal_redirect(rid, page.uri.clone(), None);
                return;
            }
        }

        // 494 is internal; it leaves as a plain 400.
        let wire_status = if status == HTTP_HEADERS_TOO_LARGE {
            HTTP_BAD_REQUEST
        } else {
            status
        };

        let body = {
            let Some(request) = self.req_mut(rid) else {
                return;
            };
            if matches!(
                wire_status,
                HTTP_BAD_REQUEST
                    | HTTP_REQUEST_TIMEOUT
                    | HTTP_PAYLOAD_TOO_LARGE
                    | HTTP_URI_TOO_LONG
                    | HTTP_INTERNAL_SERVER_ERROR
                    | HTTP_NOT_IMPLEMENTED
                    | HTTP_VERSION_NOT_SUPPORTED
            ) {
                // The stream state is suspect; do not reuse it.
                request.keepalive = false;
            }

            let body = if request.header_only || !body_for_status(wire_status) {
                Vec::new()
            } else {
                let text = status_text(wire_status);
                format!(
                    "<html>\r\n<head><title>{wire_status} {text}</title></head>\r\n\
                     <body>\r\n<center><h1>{wire_status} {text}</h1></center>\r\n{ERROR_TAIL}"
                )
                .into_bytes()
            };
            let out = &mut request.headers_out;
            out.status = wire_status;
            out.status_line = None;
            out.content_length = Some(body.len() as u64);
            out.content_type = (!body.is_empty()).then(|| "text/html".to_string());
            out.chunked = false;
            request.done = false;
            body
        };

        if self.send_header(rid) == FilterCode::Error {
            self.finalize_request(rid, Fin::Error);
            return;
        }
        let mut chain = Chain::new();
        if body.is_empty() {
            chain.push_back(Buf::last());
        } else {
            let mut buf = Buf::mem(body);
            buf.last_buf = true;
            chain.push_back(buf);
        }
        match self.output_filter(rid, chain) {
            FilterCode::Error => self.finalize_request(rid, Fin::Error),
            _ => self.finalize_request(rid, Fin::Ok),
        }
    }

    fn lookup_error_page(&self, rid: Rid, status: u16) -> Option<ErrorPage> {
        let request = self.req(rid)?;
        if let Some(loc) = &request.loc {
            if let Some(page) = loc
                .conf
                .error_pages
                .iter()
                .find(|page| page.codes.contains(&status))
            {
                return Some(page.clone());
            }
        }
        request
            .srv
            .conf
            .error_pages
            .iter()
            .find(|page| page.codes.contains(&status))
            .cloned()
    }

    /// Restart the request at FIND_CONFIG with a substituted URI. The
    /// change budget guards against redirect cycles.
    pub fn internal_redirect(&mut self, rid: Rid, uri: String, args: Option<String>) {
        let find_config = self.rt.engine.find_config_index;
        let exhausted = {
            let Some(request) = self.req_mut(rid) else {
                return;
            };
            if request.uri_changes_left == 0 {
                true
            } else {
                request.uri_changes_left -= 1;
                debug!(from = %request.uri, to = %uri, "internal redirect");
                request.exten = uri_extension(&uri).to_string();
                request.uri = uri;
                if let Some(args) = args {
                    request.args = args;
                }
                request.internal = true;
                request.uri_changed = false;
                request.loc = None;
                request.phase = find_config;
                request.done = false;
                request.write_handler = ReqHandler::RunPhases;
                false
            }
        };
        if exhausted {
            warn!("internal redirection cycle");
            self.finalize_request(rid, Fin::Status(HTTP_INTERNAL_SERVER_ERROR));
            return;
        }
        self.post_request(rid);
    }

    /// Jump to a named location: binds the location directly, without
    /// re-matching, and resumes at the REWRITE phase.
    pub fn named_location(&mut self, rid: Rid, name: &str) {
        let rewrite_index = self.rt.engine.rewrite_index;
        let target = self
            .req(rid)
            .and_then(|request| request.srv.locations.named(name));
        let Some(location) = target else {
            error!(name, "jump to undefined named location");
            self.finalize_request(rid, Fin::Status(HTTP_INTERNAL_SERVER_ERROR));
            return;
        };
        {
            let Some(request) = self.req_mut(rid) else {
                return;
            };
            debug!(uri = %request.uri, name, "named location jump");
            request.loc = Some(location);
            request.internal = true;
            request.uri_changed = false;
            request.phase = rewrite_index;
            request.done = false;
            request.write_handler = ReqHandler::RunPhases;
        }
        self.post_request(rid);
    }

    /// The TRY_FILES checker body: probe the filesystem for each
    /// template, rewrite the URI on a hit, fall back otherwise. Returns
    /// whether the engine should keep walking.
    pub fn try_files_phase(&mut self, rid: Rid) -> bool {
        let plan = {
            let Some(request) = self.req(rid) else {
                return false;
            };
            let Some(try_files) = request
                .loc
                .as_ref()
                .and_then(|l| l.conf.try_files.clone())
            else {
                // Phase does not apply.
                if let Some(request) = self.req_mut(rid) {
                    request.phase += 1;
                }
                return true;
            };
            let root = request.root().to_string();
            let uri = request.uri.clone();

            let mut hit = None;
            for probe in &try_files.probes {
                let expanded = probe.replace("$uri", &uri);
                let mut path = std::path::PathBuf::from(&root);
                path.push(expanded.trim_start_matches('/'));
                let found = if expanded.ends_with('/') {
                    path.is_dir()
                } else {
                    path.is_file()
                };
                trace!(probe = %expanded, found, "try_files probe");
                if found {
                    hit = Some(expanded);
                    break;
                }
            }
            match hit {
                Some(expanded) => TryPlan::Use(expanded),
                None => TryPlan::Fallback(try_files.fallback.replace("$uri", &uri)),
            }
        };

        match plan {
            TryPlan::Use(uri) => {
                let Some(request) = self.req_mut(rid) else {
                    return false;
                };
                request.exten = uri_extension(&uri).to_string();
                request.uri = uri;
                request.phase += 1;
                true
            }
            TryPlan::Fallback(fallback) => {
                if let Some(name) = fallback.strip_prefix('@') {
                    let name = format!("@{name}");
                    self.named_location(rid, &name);
                    false
                } else if let Some(code) = fallback.strip_prefix('=') {
                    let status = code.trim().parse().unwrap_or(HTTP_NOT_FOUND);
                    self.finalize_request(rid, Fin::Status(status));
                    false
                } else {
                    self.internal_redirect(rid, fallback, None);
                    false
                }
            }
        }
    }
}

enum TryPlan {
    Use(String),
    Fallback(String),
}

fn body_for_status(status: u16) -> bool {
    status >= 300 && !matches!(status, HTTP_NOT_MODIFIED)
}
