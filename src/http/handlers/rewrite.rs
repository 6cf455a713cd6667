//! Rewrite-rule execution for the SERVER_REWRITE and REWRITE phases,
//! plus the `return` directive.

use regex::Regex;

use crate::buf::{Buf, Chain};
use crate::config::{ReturnDirective, RewriteFlag, RewriteRule};
use crate::error::Result;
use crate::http::filter::FilterCode;
use crate::http::parse::uri_extension;
use crate::http::phase::PhaseCode;
use crate::prelude::*;

pub struct CompiledRewrite {
    pub regex: Regex,
    pub replacement: String,
    pub flag: RewriteFlag,
}

impl CompiledRewrite {
    pub fn compile(rule: &RewriteRule) -> Result<CompiledRewrite> {
        Ok(CompiledRewrite {
            regex: Regex::new(&rule.pattern)?,
            replacement: rule.replacement.clone(),
            flag: rule.flag,
        })
    }

    /// Substitute when the pattern matches; `$1`-style groups expand from
    /// the capture set.
    pub fn apply(&self, uri: &str) -> Option<String> {
        if !self.regex.is_match(uri) {
            return None;
        }
        Some(
            self.regex
                .replace(uri, self.replacement.as_str())
                .into_owned(),
        )
    }
}

pub fn server_rewrite_phase(w: &mut Worker, rid: Rid) -> PhaseCode {
    let Some(request) = w.req(rid) else {
        return PhaseCode::Declined;
    };
    let srv = Arc::clone(&request.srv);
    run_rules(w, rid, &srv.rewrites, srv.conf.ret.as_ref())
}

pub fn location_rewrite_phase(w: &mut Worker, rid: Rid) -> PhaseCode {
    let Some(request) = w.req(rid) else {
        return PhaseCode::Declined;
    };
    let Some(loc) = request.loc.clone() else {
        return PhaseCode::Declined;
    };
    run_rules(w, rid, &loc.rewrites, loc.conf.ret.as_ref())
}

fn run_rules(
    w: &mut Worker,
    rid: Rid,
    rules: &[CompiledRewrite],
    ret: Option<&ReturnDirective>,
) -> PhaseCode {
    for rule in rules {
        let rewritten = {
            let Some(request) = w.req(rid) else {
                return PhaseCode::Declined;
            };
            rule.apply(&request.uri)
        };
        let Some(target) = rewritten else {
            continue;
        };

        match rule.flag {
            RewriteFlag::Redirect | RewriteFlag::Permanent => {
                let Some(request) = w.req_mut(rid) else {
                    return PhaseCode::Declined;
                };
                debug!(from = %request.uri, to = %target, "rewrite redirect");
                request.headers_out.location = Some(target);
                return PhaseCode::Status(if rule.flag == RewriteFlag::Permanent {
                    HTTP_MOVED_PERMANENTLY
                } else {
                    HTTP_FOUND
                });
            }
            flag => {
                let Some(request) = w.req_mut(rid) else {
                    return PhaseCode::Declined;
                };
                // A '?' in the replacement replaces the query string.
                let (uri, args) = match target.split_once('?') {
                    Some((uri, args)) => (uri.to_string(), Some(args.to_string())),
                    None => (target, None),
                };
                debug!(from = %request.uri, to = %uri, "rewrite");
                request.uri = uri;
                request.exten = uri_extension(&request.uri).to_string();
                if let Some(args) = args {
                    request.args = args;
                }
                match flag {
                    RewriteFlag::None => {
                        request.uri_changed = true;
                    }
                    RewriteFlag::Last => {
                        request.uri_changed = true;
                        return PhaseCode::Ok;
                    }
                    RewriteFlag::Break => {
                        // Stay in this location; no re-match.
                        request.uri_changed = false;
                        return PhaseCode::Ok;
                    }
                    _ => unreachable!("redirect flags handled above"),
                }
            }
        }
    }

    if let Some(directive) = ret {
        return apply_return(w, rid, directive);
    }
    PhaseCode::Declined
}

/// `return code [text|URL]`. Redirect codes treat the text as the
/// Location; 2xx codes emit the text as the whole body.
fn apply_return(w: &mut Worker, rid: Rid, directive: &ReturnDirective) -> PhaseCode {
    let code = directive.code;
    match &directive.text {
        Some(text) if (300..400).contains(&code) => {
            if let Some(request) = w.req_mut(rid) {
                request.headers_out.location = Some(text.clone());
            }
            PhaseCode::Status(code)
        }
        Some(text) if (200..300).contains(&code) => {
            let body = text.clone().into_bytes();
            {
                let Some(request) = w.req_mut(rid) else {
                    return PhaseCode::Declined;
                };
                request.headers_out.status = code;
                request.headers_out.content_type = Some("text/plain".to_string());
                request.headers_out.content_length = Some(body.len() as u64);
            }
            if w.send_header(rid) == FilterCode::Error {
                return PhaseCode::Status(HTTP_INTERNAL_SERVER_ERROR);
            }
            let mut chain = Chain::new();
            let mut buf = Buf::mem(body);
            buf.last_buf = true;
            chain.push_back(buf);
            // The response is complete here; finalize and yield so the
            // remaining phases never run.
            let fin = match w.output_filter(rid, chain) {
                FilterCode::Ok => crate::http::lifecycle::Fin::Ok,
                FilterCode::Again => crate::http::lifecycle::Fin::Again,
                FilterCode::Error => {
                    return PhaseCode::Status(HTTP_INTERNAL_SERVER_ERROR);
                }
            };
            w.finalize_request(rid, fin);
            PhaseCode::Done
        }
        _ => PhaseCode::Status(code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, replacement: &str, flag: RewriteFlag) -> CompiledRewrite {
        CompiledRewrite::compile(&RewriteRule {
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
            flag,
        })
        .expect("rule compiles")
    }

    #[test]
    fn capture_groups_expand() {
        let rule = rule("^/old/(.*)$", "/new/$1", RewriteFlag::Last);
        assert_eq!(rule.apply("/old/a/b").as_deref(), Some("/new/a/b"));
        assert_eq!(rule.apply("/other"), None);
    }

    #[test]
    fn replacement_may_introduce_args() {
        let rule = rule("^/go/([a-z]+)$", "/jump?to=$1", RewriteFlag::Last);
        assert_eq!(rule.apply("/go/home").as_deref(), Some("/jump?to=home"));
    }
}
