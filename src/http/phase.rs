//! The phase engine: a flattened array of handler records walked by a
//! per-request cursor. Each record pairs a module handler with one of the
//! fixed checkers that interpret its return code and move the cursor.

use crate::http::lifecycle::Fin;
use crate::http::location::LocationMatch;
use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    PostRead,
    ServerRewrite,
    FindConfig,
    Rewrite,
    PostRewrite,
    PreAccess,
    Access,
    PostAccess,
    TryFiles,
    Content,
    Log,
}

/// What a phase handler reports back to its checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseCode {
    Ok,
    /// "Does not apply here" — the checker tries the next handler.
    Declined,
    /// Yield; re-entered on the next wake-up.
    Again,
    /// Yield; the handler has taken over request completion.
    Done,
    /// Finalize with this status (an error or a special response).
    Status(u16),
}

pub type PhaseHandlerFn = fn(&mut Worker, Rid) -> PhaseCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checker {
    Generic,
    Rewrite,
    FindConfig,
    PostRewrite,
    Access,
    PostAccess,
    TryFiles,
    Content,
}

#[derive(Clone, Copy)]
pub struct PhaseRec {
    pub checker: Checker,
    pub handler: Option<PhaseHandlerFn>,
    pub phase: Phase,
    /// Jump target: first record of the next phase (checker-specific use).
    pub next: usize,
}

pub struct PhaseEngine {
    pub handlers: Vec<PhaseRec>,
    pub find_config_index: usize,
    /// First REWRITE record; named-location jumps land here.
    pub rewrite_index: usize,
    /// Handlers run at finalization, outside the engine.
    pub log_handlers: Vec<PhaseHandlerFn>,
}

/// Collects per-phase registrations, then flattens them in phase order.
/// Within one phase the most recently installed handler runs first,
/// matching the filter-chain discipline.
#[derive(Default)]
pub struct PhaseEngineBuilder {
    post_read: Vec<PhaseHandlerFn>,
    server_rewrite: Vec<PhaseHandlerFn>,
    rewrite: Vec<PhaseHandlerFn>,
    preaccess: Vec<PhaseHandlerFn>,
    access: Vec<PhaseHandlerFn>,
    content: Vec<PhaseHandlerFn>,
    log: Vec<PhaseHandlerFn>,
}

impl PhaseEngineBuilder {
    pub fn new() -> PhaseEngineBuilder {
        PhaseEngineBuilder::default()
    }

    pub fn install(&mut self, phase: Phase, handler: PhaseHandlerFn) {
        let list = match phase {
            Phase::PostRead => &mut self.post_read,
            Phase::ServerRewrite => &mut self.server_rewrite,
            Phase::Rewrite => &mut self.rewrite,
            Phase::PreAccess => &mut self.preaccess,
            Phase::Access => &mut self.access,
            Phase::Content => &mut self.content,
            Phase::Log => &mut self.log,
            other => panic!("phase {other:?} is fixed and not extensible"),
        };
        list.push(handler);
    }

    pub fn build(mut self) -> PhaseEngine {
        let mut handlers: Vec<PhaseRec> = Vec::new();
        let mut phase_starts: Vec<(Phase, usize)> = Vec::new();

        let mut push_module_phase =
            |handlers: &mut Vec<PhaseRec>,
             phase_starts: &mut Vec<(Phase, usize)>,
             phase: Phase,
             checker: Checker,
             list: &mut Vec<PhaseHandlerFn>| {
                phase_starts.push((phase, handlers.len()));
                // Last registered runs first.
                for handler in list.drain(..).rev() {
                    handlers.push(PhaseRec {
                        checker,
                        handler: Some(handler),
                        phase,
                        next: 0,
                    });
                }
            };
        let push_fixed_phase =
            |handlers: &mut Vec<PhaseRec>,
             phase_starts: &mut Vec<(Phase, usize)>,
             phase: Phase,
             checker: Checker| {
                phase_starts.push((phase, handlers.len()));
                handlers.push(PhaseRec {
                    checker,
                    handler: None,
                    phase,
                    next: 0,
                });
            };

        push_module_phase(
            &mut handlers,
            &mut phase_starts,
            Phase::PostRead,
            Checker::Generic,
            &mut self.post_read,
        );
        push_module_phase(
            &mut handlers,
            &mut phase_starts,
            Phase::ServerRewrite,
            Checker::Rewrite,
            &mut self.server_rewrite,
        );
        push_fixed_phase(
            &mut handlers,
            &mut phase_starts,
            Phase::FindConfig,
            Checker::FindConfig,
        );
        push_module_phase(
            &mut handlers,
            &mut phase_starts,
            Phase::Rewrite,
            Checker::Rewrite,
            &mut self.rewrite,
        );
        push_fixed_phase(
            &mut handlers,
            &mut phase_starts,
            Phase::PostRewrite,
            Checker::PostRewrite,
        );
        push_module_phase(
            &mut handlers,
            &mut phase_starts,
            Phase::PreAccess,
            Checker::Generic,
            &mut self.preaccess,
        );
        push_module_phase(
            &mut handlers,
            &mut phase_starts,
            Phase::Access,
            Checker::Access,
            &mut self.access,
        );
        push_fixed_phase(
            &mut handlers,
            &mut phase_starts,
            Phase::PostAccess,
            Checker::PostAccess,
        );
        push_fixed_phase(
            &mut handlers,
            &mut phase_starts,
            Phase::TryFiles,
            Checker::TryFiles,
        );
        push_module_phase(
            &mut handlers,
            &mut phase_starts,
            Phase::Content,
            Checker::Content,
            &mut self.content,
        );

        // Wire each record's jump target to the start of the next phase.
        let end = handlers.len();
        for (i, rec) in handlers.iter_mut().enumerate() {
            let next = phase_starts
                .iter()
                .find(|(phase, start)| *phase > rec.phase && *start > i)
                .map(|(_, start)| *start)
                .unwrap_or(end);
            rec.next = next;
        }

        let start_of = |phase: Phase| -> usize {
            phase_starts
                .iter()
                .find(|(p, _)| *p == phase)
                .map(|(_, start)| *start)
                .expect("fixed phase present")
        };

        PhaseEngine {
            find_config_index: start_of(Phase::FindConfig),
            rewrite_index: start_of(Phase::Rewrite),
            handlers,
            log_handlers: self.log,
        }
    }
}

impl Worker {
    /// Walk phases from the request's cursor until a checker yields back
    /// to the reactor or the request is finalized.
    pub fn run_phases(&mut self, rid: Rid) {
        loop {
            let Some(request) = self.req(rid) else {
                return;
            };
            let cursor = request.phase;
            if cursor >= self.rt.engine.handlers.len() {
                return;
            }
            let rec = self.rt.engine.handlers[cursor];
            let proceed = match rec.checker {
                Checker::Generic => self.checker_generic(rid, rec),
                Checker::Rewrite => self.checker_rewrite(rid, rec),
                Checker::FindConfig => self.checker_find_config(rid, rec),
                Checker::PostRewrite => self.checker_post_rewrite(rid, rec),
                Checker::Access => self.checker_access(rid, rec),
                Checker::PostAccess => self.checker_post_access(rid, rec),
                Checker::TryFiles => self.checker_try_files(rid, rec),
                Checker::Content => self.checker_content(rid, rec),
            };
            if !proceed {
                return;
            }
        }
    }

    fn checker_generic(&mut self, rid: Rid, rec: PhaseRec) -> bool {
        let Some(handler) = rec.handler else {
            self.req_set_phase(rid, |phase| phase + 1);
            return true;
        };
        match handler(self, rid) {
            PhaseCode::Ok => {
                // This phase is satisfied; skip its remaining handlers.
                self.req_set_phase(rid, |_| rec.next);
                true
            }
            PhaseCode::Declined => {
                self.req_set_phase(rid, |phase| phase + 1);
                true
            }
            PhaseCode::Again | PhaseCode::Done => false,
            PhaseCode::Status(status) => {
                self.finalize_request(rid, Fin::Status(status));
                false
            }
        }
    }

    fn checker_rewrite(&mut self, rid: Rid, rec: PhaseRec) -> bool {
        let Some(handler) = rec.handler else {
            self.req_set_phase(rid, |phase| phase + 1);
            return true;
        };
        match handler(self, rid) {
            PhaseCode::Declined | PhaseCode::Ok => {
                self.req_set_phase(rid, |phase| phase + 1);
                true
            }
            PhaseCode::Done | PhaseCode::Again => false,
            PhaseCode::Status(status) => {
                self.finalize_request(rid, Fin::Status(status));
                false
            }
        }
    }

    fn checker_find_config(&mut self, rid: Rid, rec: PhaseRec) -> bool {
        let Some(request) = self.req(rid) else {
            return false;
        };
        let srv = Arc::clone(&request.srv);
        let uri = request.uri.clone();

        let (outcome, location) = srv.locations.find(&uri);
        match outcome {
            LocationMatch::AutoRedirect => {
                let Some(request) = self.req_mut(rid) else {
                    return false;
                };
                let mut target = format!("{uri}/");
                if !request.args.is_empty() {
                    target.push('?');
                    target.push_str(&request.args);
                }
                request.headers_out.location = Some(target);
                self.finalize_request(rid, Fin::Status(HTTP_MOVED_PERMANENTLY));
                false
            }
            LocationMatch::Found | LocationMatch::NotFound => {
                let Some(request) = self.req_mut(rid) else {
                    return false;
                };
                request.uri_changed = false;
                request.loc = location;
                if let Some(location) = &request.loc {
                    trace!(uri = %request.uri, location = %location.conf.pattern, "using configuration");
                }
                request.phase = rec.next;
                true
            }
        }
    }

    fn checker_post_rewrite(&mut self, rid: Rid, _rec: PhaseRec) -> bool {
        let find_config = self.rt.engine.find_config_index;
        let exhausted = {
            let Some(request) = self.req_mut(rid) else {
                return false;
            };
            if !request.uri_changed {
                request.phase += 1;
                return true;
            }
            request.uri_changed = false;
            if request.uri_changes_left == 0 {
                warn!(uri = %request.uri, "rewrite or internal redirection cycle");
                true
            } else {
                request.uri_changes_left -= 1;
                request.phase = find_config;
                false
            }
        };
        if exhausted {
            self.finalize_request(rid, Fin::Status(HTTP_INTERNAL_SERVER_ERROR));
            return false;
        }
        true
    }

    fn checker_access(&mut self, rid: Rid, rec: PhaseRec) -> bool {
        let Some(request) = self.req(rid) else {
            return false;
        };
        // Access control applies to client-originated requests only.
        if request.parent.is_some() {
            self.req_set_phase(rid, |_| rec.next);
            return true;
        }
        let Some(handler) = rec.handler else {
            self.req_set_phase(rid, |phase| phase + 1);
            return true;
        };
        match handler(self, rid) {
            PhaseCode::Ok | PhaseCode::Declined => {
                self.req_set_phase(rid, |phase| phase + 1);
                true
            }
            PhaseCode::Again | PhaseCode::Done => false,
            PhaseCode::Status(status)
                if status == HTTP_FORBIDDEN || status == 401 =>
            {
                // The verdict is delivered by POST_ACCESS so later access
                // handlers still run ("satisfy" discipline).
                if let Some(request) = self.req_mut(rid) {
                    request.access_code = Some(status);
                    request.phase += 1;
                }
                true
            }
            PhaseCode::Status(status) => {
                self.finalize_request(rid, Fin::Status(status));
                false
            }
        }
    }

    fn checker_post_access(&mut self, rid: Rid, _rec: PhaseRec) -> bool {
        let code = {
            let Some(request) = self.req_mut(rid) else {
                return false;
            };
            match request.access_code.take() {
                None => {
                    request.phase += 1;
                    return true;
                }
                Some(code) => code,
            }
        };
        if code == HTTP_FORBIDDEN {
            let peer = self.conn_peer(rid.conn);
            let uri = self.req(rid).map(|r| r.uri.clone()).unwrap_or_default();
            info!(%peer, %uri, "access forbidden by rule");
        }
        self.finalize_request(rid, Fin::Status(code));
        false
    }

    fn checker_try_files(&mut self, rid: Rid, _rec: PhaseRec) -> bool {
        self.try_files_phase(rid)
    }

    fn checker_content(&mut self, rid: Rid, rec: PhaseRec) -> bool {
        let Some(request) = self.req(rid) else {
            return false;
        };
        // A location-bound content producer short-circuits the generic
        // handler list; its return value finalizes the request.
        if let Some(handler) = request.loc.as_ref().and_then(|l| l.content_handler) {
            if let Some(request) = self.req_mut(rid) {
                request.write_handler = crate::http::request::ReqHandler::Empty;
            }
            let code = handler(self, rid);
            match code {
                PhaseCode::Declined => {}
                PhaseCode::Ok => {
                    self.finalize_request(rid, Fin::Ok);
                    return false;
                }
                PhaseCode::Again => {
                    self.finalize_request(rid, Fin::Again);
                    return false;
                }
                PhaseCode::Done => return false,
                PhaseCode::Status(status) => {
                    self.finalize_request(rid, Fin::Status(status));
                    return false;
                }
            }
        }

        let Some(handler) = rec.handler else {
            self.req_set_phase(rid, |phase| phase + 1);
            return true;
        };
        match handler(self, rid) {
            PhaseCode::Declined => {
                let engine_len = self.rt.engine.handlers.len();
                let exhausted = {
                    let Some(request) = self.req_mut(rid) else {
                        return false;
                    };
                    request.phase += 1;
                    if request.phase >= engine_len {
                        // No content producer claimed the request.
                        Some(if request.uri.ends_with('/') {
                            HTTP_FORBIDDEN
                        } else {
                            HTTP_NOT_FOUND
                        })
                    } else {
                        None
                    }
                };
                if let Some(status) = exhausted {
                    self.finalize_request(rid, Fin::Status(status));
                    return false;
                }
                true
            }
            PhaseCode::Ok => {
                self.finalize_request(rid, Fin::Ok);
                false
            }
            PhaseCode::Again => {
                self.finalize_request(rid, Fin::Again);
                false
            }
            PhaseCode::Done => false,
            PhaseCode::Status(status) => {
                self.finalize_request(rid, Fin::Status(status));
                false
            }
        }
    }

    fn req_set_phase(&mut self, rid: Rid, update: impl FnOnce(usize) -> usize) {
        if let Some(request) = self.req_mut(rid) {
            request.phase = update(request.phase);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop(_: &mut Worker, _: Rid) -> PhaseCode {
        PhaseCode::Declined
    }

    fn nop2(_: &mut Worker, _: Rid) -> PhaseCode {
        PhaseCode::Ok
    }

    #[test]
    fn phases_flatten_in_order() {
        let mut builder = PhaseEngineBuilder::new();
        builder.install(Phase::Access, nop);
        builder.install(Phase::ServerRewrite, nop);
        builder.install(Phase::Content, nop);
        let engine = builder.build();

        let order: Vec<Phase> = engine.handlers.iter().map(|rec| rec.phase).collect();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted, "records appear in phase order");
        assert_eq!(
            engine.handlers[engine.find_config_index].checker,
            Checker::FindConfig
        );
        assert!(engine.rewrite_index > engine.find_config_index);
    }

    #[test]
    fn later_registration_runs_first_within_a_phase() {
        let mut builder = PhaseEngineBuilder::new();
        builder.install(Phase::Content, nop);
        builder.install(Phase::Content, nop2);
        let engine = builder.build();

        let content: Vec<PhaseHandlerFn> = engine
            .handlers
            .iter()
            .filter(|rec| rec.phase == Phase::Content)
            .filter_map(|rec| rec.handler)
            .collect();
        assert_eq!(content.len(), 2);
        assert_eq!(content[0] as usize, nop2 as PhaseHandlerFn as usize);
        assert_eq!(content[1] as usize, nop as PhaseHandlerFn as usize);
    }

    #[test]
    fn next_points_past_the_phase() {
        let mut builder = PhaseEngineBuilder::new();
        builder.install(Phase::PreAccess, nop);
        builder.install(Phase::PreAccess, nop);
        let engine = builder.build();

        let first_preaccess = engine
            .handlers
            .iter()
            .position(|rec| rec.phase == Phase::PreAccess)
            .unwrap();
        let rec = engine.handlers[first_preaccess];
        assert!(engine.handlers[rec.next].phase > Phase::PreAccess);
    }
}
