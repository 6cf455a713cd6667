//! The variable engine seam: names resolve to ids at configuration time,
//! values are produced on demand and cached lazily on the request. The
//! LOG phase and any handler reach request state only through this
//! interface.

use std::collections::HashMap;

use crate::prelude::*;

pub type VariableId = usize;

type VariableFn = fn(&Worker, Rid) -> Option<String>;

/// Built-in variables, frozen before the reactor starts.
pub struct VariableRegistry {
    names: HashMap<&'static str, VariableId>,
    getters: Vec<VariableFn>,
}

impl VariableRegistry {
    pub fn builtin() -> VariableRegistry {
        let entries: &[(&'static str, VariableFn)] = &[
            ("uri", var_uri),
            ("args", var_args),
            ("request", var_request),
            ("status", var_status),
            ("remote_addr", var_remote_addr),
            ("host", var_host),
            ("http_user_agent", var_user_agent),
            ("body_bytes_sent", var_bytes_sent),
            ("request_time", var_request_time),
            ("server_protocol", var_server_protocol),
        ];
        let mut names = HashMap::new();
        let mut getters = Vec::with_capacity(entries.len());
        for (id, (name, getter)) in entries.iter().enumerate() {
            names.insert(*name, id);
            getters.push(*getter);
        }
        VariableRegistry { names, getters }
    }

    pub fn lookup(&self, name: &str) -> Option<VariableId> {
        self.names.get(name).copied()
    }

    /// Evaluate through the request's lazy cache.
    pub fn get(&self, w: &mut Worker, rid: Rid, id: VariableId) -> Option<String> {
        let cached = w
            .req(rid)
            .and_then(|r| r.variables.get(id).cloned().flatten());
        if cached.is_some() {
            return cached;
        }
        let value = self.getters.get(id).and_then(|getter| getter(w, rid))?;
        if let Some(request) = w.req_mut(rid) {
            if request.variables.len() <= id {
                request.variables.resize(id + 1, None);
            }
            request.variables[id] = Some(value.clone());
        }
        Some(value)
    }
}

fn var_uri(w: &Worker, rid: Rid) -> Option<String> {
    w.req(rid).map(|r| r.uri.clone())
}

fn var_args(w: &Worker, rid: Rid) -> Option<String> {
    w.req(rid).map(|r| r.args.clone())
}

fn var_request(w: &Worker, rid: Rid) -> Option<String> {
    w.req(rid).map(|r| r.request_line.clone())
}

fn var_status(w: &Worker, rid: Rid) -> Option<String> {
    w.req(rid).map(|r| {
        let status = if r.headers_out.status == 0 {
            HTTP_OK
        } else {
            r.headers_out.status
        };
        status.to_string()
    })
}

fn var_remote_addr(w: &Worker, rid: Rid) -> Option<String> {
    w.conns.get(rid.conn).map(|c| c.peer.clone())
}

fn var_host(w: &Worker, rid: Rid) -> Option<String> {
    w.req(rid).and_then(|r| r.headers_in.host.clone())
}

fn var_user_agent(w: &Worker, rid: Rid) -> Option<String> {
    w.req(rid).and_then(|r| r.headers_in.user_agent.clone())
}

fn var_bytes_sent(w: &Worker, rid: Rid) -> Option<String> {
    w.conns.get(rid.conn).map(|c| c.sent.to_string())
}

fn var_request_time(w: &Worker, rid: Rid) -> Option<String> {
    w.req(rid)
        .map(|r| w.clock.now_ms.saturating_sub(r.start_ms).to_string())
}

fn var_server_protocol(w: &Worker, rid: Rid) -> Option<String> {
    w.req(rid).map(|r| r.version.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_resolve_to_stable_ids() {
        let registry = VariableRegistry::builtin();
        let uri = registry.lookup("uri").expect("uri is built in");
        assert_eq!(registry.lookup("uri"), Some(uri));
        assert!(registry.lookup("no_such_variable").is_none());
    }
}
