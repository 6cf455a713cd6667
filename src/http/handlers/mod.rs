pub mod access;
pub mod limit;
pub mod rewrite;
pub mod static_files;

use crate::http::phase::PhaseCode;
use crate::prelude::*;

/// The access-log line format, as variable names resolved through the
/// variable engine at log time.
const ACCESS_FORMAT: &[&str] = &[
    "remote_addr",
    "request",
    "status",
    "body_bytes_sent",
    "request_time",
    "http_user_agent",
];

/// LOG-phase handler: one access event per finished request, each field
/// obtained through the variable interface.
pub fn access_log_phase(w: &mut Worker, rid: Rid) -> PhaseCode {
    let rt = Arc::clone(&w.rt);
    let mut fields = Vec::with_capacity(ACCESS_FORMAT.len());
    for name in ACCESS_FORMAT {
        let value = rt
            .variables
            .lookup(name)
            .and_then(|id| rt.variables.get(w, rid, id))
            .unwrap_or_else(|| "-".to_string());
        fields.push(value);
    }
    info!(
        target: "access",
        peer = %fields[0],
        request = %fields[1],
        status = %fields[2],
        sent = %fields[3],
        elapsed_ms = %fields[4],
        agent = %fields[5],
    );
    PhaseCode::Ok
}
