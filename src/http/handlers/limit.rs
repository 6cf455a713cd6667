//! PREACCESS-phase connection ceiling: bounds concurrent connections per
//! peer address within one worker.

use crate::http::phase::PhaseCode;
use crate::prelude::*;

pub fn limit_conn_phase(w: &mut Worker, rid: Rid) -> PhaseCode {
    let Some(request) = w.req(rid) else {
        return PhaseCode::Declined;
    };
    let Some(limit) = request.loc.as_ref().and_then(|l| l.conf.limit_conn) else {
        return PhaseCode::Declined;
    };
    let Some(peer) = w.conns.get(rid.conn).and_then(|c| c.peer_ip) else {
        return PhaseCode::Declined;
    };

    let held = w
        .conns
        .slots
        .iter()
        .filter(|conn| conn.open && conn.peer_ip == Some(peer))
        .count();
    if held > limit {
        warn!(%peer, held, limit, "connection limit exceeded");
        return PhaseCode::Status(HTTP_SERVICE_UNAVAILABLE);
    }
    PhaseCode::Declined
}
