//! ACCESS-phase allow/deny rules: ordered CIDR matching against the peer
//! address, first match wins. A deny verdict travels through the
//! access-code discipline and is delivered by POST_ACCESS.

use std::net::IpAddr;

use crate::config::AccessRule;
use crate::error::{Result, ServerError};
use crate::http::phase::PhaseCode;
use crate::prelude::*;

pub struct CompiledAccessRule {
    pub allow: bool,
    matcher: AddrMatcher,
}

enum AddrMatcher {
    All,
    Exact(IpAddr),
    Cidr { net: IpAddr, prefix: u8 },
}

impl CompiledAccessRule {
    pub fn compile(rule: &AccessRule) -> Result<CompiledAccessRule> {
        let source = rule.source.trim();
        let matcher = if source.eq_ignore_ascii_case("all") {
            AddrMatcher::All
        } else if let Some((addr, prefix)) = source.split_once('/') {
            let net: IpAddr = addr
                .parse()
                .map_err(|_| ServerError::Config(format!("bad access source: {source}")))?;
            let prefix: u8 = prefix
                .parse()
                .map_err(|_| ServerError::Config(format!("bad access prefix: {source}")))?;
            let max = match net {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            if prefix > max {
                return Err(ServerError::Config(format!("bad access prefix: {source}")));
            }
            AddrMatcher::Cidr { net, prefix }
        } else {
            AddrMatcher::Exact(
                source
                    .parse()
                    .map_err(|_| ServerError::Config(format!("bad access source: {source}")))?,
            )
        };
        Ok(CompiledAccessRule {
            allow: rule.allow,
            matcher,
        })
    }

    pub fn matches(&self, peer: IpAddr) -> bool {
        match &self.matcher {
            AddrMatcher::All => true,
            AddrMatcher::Exact(addr) => *addr == peer,
            AddrMatcher::Cidr { net, prefix } => match (net, peer) {
                (IpAddr::V4(net), IpAddr::V4(peer)) => {
                    let mask = if *prefix == 0 {
                        0
                    } else {
                        u32::MAX << (32 - prefix)
                    };
                    (u32::from(*net) & mask) == (u32::from(peer) & mask)
                }
                (IpAddr::V6(net), IpAddr::V6(peer)) => {
                    let mask = if *prefix == 0 {
                        0
                    } else {
                        u128::MAX << (128 - prefix)
                    };
                    (u128::from(*net) & mask) == (u128::from(peer) & mask)
                }
                _ => false,
            },
        }
    }
}

pub fn access_phase(w: &mut Worker, rid: Rid) -> PhaseCode {
    let Some(request) = w.req(rid) else {
        return PhaseCode::Declined;
    };
    let Some(loc) = request.loc.clone() else {
        return PhaseCode::Declined;
    };
    if loc.access.is_empty() {
        return PhaseCode::Declined;
    }
    // Unix-domain peers carry no address; rules do not apply.
    let Some(peer) = w.conns.get(rid.conn).and_then(|c| c.peer_ip) else {
        return PhaseCode::Declined;
    };
    for rule in &loc.access {
        if rule.matches(peer) {
            return if rule.allow {
                PhaseCode::Ok
            } else {
                PhaseCode::Status(HTTP_FORBIDDEN)
            };
        }
    }
    PhaseCode::Declined
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiled(allow: bool, source: &str) -> CompiledAccessRule {
        CompiledAccessRule::compile(&AccessRule {
            allow,
            source: source.to_string(),
        })
        .expect("rule compiles")
    }

    #[test]
    fn cidr_matching_v4() {
        let rule = compiled(true, "10.1.0.0/16");
        assert!(rule.matches("10.1.200.3".parse().unwrap()));
        assert!(!rule.matches("10.2.0.1".parse().unwrap()));
    }

    #[test]
    fn exact_and_all() {
        assert!(compiled(false, "127.0.0.1").matches("127.0.0.1".parse().unwrap()));
        assert!(compiled(false, "all").matches("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn zero_prefix_matches_everything() {
        let rule = compiled(true, "0.0.0.0/0");
        assert!(rule.matches("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn rejects_garbage() {
        assert!(CompiledAccessRule::compile(&AccessRule {
            allow: true,
            source: "10.0.0.0/99".to_string(),
        })
        .is_err());
        assert!(CompiledAccessRule::compile(&AccessRule {
            allow: true,
            source: "not-an-ip".to_string(),
        })
        .is_err());
    }
}
