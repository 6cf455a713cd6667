//! Virtual-host selection: map a Host value to a server scope.
//!
//! Per listening endpoint, four indices cover the configured server
//! names — exact map, leading-wildcard map (`*.example.com`), trailing
//! wildcard map (`www.example.*`), and an ordered regex list — consulted
//! in exactly that order; first hit wins.

use std::collections::HashMap;

use regex::Regex;

use crate::error::{Result, ServerError};

#[derive(Debug, Default)]
pub struct VirtualHosts {
    exact: HashMap<String, usize>,
    /// Keyed by the suffix after `*`, including the leading dot.
    wildcard_head: HashMap<String, usize>,
    /// Keyed by the prefix before `*`, including the trailing dot.
    wildcard_tail: HashMap<String, usize>,
    regex: Vec<(Regex, usize)>,
    default_server: usize,
}

impl VirtualHosts {
    pub fn build(names: &[(String, usize)], default_server: usize) -> Result<VirtualHosts> {
        let mut hosts = VirtualHosts {
            default_server,
            ..VirtualHosts::default()
        };
        for (name, server) in names {
            let name = name.to_ascii_lowercase();
            if let Some(pattern) = name.strip_prefix('~') {
                hosts.regex.push((Regex::new(pattern)?, *server));
            } else if let Some(suffix) = name.strip_prefix('*') {
                if !suffix.starts_with('.') {
                    return Err(ServerError::Config(format!(
                        "bad wildcard server name: {name}"
                    )));
                }
                hosts.wildcard_head.entry(suffix.to_string()).or_insert(*server);
            } else if let Some(prefix) = name.strip_suffix('*') {
                if !prefix.ends_with('.') {
                    return Err(ServerError::Config(format!(
                        "bad wildcard server name: {name}"
                    )));
                }
                hosts.wildcard_tail.entry(prefix.to_string()).or_insert(*server);
            } else {
                hosts.exact.entry(name).or_insert(*server);
            }
        }
        Ok(hosts)
    }

    /// Server index for a normalized (lowercased, portless) host.
    pub fn select(&self, host: &str) -> usize {
        if let Some(&server) = self.exact.get(host) {
            return server;
        }
        // "*.example.com" matches every dotted position from the left:
        // a.b.example.com tries ".b.example.com", then ".example.com".
        for (i, b) in host.bytes().enumerate() {
            if b == b'.' {
                if let Some(&server) = self.wildcard_head.get(&host[i..]) {
                    return server;
                }
            }
        }
        // "www.example.*" matches at dots from the right.
        for (i, b) in host.bytes().enumerate().skip(1) {
            if b == b'.' {
                if let Some(&server) = self.wildcard_tail.get(&host[..i + 1]) {
                    return server;
                }
            }
        }
        for (pattern, server) in &self.regex {
            if pattern.is_match(host) {
                return *server;
            }
        }
        self.default_server
    }

    pub fn default_server(&self) -> usize {
        self.default_server
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts() -> VirtualHosts {
        VirtualHosts::build(
            &[
                ("www.example.com".to_string(), 1),
                ("*.example.com".to_string(), 2),
                ("www.example.*".to_string(), 3),
                ("~^api[0-9]+\\.example\\.net$".to_string(), 4),
            ],
            0,
        )
        .expect("valid names")
    }

    #[test]
    fn exact_beats_wildcard() {
        assert_eq!(hosts().select("www.example.com"), 1);
    }

    #[test]
    fn leading_wildcard() {
        let hosts = hosts();
        assert_eq!(hosts.select("a.example.com"), 2);
        assert_eq!(hosts.select("deep.a.example.com"), 2);
        assert_eq!(hosts.select("example.com"), 0, "bare domain is not *.domain");
    }

    #[test]
    fn trailing_wildcard_and_regex() {
        let hosts = hosts();
        assert_eq!(hosts.select("www.example.org"), 3);
        assert_eq!(hosts.select("api7.example.net"), 4);
        assert_eq!(hosts.select("nothing.io"), 0);
    }

    #[test]
    fn rejects_malformed_wildcards() {
        assert!(VirtualHosts::build(&[("*example.com".to_string(), 0)], 0).is_err());
        assert!(VirtualHosts::build(&[("www*".to_string(), 0)], 0).is_err());
    }
}
