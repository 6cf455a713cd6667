//! The location matcher: a static ternary tree over non-regex location
//! prefixes, an ordered regex list, and a map of named locations.
//!
//! The tree is built once at configuration time. Search walks it byte by
//! byte, remembering the longest prefix match; an exact-match location
//! short-circuits, and a node carrying the auto-redirect bit converts a
//! request for `/a` into a 301 to `/a/` when only `/a/` is configured.

use std::collections::HashMap;
use std::sync::Arc;

use regex::{Regex, RegexBuilder};

use crate::config::{LocationConfig, LocationModifier};
use crate::error::{Result, ServerError};
use crate::http::handlers::access::CompiledAccessRule;
use crate::http::handlers::rewrite::CompiledRewrite;
use crate::http::phase::PhaseHandlerFn;

/// A location compiled for runtime use.
pub struct LocationRuntime {
    pub conf: LocationConfig,
    pub regex: Option<Regex>,
    pub rewrites: Vec<CompiledRewrite>,
    pub access: Vec<CompiledAccessRule>,
    /// Installed content producer; `None` falls through to the generic
    /// content handlers (static files last).
    pub content_handler: Option<PhaseHandlerFn>,
}

impl LocationRuntime {
    pub fn compile(conf: LocationConfig) -> Result<LocationRuntime> {
        let regex = match conf.modifier {
            LocationModifier::Regex => Some(Regex::new(&conf.pattern)?),
            LocationModifier::RegexInsensitive => Some(
                RegexBuilder::new(&conf.pattern)
                    .case_insensitive(true)
                    .build()?,
            ),
            _ => None,
        };
        let rewrites = conf
            .rewrites
            .iter()
            .map(CompiledRewrite::compile)
            .collect::<Result<Vec<_>>>()?;
        let access = conf
            .access
            .iter()
            .map(CompiledAccessRule::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(LocationRuntime {
            conf,
            regex,
            rewrites,
            access,
            content_handler: None,
        })
    }

    pub fn is_exact(&self) -> bool {
        self.conf.modifier == LocationModifier::Exact
    }

    pub fn is_prefer(&self) -> bool {
        self.conf.modifier == LocationModifier::Prefer
    }
}

struct Node {
    /// Name fragment below the parent prefix.
    name: Vec<u8>,
    left: Option<Box<Node>>,
    right: Option<Box<Node>>,
    /// Locations whose names extend this node's full name.
    tree: Option<Box<Node>>,

    exact: Option<Arc<LocationRuntime>>,
    inclusive: Option<Arc<LocationRuntime>>,
    auto_redirect: bool,
}

struct Entry {
    name: Vec<u8>,
    exact: Option<Arc<LocationRuntime>>,
    inclusive: Option<Arc<LocationRuntime>>,
    auto_redirect: bool,
}

fn build_tree(mut entries: Vec<Entry>, prefix: usize) -> Option<Box<Node>> {
    if entries.is_empty() {
        return None;
    }
    let mid = entries.len() / 2;
    let mut right = entries.split_off(mid + 1);
    let entry = entries.pop().expect("mid entry");
    let left = entries;

    // Entries sorting immediately after the pivot that start with its
    // full name are its descendants; they continue matching below it.
    let name_len = entry.name.len();
    let descendants = right
        .iter()
        .take_while(|e| e.name.starts_with(&entry.name))
        .count();
    let rest = right.split_off(descendants);

    Some(Box::new(Node {
        name: entry.name[prefix..].to_vec(),
        left: build_tree(left, prefix),
        tree: build_tree(right, name_len),
        right: build_tree(rest, prefix),
        exact: entry.exact,
        inclusive: entry.inclusive,
        auto_redirect: entry.auto_redirect,
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationMatch {
    /// `/a` asked, only `/a/` configured: answer 301 with the slash.
    AutoRedirect,
    Found,
    NotFound,
}

/// Per-server location lookup structures.
pub struct LocationIndex {
    tree: Option<Box<Node>>,
    regex: Vec<Arc<LocationRuntime>>,
    named: HashMap<String, Arc<LocationRuntime>>,
    /// Every location, for post-build handler installation.
    pub all: Vec<Arc<LocationRuntime>>,
}

impl LocationIndex {
    pub fn build(locations: Vec<LocationRuntime>) -> Result<LocationIndex> {
        let all: Vec<Arc<LocationRuntime>> = locations.into_iter().map(Arc::new).collect();

        let mut regex = Vec::new();
        let mut named = HashMap::new();
        let mut static_entries: Vec<Entry> = Vec::new();

        for location in &all {
            match location.conf.modifier {
                LocationModifier::Regex | LocationModifier::RegexInsensitive => {
                    regex.push(Arc::clone(location));
                }
                LocationModifier::Named => {
                    let name = location.conf.pattern.clone();
                    if named.insert(name.clone(), Arc::clone(location)).is_some() {
                        return Err(ServerError::Config(format!(
                            "duplicate named location {name}"
                        )));
                    }
                }
                LocationModifier::Exact | LocationModifier::Prefix | LocationModifier::Prefer => {
                    let name = location.conf.pattern.as_bytes().to_vec();
                    let is_exact = location.is_exact();
                    if let Some(entry) =
                        static_entries.iter_mut().find(|e| e.name == name)
                    {
                        let slot = if is_exact {
                            &mut entry.exact
                        } else {
                            &mut entry.inclusive
                        };
                        if slot.is_some() {
                            return Err(ServerError::Config(format!(
                                "duplicate location {}",
                                location.conf.pattern
                            )));
                        }
                        *slot = Some(Arc::clone(location));
                        entry.auto_redirect |= !is_exact && name.ends_with(b"/");
                    } else {
                        static_entries.push(Entry {
                            auto_redirect: !is_exact && name.ends_with(b"/"),
                            exact: is_exact.then(|| Arc::clone(location)),
                            inclusive: (!is_exact).then(|| Arc::clone(location)),
                            name,
                        });
                    }
                }
            }
        }

        static_entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(LocationIndex {
            tree: build_tree(static_entries, 0),
            regex,
            named,
            all,
        })
    }

    pub fn named(&self, name: &str) -> Option<Arc<LocationRuntime>> {
        self.named.get(name).cloned()
    }

    /// Full lookup: static tree, then — unless the prefix winner is
    /// exclusive — the regex list.
    pub fn find(&self, uri: &str) -> (LocationMatch, Option<Arc<LocationRuntime>>) {
        let (static_match, best) = self.find_static(uri.as_bytes());
        match static_match {
            StaticOutcome::Exact => return (LocationMatch::Found, best),
            StaticOutcome::AutoRedirect => return (LocationMatch::AutoRedirect, None),
            StaticOutcome::Prefix => {}
        }
        if let Some(location) = &best {
            if location.is_prefer() {
                return (LocationMatch::Found, best);
            }
        }
        for location in &self.regex {
            let pattern = location.regex.as_ref().expect("regex location");
            if pattern.is_match(uri) {
                return (LocationMatch::Found, Some(Arc::clone(location)));
            }
        }
        match best {
            Some(location) => (LocationMatch::Found, Some(location)),
            None => (LocationMatch::NotFound, None),
        }
    }

    fn find_static(&self, uri: &[u8]) -> (StaticOutcome, Option<Arc<LocationRuntime>>) {
        let mut node = self.tree.as_deref();
        let mut path = uri;
        let mut best: Option<Arc<LocationRuntime>> = None;

        while let Some(n) = node {
            let len = path.len().min(n.name.len());
            match path[..len].cmp(&n.name[..len]) {
                std::cmp::Ordering::Less => {
                    node = n.left.as_deref();
                    continue;
                }
                std::cmp::Ordering::Greater => {
                    node = n.right.as_deref();
                    continue;
                }
                std::cmp::Ordering::Equal => {}
            }

            if path.len() >= n.name.len() {
                if n.inclusive.is_some() {
                    best = n.inclusive.clone();
                }
                if path.len() == n.name.len() {
                    if n.exact.is_some() {
                        return (StaticOutcome::Exact, n.exact.clone());
                    }
                    return (StaticOutcome::Prefix, best);
                }
                path = &path[n.name.len()..];
                node = n.tree.as_deref();
                continue;
            }

            // URI exhausted inside this node's name: the only interesting
            // case is the name being the URI plus a trailing slash.
            if n.auto_redirect && n.name.len() == path.len() + 1 && n.name.ends_with(b"/") {
                return (StaticOutcome::AutoRedirect, None);
            }
            node = n.left.as_deref();
        }

        (StaticOutcome::Prefix, best)
    }
}

enum StaticOutcome {
    Exact,
    Prefix,
    AutoRedirect,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(pattern: &str, modifier: LocationModifier) -> LocationRuntime {
        LocationRuntime::compile(LocationConfig {
            pattern: pattern.to_string(),
            modifier,
            ..Default::default()
        })
        .expect("location compiles")
    }

    fn index(specs: &[(&str, LocationModifier)]) -> LocationIndex {
        LocationIndex::build(
            specs
                .iter()
                .map(|(pattern, modifier)| location(pattern, *modifier))
                .collect(),
        )
        .expect("index builds")
    }

    fn found_pattern(index: &LocationIndex, uri: &str) -> Option<String> {
        match index.find(uri) {
            (LocationMatch::Found, Some(loc)) => Some(loc.conf.pattern.clone()),
            _ => None,
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let index = index(&[
            ("/", LocationModifier::Prefix),
            ("/static/", LocationModifier::Prefix),
            ("/static/img/", LocationModifier::Prefix),
        ]);
        assert_eq!(found_pattern(&index, "/static/img/a.png").as_deref(), Some("/static/img/"));
        assert_eq!(found_pattern(&index, "/static/css/a.css").as_deref(), Some("/static/"));
        assert_eq!(found_pattern(&index, "/other").as_deref(), Some("/"));
    }

    #[test]
    fn exact_short_circuits_regex() {
        let index = index(&[
            ("/login", LocationModifier::Exact),
            ("\\.php$", LocationModifier::Regex),
            ("/", LocationModifier::Prefix),
        ]);
        assert_eq!(found_pattern(&index, "/login").as_deref(), Some("/login"));
        assert_eq!(found_pattern(&index, "/x.php").as_deref(), Some("\\.php$"));
    }

    #[test]
    fn prefer_prefix_suppresses_regex() {
        let index = index(&[
            ("/static/", LocationModifier::Prefer),
            ("\\.php$", LocationModifier::Regex),
            ("/", LocationModifier::Prefix),
        ]);
        assert_eq!(
            found_pattern(&index, "/static/run.php").as_deref(),
            Some("/static/"),
            "^~ match skips the regex pass"
        );
        assert_eq!(found_pattern(&index, "/app/run.php").as_deref(), Some("\\.php$"));
    }

    #[test]
    fn auto_redirect_for_missing_slash() {
        let index = index(&[("/app/", LocationModifier::Prefix)]);
        assert_eq!(index.find("/app").0, LocationMatch::AutoRedirect);
        assert_eq!(found_pattern(&index, "/app/").as_deref(), Some("/app/"));
        assert_eq!(found_pattern(&index, "/app/x").as_deref(), Some("/app/"));
    }

    #[test]
    fn exact_beats_auto_redirect() {
        let index = index(&[
            ("/app", LocationModifier::Exact),
            ("/app/", LocationModifier::Prefix),
        ]);
        assert_eq!(found_pattern(&index, "/app").as_deref(), Some("/app"));
    }

    #[test]
    fn named_locations_are_separate() {
        let index = index(&[
            ("/", LocationModifier::Prefix),
            ("@fallback", LocationModifier::Named),
        ]);
        assert!(index.named("@fallback").is_some());
        assert_eq!(
            found_pattern(&index, "/@fallback").as_deref(),
            Some("/"),
            "named locations never match by URI"
        );
    }

    #[test]
    fn case_insensitive_regex() {
        let index = index(&[
            ("/", LocationModifier::Prefix),
            ("\\.JPG$", LocationModifier::RegexInsensitive),
        ]);
        assert_eq!(found_pattern(&index, "/photo.jpg").as_deref(), Some("\\.JPG$"));
    }
}
