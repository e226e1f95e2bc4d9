use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Resolver classes, ordered by action priority: when a request mixes
/// kinds, the engine acts on the highest-priority class only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServerKind {
    DoH,
    DoT,
    Ip,
}

impl ServerKind {
    pub fn label(&self) -> &'static str {
        match self {
            ServerKind::DoH => "DoH",
            ServerKind::DoT => "DoT",
            ServerKind::Ip => "IP",
        }
    }
}

/// One resolver entry after classification.
///
/// `normalized` is the canonical form: bare IP, full `https://` URL for
/// DoH, or bare hostname for DoT. Within one classification batch the
/// normalized values are unique and keep first-seen order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub kind: ServerKind,
    pub raw: String,
    pub normalized: String,
}

fn ipv4_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^((25[0-5]|2[0-4]\d|[01]?\d?\d)\.){3}(25[0-5]|2[0-4]\d|[01]?\d?\d)$")
            .expect("bad ipv4 regex")
    })
}

fn ipv6_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-fA-F:]+$").expect("bad ipv6 regex"))
}

fn hostname_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9.-]*$").expect("bad hostname regex"))
}

pub fn is_ip_literal(token: &str) -> bool {
    // all-hex hostnames would satisfy the v6 charset alone
    ipv4_regex().is_match(token) || (token.contains(':') && ipv6_regex().is_match(token))
}

fn expand_shorthand(token: &str) -> String {
    for (prefix, scheme) in [("doh://", "https://"), ("doh:", "https://"), ("dot://", "tls://"), ("dot:", "tls://")] {
        if let Some(rest) = token.strip_prefix(prefix) {
            return format!("{}{}", scheme, rest);
        }
    }
    token.to_string()
}

fn classify_one(token: &str) -> Option<(ServerKind, String)> {
    if is_ip_literal(token) {
        return Some((ServerKind::Ip, token.to_string()));
    }
    let lower = token.to_ascii_lowercase();
    if lower.starts_with("https://") {
        return Some((ServerKind::DoH, token.to_string()));
    }
    if lower.starts_with("tls://") {
        let host = &token["tls://".len()..];
        if host.is_empty() {
            return None;
        }
        return Some((ServerKind::DoT, host.to_string()));
    }
    if token.contains('.') && hostname_regex().is_match(token) {
        return Some((ServerKind::DoT, token.to_string()));
    }
    None
}

/// Classify free-form resolver strings into typed specs. Unrecognized
/// tokens are dropped; duplicates after normalization are removed with
/// first-seen order preserved. Never errors: an empty result means the
/// caller reports "no valid servers".
pub fn classify<S: AsRef<str>>(tokens: &[S]) -> Vec<ServerSpec> {
    let mut seen = HashSet::new();
    let mut specs = Vec::new();
    for raw in tokens {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            continue;
        }
        let expanded = expand_shorthand(trimmed);
        if let Some((kind, normalized)) = classify_one(&expanded) {
            if seen.insert(normalized.clone()) {
                specs.push(ServerSpec {
                    kind,
                    raw: trimmed.to_string(),
                    normalized,
                });
            }
        }
    }
    specs
}

/// Split a classified batch into the entries that will be acted upon and
/// the entries ignored because a higher-priority kind is present
/// (DoH > DoT > IP).
pub fn select_actionable(specs: Vec<ServerSpec>) -> (Vec<ServerSpec>, Vec<ServerSpec>) {
    let Some(chosen) = specs.iter().map(|s| s.kind).min() else {
        return (Vec::new(), Vec::new());
    };
    specs.into_iter().partition(|s| s.kind == chosen)
}
