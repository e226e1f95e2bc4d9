use serde::Deserialize;
use std::sync::OnceLock;

/// Built-in resolver presets, matching the defaults shipped by the
/// desktop frontends.
#[derive(Debug, Clone, Deserialize)]
pub struct Preset {
    pub name: String,
    pub servers: Vec<String>,
}

const BUILTIN_PRESETS: &str = r#"[
  {"name": "Cloudflare", "servers": ["1.1.1.1", "1.0.0.1", "2606:4700:4700::1111", "2606:4700:4700::1001"]},
  {"name": "Google", "servers": ["8.8.8.8", "8.8.4.4", "2001:4860:4860::8888", "2001:4860:4860::8844"]},
  {"name": "Quad9", "servers": ["9.9.9.9", "149.112.112.112", "2620:fe::fe", "2620:fe::9"]},
  {"name": "OpenDNS", "servers": ["208.67.222.222", "208.67.220.220"]},
  {"name": "AdGuard", "servers": ["94.140.14.14", "94.140.15.15", "2a10:50c0::ad1:ff", "2a10:50c0::ad2:ff"]},
  {"name": "NextDNS", "servers": ["45.90.28.0", "45.90.30.0", "2a07:a8c0::", "2a07:a8c1::"]},
  {"name": "CleanBrowsing", "servers": ["185.228.168.168", "185.228.169.168", "2a0d:2a00:1::", "2a0d:2a00:2::"]},
  {"name": "Mullvad", "servers": ["194.242.2.2", "194.242.2.3"]},
  {"name": "Cloudflare DoH", "servers": ["https://cloudflare-dns.com/dns-query"]},
  {"name": "Google DoH", "servers": ["https://dns.google/dns-query"]},
  {"name": "Quad9 DoT", "servers": ["tls://dns.quad9.net"]}
]"#;

pub fn builtin_presets() -> &'static [Preset] {
    static PRESETS: OnceLock<Vec<Preset>> = OnceLock::new();
    PRESETS.get_or_init(|| serde_json::from_str(BUILTIN_PRESETS).expect("bad builtin presets"))
}

pub fn find_preset(name: &str) -> Option<&'static Preset> {
    builtin_presets()
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::classify;

    #[test]
    fn test_presets_parse_and_classify() {
        for preset in builtin_presets() {
            let specs = classify(&preset.servers);
            assert!(!specs.is_empty(), "preset {} yields no servers", preset.name);
        }
    }

    #[test]
    fn test_find_preset_case_insensitive() {
        assert!(find_preset("cloudflare").is_some());
        assert!(find_preset("QUAD9").is_some());
        assert!(find_preset("nonexistent").is_none());
    }
}
