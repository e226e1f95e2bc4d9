use crate::error::ProfileError;
use crate::system::CommandRunner;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

const MAX_BOOTSTRAP_ADDRESSES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileProtocol {
    Https,
    Tls,
}

impl fmt::Display for ProfileProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileProtocol::Https => write!(f, "HTTPS"),
            ProfileProtocol::Tls => write!(f, "TLS"),
        }
    }
}

/// An installed encrypted-DNS configuration. The identifier is stable and
/// namespaced so removal never touches unrelated profiles.
#[derive(Debug, Clone)]
pub struct ManagedProfile {
    pub identifier: String,
    pub protocol: ProfileProtocol,
    pub target: String,
    pub bootstrap: Vec<IpAddr>,
}

/// Installs and removes the OS-level managed DNS configuration payload.
pub struct ProfileManager {
    runner: Arc<dyn CommandRunner>,
    identifier_prefix: String,
}

impl ProfileManager {
    pub fn new(runner: Arc<dyn CommandRunner>, identifier_prefix: String) -> Self {
        Self {
            runner,
            identifier_prefix,
        }
    }

    fn run(&self, program: &'static str, args: &[&str]) -> Result<crate::system::CommandOutput, ProfileError> {
        self.runner
            .run(program, args)
            .map_err(|e| ProfileError::Command(program, e))
    }

    /// Install a managed DNS profile for the given target. Any profile
    /// previously installed by this system is removed first, so at most
    /// one exists afterwards.
    pub async fn install(
        &self,
        protocol: ProfileProtocol,
        target: &str,
    ) -> Result<ManagedProfile, ProfileError> {
        if let Err(e) = self.remove_all() {
            tracing::warn!("Removing previous profiles failed: {}", e);
        }
        let host = match protocol {
            ProfileProtocol::Https => url::Url::parse(target)
                .ok()
                .and_then(|u| u.host_str().map(String::from))
                .unwrap_or_else(|| target.to_string()),
            ProfileProtocol::Tls => target.to_string(),
        };
        let bootstrap = resolve_bootstrap(&host).await;
        if bootstrap.is_empty() {
            tracing::warn!("No bootstrap addresses resolved for {}", host);
        }
        let identifier = format!("{}.dns", self.identifier_prefix);
        let payload = render_payload(&identifier, protocol, target, &bootstrap);

        let path = std::env::temp_dir().join("dnsctl-profile.mobileconfig");
        std::fs::write(&path, payload)?;
        let result = self.run("profiles", &["-I", "-F", &path.to_string_lossy()]);
        let _ = std::fs::remove_file(&path);
        let out = result?;
        if !out.success {
            return Err(ProfileError::InstallRejected(out.output));
        }
        tracing::info!("Installed managed DNS profile {}", identifier);
        Ok(ManagedProfile {
            identifier,
            protocol,
            target: target.to_string(),
            bootstrap,
        })
    }

    /// Remove every profile whose identifier is namespaced to this
    /// system. Returns the number removed; "nothing installed" is not an
    /// error.
    pub fn remove_all(&self) -> Result<usize, ProfileError> {
        let out = self.run("profiles", &["-P"])?;
        if !out.success {
            // `profiles -P` fails when no profiles are installed at all
            return Ok(0);
        }
        let mut removed = 0;
        for id in parse_profile_identifiers(&out.output) {
            if !id.starts_with(&self.identifier_prefix) {
                continue;
            }
            let out = self.run("profiles", &["-R", "-p", &id])?;
            if out.success {
                removed += 1;
                tracing::info!("Removed managed DNS profile {}", id);
            } else {
                tracing::warn!("Failed to remove profile {}: {}", id, out.output);
            }
        }
        Ok(removed)
    }
}

/// Best-effort resolution of the target host to bootstrap addresses.
/// Proceeding with zero addresses is allowed but reduces reliability.
async fn resolve_bootstrap(host: &str) -> Vec<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return vec![ip];
    }
    let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
    match resolver.lookup_ip(host).await {
        Ok(lookup) => lookup.iter().take(MAX_BOOTSTRAP_ADDRESSES).collect(),
        Err(e) => {
            tracing::warn!("Bootstrap resolution for {} failed: {}", host, e);
            Vec::new()
        }
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Build the configuration-profile payload carrying a system-managed DNS
/// setting of the requested protocol.
pub(crate) fn render_payload(
    identifier: &str,
    protocol: ProfileProtocol,
    target: &str,
    bootstrap: &[IpAddr],
) -> String {
    let addresses = bootstrap
        .iter()
        .map(|ip| format!("        <string>{}</string>", ip))
        .collect::<Vec<_>>()
        .join("\n");
    let target_key = match protocol {
        ProfileProtocol::Https => "ServerURL",
        ProfileProtocol::Tls => "ServerName",
    };
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
  <key>PayloadContent</key>
  <array>
    <dict>
      <key>PayloadType</key>
      <string>com.apple.dnsSettings.managed</string>
      <key>PayloadVersion</key>
      <integer>1</integer>
      <key>PayloadIdentifier</key>
      <string>{identifier}.payload</string>
      <key>PayloadUUID</key>
      <string>7f6e2a44-0000-4000-8000-0d05c7100001</string>
      <key>DNSSettings</key>
      <dict>
        <key>DNSProtocol</key>
        <string>{protocol}</string>
        <key>{target_key}</key>
        <string>{target}</string>
        <key>ServerAddresses</key>
        <array>
{addresses}
        </array>
      </dict>
    </dict>
  </array>
  <key>PayloadDisplayName</key>
  <string>dnsctl Encrypted DNS</string>
  <key>PayloadIdentifier</key>
  <string>{identifier}</string>
  <key>PayloadType</key>
  <string>Configuration</string>
  <key>PayloadUUID</key>
  <string>7f6e2a44-0000-4000-8000-0d05c7100000</string>
  <key>PayloadVersion</key>
  <integer>1</integer>
</dict>
</plist>
"#,
        identifier = xml_escape(identifier),
        protocol = protocol,
        target_key = target_key,
        target = xml_escape(target),
        addresses = addresses,
    )
}

/// Pull `profileIdentifier: …` values out of `profiles -P` output.
pub(crate) fn parse_profile_identifiers(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            line.split("profileIdentifier: ")
                .nth(1)
                .map(|id| id.trim().to_string())
        })
        .filter(|id| !id.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::testing::MockRunner;

    #[test]
    fn test_render_payload_https() {
        let payload = render_payload(
            "org.dnsctl.profile.dns",
            ProfileProtocol::Https,
            "https://dns.example.com/dns-query",
            &["1.2.3.4".parse().unwrap()],
        );
        assert!(payload.contains("com.apple.dnsSettings.managed"));
        assert!(payload.contains("<string>HTTPS</string>"));
        assert!(payload.contains("<key>ServerURL</key>"));
        assert!(payload.contains("https://dns.example.com/dns-query"));
        assert!(payload.contains("<string>1.2.3.4</string>"));
    }

    #[test]
    fn test_render_payload_tls_uses_server_name() {
        let payload = render_payload(
            "org.dnsctl.profile.dns",
            ProfileProtocol::Tls,
            "dns.quad9.net",
            &[],
        );
        assert!(payload.contains("<string>TLS</string>"));
        assert!(payload.contains("<key>ServerName</key>"));
        assert!(payload.contains("dns.quad9.net"));
    }

    #[test]
    fn test_parse_profile_identifiers() {
        let out = "_computerlevel[1] attribute: profileIdentifier: org.dnsctl.profile.dns\n_computerlevel[2] attribute: profileIdentifier: com.example.mdm\nThere are 2 configuration profiles installed\n";
        assert_eq!(
            parse_profile_identifiers(out),
            vec![
                "org.dnsctl.profile.dns".to_string(),
                "com.example.mdm".to_string()
            ]
        );
    }

    #[test]
    fn test_remove_all_only_touches_owned_profiles() {
        let runner = MockRunner::new(vec![
            (
                "profiles",
                true,
                "_computerlevel[1] attribute: profileIdentifier: org.dnsctl.profile.dns\n_computerlevel[2] attribute: profileIdentifier: com.example.mdm",
            ),
            ("profiles", true, ""),
        ]);
        let runner = std::sync::Arc::new(runner);
        let mgr = ProfileManager::new(runner.clone(), "org.dnsctl.profile".to_string());
        assert_eq!(mgr.remove_all().unwrap(), 1);
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].contains("org.dnsctl.profile.dns"));
        assert!(!calls.iter().any(|c| c.contains("com.example.mdm") && c.contains("-R")));
    }

    #[test]
    fn test_remove_all_with_no_profiles_installed() {
        let runner = MockRunner::new(vec![("profiles", false, "There are no configuration profiles installed")]);
        let mgr = ProfileManager::new(std::sync::Arc::new(runner), "org.dnsctl.profile".to_string());
        assert_eq!(mgr.remove_all().unwrap(), 0);
    }
}
