use crate::error::BackendError;
use crate::system::CommandRunner;
use std::sync::Arc;

/// Result of the post-apply verification step. Verification failure is a
/// soft condition: the resolver list was written, but a higher-priority
/// configuration may be overriding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// At least one requested resolver is observed active.
    Confirmed(Vec<String>),
    /// Resolvers were written but none is observed active.
    NotActive(Vec<String>),
    /// The verification command itself failed.
    Unverifiable,
}

/// Applies and clears resolver lists on every active network service and
/// flushes the system resolution cache.
pub struct SystemDnsBackend {
    runner: Arc<dyn CommandRunner>,
}

impl SystemDnsBackend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn run(&self, program: &'static str, args: &[&str]) -> Result<crate::system::CommandOutput, BackendError> {
        self.runner
            .run(program, args)
            .map_err(|e| BackendError::Command(program, e))
    }

    /// Enumerate active network services. Zero services is an explicit
    /// error, never an empty success.
    pub fn list_services(&self) -> Result<Vec<String>, BackendError> {
        #[cfg(target_os = "macos")]
        let services = {
            let out = self.run("networksetup", &["-listallnetworkservices"])?;
            if !out.success {
                return Err(BackendError::ServiceFailed {
                    service: "(enumeration)".to_string(),
                    output: out.output,
                });
            }
            parse_network_services(&out.output)
        };
        #[cfg(not(target_os = "macos"))]
        let services = {
            let out = self.run("ip", &["-o", "link", "show"])?;
            if !out.success {
                return Err(BackendError::ServiceFailed {
                    service: "(enumeration)".to_string(),
                    output: out.output,
                });
            }
            parse_link_names(&out.output)
        };
        if services.is_empty() {
            return Err(BackendError::NoNetworkServices);
        }
        Ok(services)
    }

    /// Set the resolver list on every active service, stopping at the
    /// first hard failure. Returns the services touched.
    pub fn set_servers(&self, ips: &[String]) -> Result<Vec<String>, BackendError> {
        let services = self.list_services()?;
        for svc in &services {
            let out = self.set_for_service(svc, ips)?;
            if !out.success {
                return Err(BackendError::ServiceFailed {
                    service: svc.clone(),
                    output: out.output,
                });
            }
        }
        Ok(services)
    }

    /// Reset every active service to default resolution.
    pub fn clear_servers(&self) -> Result<Vec<String>, BackendError> {
        let services = self.list_services()?;
        for svc in &services {
            let out = self.clear_for_service(svc)?;
            if !out.success {
                return Err(BackendError::ServiceFailed {
                    service: svc.clone(),
                    output: out.output,
                });
            }
        }
        Ok(services)
    }

    /// Flush the local resolution cache and signal the resolution daemon
    /// to reload.
    pub fn flush_cache(&self) -> Result<(), BackendError> {
        #[cfg(target_os = "macos")]
        {
            let a = self.run("dscacheutil", &["-flushcache"])?;
            let b = self.run("killall", &["-HUP", "mDNSResponder"])?;
            if a.success && b.success {
                Ok(())
            } else {
                Err(BackendError::Flush(format!("{} | {}", a.output, b.output)))
            }
        }
        #[cfg(not(target_os = "macos"))]
        {
            let out = self.run("resolvectl", &["flush-caches"])?;
            if out.success {
                Ok(())
            } else {
                Err(BackendError::Flush(out.output))
            }
        }
    }

    /// Read the resolvers the system currently considers active.
    pub fn active_resolvers(&self) -> Result<Vec<String>, BackendError> {
        #[cfg(target_os = "macos")]
        {
            let out = self.run("scutil", &["--dns"])?;
            if !out.success {
                return Err(BackendError::Flush(out.output));
            }
            Ok(parse_scutil_nameservers(&out.output))
        }
        #[cfg(not(target_os = "macos"))]
        {
            let out = self.run("resolvectl", &["dns"])?;
            if !out.success {
                return Err(BackendError::Flush(out.output));
            }
            Ok(parse_resolvectl_dns(&out.output))
        }
    }

    /// Confirm at least one requested resolver is observed active. This
    /// guards against the configuration being silently overridden by a
    /// higher-priority managed profile.
    pub fn verify_active(&self, requested: &[String]) -> VerifyOutcome {
        match self.active_resolvers() {
            Ok(active) => {
                if requested.iter().any(|r| active.contains(r)) {
                    VerifyOutcome::Confirmed(active)
                } else {
                    VerifyOutcome::NotActive(active)
                }
            }
            Err(_) => VerifyOutcome::Unverifiable,
        }
    }

    fn set_for_service(
        &self,
        service: &str,
        ips: &[String],
    ) -> Result<crate::system::CommandOutput, BackendError> {
        #[cfg(target_os = "macos")]
        {
            let mut args = vec!["-setdnsservers", service];
            args.extend(ips.iter().map(|s| s.as_str()));
            self.run("networksetup", &args)
        }
        #[cfg(not(target_os = "macos"))]
        {
            let mut args = vec!["dns", service];
            args.extend(ips.iter().map(|s| s.as_str()));
            self.run("resolvectl", &args)
        }
    }

    fn clear_for_service(&self, service: &str) -> Result<crate::system::CommandOutput, BackendError> {
        #[cfg(target_os = "macos")]
        {
            self.run("networksetup", &["-setdnsservers", service, "Empty"])
        }
        #[cfg(not(target_os = "macos"))]
        {
            self.run("resolvectl", &["revert", service])
        }
    }
}

/// `networksetup -listallnetworkservices` prints a leading notice and
/// marks disabled services with an asterisk.
pub(crate) fn parse_network_services(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('*') && !l.starts_with("An asterisk"))
        .map(String::from)
        .collect()
}

/// `ip -o link show` lines look like `2: eth0: <BROADCAST,...>`; veth
/// pairs carry an `@peer` suffix. The loopback device is skipped.
pub(crate) fn parse_link_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _index = fields.next()?;
            let name = fields.next()?.trim_end_matches(':');
            let name = name.split('@').next().unwrap_or(name);
            if name.is_empty() || name == "lo" {
                None
            } else {
                Some(name.to_string())
            }
        })
        .collect()
}

/// Extract `nameserver[i] : addr` entries from `scutil --dns` output.
pub(crate) fn parse_scutil_nameservers(output: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    output
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("nameserver["))
        .filter_map(|l| l.split_once(':').map(|(_, addr)| addr.trim().to_string()))
        .filter(|addr| !addr.is_empty() && seen.insert(addr.clone()))
        .collect()
}

/// Extract addresses from `resolvectl dns` output, which has one
/// `Global:` line plus one `Link N (iface):` line per interface.
pub(crate) fn parse_resolvectl_dns(output: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut addrs = Vec::new();
    for line in output.lines() {
        if let Some((_, rhs)) = line.rsplit_once(':') {
            for addr in rhs.split_whitespace() {
                if addr.parse::<std::net::IpAddr>().is_ok() && seen.insert(addr.to_string()) {
                    addrs.push(addr.to_string());
                }
            }
        }
    }
    addrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::testing::MockRunner;

    #[test]
    fn test_parse_network_services() {
        let out = "An asterisk (*) denotes that a network service is disabled.\nWi-Fi\n*Bluetooth PAN\nThunderbolt Bridge\n";
        assert_eq!(
            parse_network_services(out),
            vec!["Wi-Fi".to_string(), "Thunderbolt Bridge".to_string()]
        );
    }

    #[test]
    fn test_parse_link_names() {
        let out = "1: lo: <LOOPBACK,UP> mtu 65536\n2: eth0: <BROADCAST,UP> mtu 1500\n3: veth1@if2: <BROADCAST> mtu 1500\n";
        assert_eq!(
            parse_link_names(out),
            vec!["eth0".to_string(), "veth1".to_string()]
        );
    }

    #[test]
    fn test_parse_scutil_nameservers() {
        let out = "DNS configuration\n\nresolver #1\n  nameserver[0] : 1.1.1.1\n  nameserver[1] : 1.0.0.1\nresolver #2\n  nameserver[0] : 1.1.1.1\n";
        assert_eq!(
            parse_scutil_nameservers(out),
            vec!["1.1.1.1".to_string(), "1.0.0.1".to_string()]
        );
    }

    #[test]
    fn test_parse_resolvectl_dns() {
        let out = "Global: 9.9.9.9\nLink 2 (eth0): 1.1.1.1 8.8.8.8\nLink 3 (docker0):\n";
        assert_eq!(
            parse_resolvectl_dns(out),
            vec![
                "9.9.9.9".to_string(),
                "1.1.1.1".to_string(),
                "8.8.8.8".to_string()
            ]
        );
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn test_set_servers_stops_at_first_failure() {
        let runner = MockRunner::new(vec![
            ("ip", true, "2: eth0: <UP>\n3: eth1: <UP>"),
            ("resolvectl", true, ""),
            ("resolvectl", false, "Link eth1 is managed elsewhere"),
        ]);
        let backend = SystemDnsBackend::new(std::sync::Arc::new(runner));
        let err = backend
            .set_servers(&["9.9.9.9".to_string()])
            .expect_err("second interface should fail");
        match err {
            BackendError::ServiceFailed { service, output } => {
                assert_eq!(service, "eth1");
                assert!(output.contains("managed elsewhere"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn test_no_network_services() {
        let runner = MockRunner::new(vec![("ip", true, "1: lo: <LOOPBACK,UP>")]);
        let backend = SystemDnsBackend::new(std::sync::Arc::new(runner));
        assert!(matches!(
            backend.set_servers(&["9.9.9.9".to_string()]),
            Err(BackendError::NoNetworkServices)
        ));
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn test_verify_active_confirmed() {
        let runner = MockRunner::new(vec![("resolvectl", true, "Global: 9.9.9.9")]);
        let backend = SystemDnsBackend::new(std::sync::Arc::new(runner));
        assert_eq!(
            backend.verify_active(&["9.9.9.9".to_string()]),
            VerifyOutcome::Confirmed(vec!["9.9.9.9".to_string()])
        );
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn test_verify_active_mismatch() {
        let runner = MockRunner::new(vec![("resolvectl", true, "Global: 192.168.1.1")]);
        let backend = SystemDnsBackend::new(std::sync::Arc::new(runner));
        assert_eq!(
            backend.verify_active(&["9.9.9.9".to_string()]),
            VerifyOutcome::NotActive(vec!["192.168.1.1".to_string()])
        );
    }
}
