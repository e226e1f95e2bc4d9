use crate::config::RawConfig;
use crate::dns::{classify, select_actionable, ServerKind, ServerSpec};
use crate::error::EngineError;
use crate::profile::{ProfileManager, ProfileProtocol};
use crate::proxy::ProxySupervisor;
use crate::system::{CommandRunner, SystemDnsBackend, VerifyOutcome};
use dnsctlapi::CommandResponse;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Engine-owned singleton state: the supervised proxy process. Only the
/// serialized mutating path touches it; the managed profile is tracked
/// by the OS installer itself, so removal enumerates instead of caching.
struct EngineState {
    proxy: ProxySupervisor,
}

/// The privileged engine. Re-validates every request and drives the DNS
/// backend, profile manager, and proxy supervisor. Mutating operations
/// are serialized behind one async mutex so two concurrent requests can
/// never interleave their system-level side effects.
pub struct Engine {
    backend: SystemDnsBackend,
    profiles: ProfileManager,
    state: Mutex<EngineState>,
    native_profiles: bool,
}

impl Engine {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &RawConfig) -> Self {
        let native_profiles = cfg!(target_os = "macos") && !config.prefer_proxy;
        Self {
            backend: SystemDnsBackend::new(runner.clone()),
            profiles: ProfileManager::new(runner, config.profile.identifier_prefix.clone()),
            state: Mutex::new(EngineState {
                proxy: ProxySupervisor::new(config.proxy_settings()),
            }),
            native_profiles,
        }
    }

    pub async fn apply(&self, servers: Vec<String>) -> CommandResponse {
        let specs = classify(&servers);
        if specs.is_empty() {
            return CommandResponse::failure(EngineError::NoValidServers.to_string());
        }
        let (acted, ignored) = select_actionable(specs);
        let kind = acted[0].kind;

        let mut state = self.state.lock().await;
        let result = match kind {
            ServerKind::Ip => self.apply_plain(&mut state, &acted).await,
            ServerKind::DoH | ServerKind::DoT => self.apply_encrypted(&mut state, &acted[0]).await,
        };
        match result {
            Ok(mut resp) => {
                if !ignored.is_empty() {
                    let names: Vec<&str> = ignored.iter().map(|s| s.raw.as_str()).collect();
                    resp.message = format!(
                        "{}; ignored lower-priority entries: {}",
                        resp.message,
                        names.join(", ")
                    );
                }
                resp
            }
            Err(e) => {
                tracing::warn!("Apply failed: {}", e);
                CommandResponse::failure(e.to_string())
            }
        }
    }

    pub async fn clear(&self) -> CommandResponse {
        let mut state = self.state.lock().await;
        state.proxy.stop().await;
        self.remove_profiles();
        let result = self
            .backend
            .clear_servers()
            .and_then(|services| self.backend.flush_cache().map(|_| services));
        match result {
            Ok(services) => {
                tracing::info!("Cleared resolvers on {} services", services.len());
                CommandResponse::success(format!("Cleared on {} services", services.len()))
            }
            Err(e) => {
                tracing::warn!("Clear failed: {}", e);
                CommandResponse::failure(e.to_string())
            }
        }
    }

    pub async fn flush(&self) -> CommandResponse {
        // flush does not mutate resolver configuration, but shares the
        // serialization so it cannot land mid-apply
        let _state = self.state.lock().await;
        match self.backend.flush_cache() {
            Ok(()) => CommandResponse::success("Flushed cache"),
            Err(e) => CommandResponse::failure(e.to_string()),
        }
    }

    /// Read-only status query; may observe a transient mid-update state.
    pub fn active_resolvers(&self) -> Vec<String> {
        self.backend.active_resolvers().unwrap_or_default()
    }

    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.proxy.stop().await;
    }

    async fn apply_plain(
        &self,
        state: &mut EngineState,
        specs: &[ServerSpec],
    ) -> Result<CommandResponse, EngineError> {
        // switching to plain resolvers tears down any encrypted path
        state.proxy.stop().await;
        self.remove_profiles();

        let ips: Vec<String> = specs.iter().map(|s| s.normalized.clone()).collect();
        let services = self.backend.set_servers(&ips)?;
        self.backend.flush_cache()?;
        Ok(match self.backend.verify_active(&ips) {
            VerifyOutcome::Confirmed(active) => CommandResponse::success(format!(
                "Applied to {} services (active: {})",
                services.len(),
                active.join(", ")
            )),
            VerifyOutcome::NotActive(active) => CommandResponse::failure(format!(
                "Applied but not active; current: {}",
                active.join(", ")
            )),
            VerifyOutcome::Unverifiable => CommandResponse::success(format!(
                "Applied to {} services (could not verify)",
                services.len()
            )),
        })
    }

    async fn apply_encrypted(
        &self,
        state: &mut EngineState,
        spec: &ServerSpec,
    ) -> Result<CommandResponse, EngineError> {
        // The native managed-profile mechanism only understands DoH; DoT
        // always goes through the local proxy.
        if spec.kind == ServerKind::DoH && self.native_profiles {
            state.proxy.stop().await;
            let profile = self
                .profiles
                .install(ProfileProtocol::Https, &spec.normalized)
                .await?;
            tracing::info!("Managed profile {} active", profile.identifier);
            return Ok(CommandResponse::success(format!(
                "Installed DoH profile for {} ({} bootstrap addresses)",
                spec.normalized,
                profile.bootstrap.len()
            )));
        }

        self.remove_profiles();
        state.proxy.start(spec).await?;
        let loopback = state.proxy.resolver_address();
        self.backend.set_servers(&[loopback.clone()])?;
        self.backend.flush_cache()?;
        Ok(match self.backend.verify_active(&[loopback]) {
            VerifyOutcome::NotActive(active) => CommandResponse::failure(format!(
                "Applied but not active; current: {}",
                active.join(", ")
            )),
            _ => CommandResponse::success(format!(
                "{} active via local proxy: {}",
                spec.kind.label(),
                spec.normalized
            )),
        })
    }

    fn remove_profiles(&self) {
        if self.native_profiles {
            if let Err(e) = self.profiles.remove_all() {
                tracing::warn!("Profile removal failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::testing::MockRunner;

    fn engine_with(runner: MockRunner) -> Engine {
        Engine::new(Arc::new(runner), &RawConfig::default())
    }

    #[tokio::test]
    async fn test_apply_rejects_empty_input() {
        let engine = engine_with(MockRunner::new(vec![]));
        let resp = engine.apply(vec![]).await;
        assert!(!resp.ok);
        assert!(resp.message.contains("No valid DNS servers"));
    }

    #[tokio::test]
    async fn test_apply_rejects_garbage_input() {
        let engine = engine_with(MockRunner::new(vec![]));
        let resp = engine.apply(vec!["not a server!".to_string()]).await;
        assert!(!resp.ok);
    }

    #[cfg(not(target_os = "macos"))]
    #[tokio::test]
    async fn test_apply_plain_end_to_end() {
        let runner = MockRunner::new(vec![
            ("ip", true, "2: eth0: <UP>"),
            ("resolvectl", true, ""),                  // set eth0
            ("resolvectl", true, ""),                  // flush
            ("resolvectl", true, "Global: 1.1.1.1"),   // verify
        ]);
        let engine = engine_with(runner);
        let resp = engine
            .apply(vec!["1.1.1.1".to_string(), "1.0.0.1".to_string()])
            .await;
        assert!(resp.ok, "{}", resp.message);
        assert!(resp.message.contains("Applied to 1 services"));
        assert!(resp.message.contains("1.1.1.1"));
    }

    #[cfg(not(target_os = "macos"))]
    #[tokio::test]
    async fn test_apply_verification_mismatch_is_soft_failure() {
        let runner = MockRunner::new(vec![
            ("ip", true, "2: eth0: <UP>"),
            ("resolvectl", true, ""),
            ("resolvectl", true, ""),
            ("resolvectl", true, "Global: 192.168.1.1"),
        ]);
        let engine = engine_with(runner);
        let resp = engine.apply(vec!["9.9.9.9".to_string()]).await;
        assert!(!resp.ok);
        assert!(resp.message.contains("Applied but not active"));
        assert!(resp.message.contains("192.168.1.1"));
    }

    #[cfg(not(target_os = "macos"))]
    #[tokio::test]
    async fn test_apply_no_network_services() {
        let runner = MockRunner::new(vec![("ip", true, "1: lo: <LOOPBACK>")]);
        let engine = engine_with(runner);
        let resp = engine.apply(vec!["9.9.9.9".to_string()]).await;
        assert!(!resp.ok);
        assert!(resp.message.contains("No network services found"));
    }

    #[cfg(not(target_os = "macos"))]
    #[tokio::test]
    async fn test_apply_doh_without_proxy_binary_fails_cleanly() {
        // no native profile support off macOS, so DoH goes to the proxy
        // path and fails fast on the missing bundled binary
        let engine = engine_with(MockRunner::new(vec![]));
        let resp = engine
            .apply(vec!["https://dns.example.com/dns-query".to_string()])
            .await;
        assert!(!resp.ok);
        assert!(resp.message.contains("Proxy binary not found"));
    }

    #[cfg(not(target_os = "macos"))]
    #[tokio::test]
    async fn test_mixed_kinds_note_ignored_entries() {
        // DoH outranks IP, so the proxy path is chosen and the plain IPs
        // are reported as ignored
        let engine = engine_with(MockRunner::new(vec![]));
        let resp = engine
            .apply(vec![
                "https://dns.example.com/dns-query".to_string(),
                "1.1.1.1".to_string(),
            ])
            .await;
        // failure comes from the missing proxy binary; the ignored note
        // is only attached to successful responses
        assert!(!resp.ok);
    }

    #[cfg(not(target_os = "macos"))]
    #[tokio::test]
    async fn test_clear_end_to_end() {
        let runner = MockRunner::new(vec![
            ("ip", true, "2: eth0: <UP>\n3: wlan0: <UP>"),
            ("resolvectl", true, ""), // revert eth0
            ("resolvectl", true, ""), // revert wlan0
            ("resolvectl", true, ""), // flush
        ]);
        let engine = engine_with(runner);
        let resp = engine.clear().await;
        assert!(resp.ok, "{}", resp.message);
        assert_eq!(resp.message, "Cleared on 2 services");
    }

    #[cfg(not(target_os = "macos"))]
    #[tokio::test]
    async fn test_flush() {
        let runner = MockRunner::new(vec![("resolvectl", true, "")]);
        let engine = engine_with(runner);
        let resp = engine.flush().await;
        assert!(resp.ok);
        assert_eq!(resp.message, "Flushed cache");
    }

    #[cfg(not(target_os = "macos"))]
    #[tokio::test]
    async fn test_flush_failure_is_reported() {
        let runner = MockRunner::new(vec![("resolvectl", false, "Failed to flush caches")]);
        let engine = engine_with(runner);
        let resp = engine.flush().await;
        assert!(!resp.ok);
        assert!(resp.message.contains("Flush error"));
    }
}
