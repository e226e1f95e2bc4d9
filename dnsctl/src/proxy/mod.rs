mod stamp;

pub use stamp::{doh_stamp, dot_stamp};

use crate::dns::{ServerKind, ServerSpec};
use crate::error::ProxyError;
use regex::Regex;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

const DIAGNOSTIC_LINES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Stopped,
    Listening,
    Crashed,
}

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub listen_addr: Ipv4Addr,
    pub listen_port: u16,
    pub binary_path: PathBuf,
    pub template_path: PathBuf,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub grace_period: Duration,
}

struct SupervisedProxy {
    child: Child,
    upstream: String,
    diagnostics: Arc<Mutex<VecDeque<String>>>,
}

/// Launches, health-checks, and terminates the local forwarding proxy
/// that speaks DoH/DoT upstream and plain DNS on a loopback port. At
/// most one supervised process exists at any time.
pub struct ProxySupervisor {
    settings: ProxySettings,
    current: Option<SupervisedProxy>,
}

impl ProxySupervisor {
    pub fn new(settings: ProxySettings) -> Self {
        Self {
            settings,
            current: None,
        }
    }

    /// The loopback address handed to the system backend as the sole
    /// resolver while the proxy is active.
    pub fn resolver_address(&self) -> String {
        IpAddr::V4(self.settings.listen_addr).to_string()
    }

    pub fn upstream(&self) -> Option<&str> {
        self.current.as_ref().map(|p| p.upstream.as_str())
    }

    pub fn pid(&self) -> Option<u32> {
        self.current.as_ref().and_then(|p| p.child.id())
    }

    /// Live process status, not merely "was started".
    pub fn is_running(&mut self) -> bool {
        match &mut self.current {
            Some(p) => matches!(p.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn state(&mut self) -> ProxyState {
        if self.is_running() {
            ProxyState::Listening
        } else if self.current.is_some() {
            ProxyState::Crashed
        } else {
            ProxyState::Stopped
        }
    }

    /// Start forwarding to `upstream`, force-stopping any existing
    /// process first. Returns once the loopback port accepts connections
    /// or the bounded startup timeout elapses.
    pub async fn start(&mut self, upstream: &ServerSpec) -> Result<(), ProxyError> {
        self.stop().await;

        if !self.settings.binary_path.is_file() {
            return Err(ProxyError::BinaryMissing(self.settings.binary_path.clone()));
        }
        if !self.settings.template_path.is_file() {
            return Err(ProxyError::TemplateMissing(
                self.settings.template_path.clone(),
            ));
        }

        let (server_name, stamp) = match upstream.kind {
            ServerKind::DoH => {
                let url = url::Url::parse(&upstream.normalized)
                    .map_err(|_| ProxyError::UnsupportedUpstream(upstream.normalized.clone()))?;
                ("custom-doh", doh_stamp(&url)?)
            }
            ServerKind::DoT => ("custom-dot", dot_stamp(&upstream.normalized)?),
            ServerKind::Ip => {
                return Err(ProxyError::UnsupportedUpstream(upstream.normalized.clone()))
            }
        };

        let listen = SocketAddr::new(
            IpAddr::V4(self.settings.listen_addr),
            self.settings.listen_port,
        );
        let template = tokio::fs::read_to_string(&self.settings.template_path).await?;
        let rendered = render_runtime_config(&template, server_name, &stamp, &listen.to_string());
        let runtime_path = std::env::temp_dir().join("dnsctl-proxy.toml");
        tokio::fs::write(&runtime_path, rendered).await?;

        tracing::info!(
            "Starting resolver proxy for {} on {}",
            upstream.normalized,
            listen
        );
        let mut child = Command::new(&self.settings.binary_path)
            .arg("-config")
            .arg(&runtime_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Drain output continuously so pipe backpressure can never stall
        // the child.
        let diagnostics = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain_output(stdout, diagnostics.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_output(stderr, diagnostics.clone()));
        }

        let deadline = tokio::time::Instant::now() + self.settings.startup_timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                let diag = drain_text(&diagnostics);
                return Err(ProxyError::LaunchFailed(if diag.is_empty() {
                    format!("exit status {}", status)
                } else {
                    diag
                }));
            }
            if TcpStream::connect(listen).await.is_ok() {
                tracing::info!("Resolver proxy listening on {}", listen);
                self.current = Some(SupervisedProxy {
                    child,
                    upstream: upstream.normalized.clone(),
                    diagnostics,
                });
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(ProxyError::Timeout(
                    self.settings.listen_port,
                    self.settings.startup_timeout.as_secs(),
                ));
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Graceful termination with a bounded grace period, then SIGKILL.
    /// The process handle is always cleared so a later `start` is never
    /// blocked by a stale handle.
    pub async fn stop(&mut self) {
        let Some(mut proxy) = self.current.take() else {
            return;
        };
        if !matches!(proxy.child.try_wait(), Ok(None)) {
            let diag = drain_text(&proxy.diagnostics);
            if !diag.is_empty() {
                tracing::debug!("Proxy for {} already exited: {}", proxy.upstream, diag);
            }
            return;
        }
        if let Some(pid) = proxy.child.id() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
        match tokio::time::timeout(self.settings.grace_period, proxy.child.wait()).await {
            Ok(_) => tracing::info!("Resolver proxy for {} stopped", proxy.upstream),
            Err(_) => {
                tracing::warn!("Resolver proxy did not exit in time, killing");
                let _ = proxy.child.start_kill();
                let _ = proxy.child.wait().await;
            }
        }
    }
}

async fn drain_output<R: AsyncRead + Unpin>(reader: R, sink: Arc<Mutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut buf = sink.lock().unwrap();
        if buf.len() >= DIAGNOSTIC_LINES {
            buf.pop_front();
        }
        buf.push_back(line);
    }
}

fn drain_text(diagnostics: &Arc<Mutex<VecDeque<String>>>) -> String {
    let buf = diagnostics.lock().unwrap();
    buf.iter().cloned().collect::<Vec<_>>().join("\n")
}

/// Materialize the runtime configuration: point `listen_addresses` and
/// `server_names` at our values and append the stamp-encoded server
/// definition.
pub(crate) fn render_runtime_config(
    template: &str,
    server_name: &str,
    stamp: &str,
    listen: &str,
) -> String {
    let server_names_re = Regex::new(r"(?m)^\s*#?\s*server_names\s*=.*$").expect("bad regex");
    let listen_re = Regex::new(r"(?m)^\s*#?\s*listen_addresses\s*=.*$").expect("bad regex");

    let mut config = template.to_string();
    let server_line = format!("server_names = ['{}']", server_name);
    if server_names_re.is_match(&config) {
        config = server_names_re
            .replacen(&config, 1, server_line.as_str())
            .into_owned();
    } else {
        config = format!("{}\n{}", server_line, config);
    }
    let listen_line = format!("listen_addresses = ['{}']", listen);
    if listen_re.is_match(&config) {
        config = listen_re
            .replacen(&config, 1, listen_line.as_str())
            .into_owned();
    } else {
        config = format!("{}\n{}", listen_line, config);
    }
    config.push_str(&format!("\n[static.'{}']\nstamp = '{}'\n", server_name, stamp));
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_replaces_existing_lines() {
        let template = "server_names = ['cloudflare']\nlisten_addresses = ['127.0.0.1:53']\nipv6_servers = false\n";
        let out = render_runtime_config(template, "custom-doh", "sdns://AgAA", "127.0.0.1:53535");
        assert!(out.contains("server_names = ['custom-doh']"));
        assert!(out.contains("listen_addresses = ['127.0.0.1:53535']"));
        assert!(!out.contains("cloudflare"));
        assert!(out.contains("[static.'custom-doh']"));
        assert!(out.contains("stamp = 'sdns://AgAA'"));
    }

    #[test]
    fn test_render_uncomments_defaults() {
        let template = "# server_names = ['cloudflare', 'google']\nipv6_servers = false\n";
        let out = render_runtime_config(template, "custom-dot", "sdns://AwAA", "127.0.0.1:53535");
        assert!(out.contains("server_names = ['custom-dot']"));
        assert!(out.contains("listen_addresses = ['127.0.0.1:53535']"));
        assert!(!out.contains("# server_names"));
    }

    #[tokio::test]
    async fn test_start_fails_fast_without_binary() {
        let settings = ProxySettings {
            listen_addr: Ipv4Addr::LOCALHOST,
            listen_port: 53535,
            binary_path: PathBuf::from("/nonexistent/dnscrypt-proxy"),
            template_path: PathBuf::from("/nonexistent/dnscrypt-proxy.toml"),
            startup_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            grace_period: Duration::from_millis(200),
        };
        let mut supervisor = ProxySupervisor::new(settings);
        let spec = crate::dns::classify(&["https://dns.example.com/dns-query"])
            .pop()
            .unwrap();
        assert!(matches!(
            supervisor.start(&spec).await,
            Err(ProxyError::BinaryMissing(_))
        ));
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_launch_failure_reports_diagnostics() {
        // a real binary that exits immediately without ever listening
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("dnscrypt-proxy.toml");
        std::fs::write(&template, "server_names = ['cloudflare']\n").unwrap();
        let settings = ProxySettings {
            listen_addr: Ipv4Addr::LOCALHOST,
            listen_port: 53536,
            binary_path: PathBuf::from("/bin/false"),
            template_path: template,
            startup_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
            grace_period: Duration::from_millis(200),
        };
        let mut supervisor = ProxySupervisor::new(settings);
        let spec = crate::dns::classify(&["tls://dns.quad9.net"]).pop().unwrap();
        match supervisor.start(&spec).await {
            Err(ProxyError::LaunchFailed(_)) => {}
            other => panic!("expected launch failure, got {:?}", other),
        }
        assert_eq!(supervisor.state(), ProxyState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_leaves_exactly_one_live_process() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("fake-proxy");
        std::fs::write(&binary, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        let template = dir.path().join("dnscrypt-proxy.toml");
        std::fs::write(&template, "server_names = ['cloudflare']\n").unwrap();
        // the fake proxy never listens; a local listener satisfies the
        // health check instead
        let listener = std::net::TcpListener::bind("127.0.0.1:53545").unwrap();
        let settings = ProxySettings {
            listen_addr: Ipv4Addr::LOCALHOST,
            listen_port: 53545,
            binary_path: binary,
            template_path: template,
            startup_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
            grace_period: Duration::from_millis(1000),
        };
        let mut supervisor = ProxySupervisor::new(settings);
        let spec = crate::dns::classify(&["tls://dns.quad9.net"]).pop().unwrap();

        supervisor.start(&spec).await.unwrap();
        let first = supervisor.pid().expect("first process should be live");

        supervisor.start(&spec).await.unwrap();
        let second = supervisor.pid().expect("second process should be live");
        assert_ne!(first, second);
        assert!(supervisor.is_running());
        // the first process was terminated and reaped
        assert!(nix::sys::signal::kill(nix::unistd::Pid::from_raw(first as i32), None).is_err());

        supervisor.stop().await;
        assert!(!supervisor.is_running());
        drop(listener);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let settings = ProxySettings {
            listen_addr: Ipv4Addr::LOCALHOST,
            listen_port: 53537,
            binary_path: PathBuf::from("/bin/false"),
            template_path: PathBuf::from("/nonexistent"),
            startup_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            grace_period: Duration::from_millis(200),
        };
        let mut supervisor = ProxySupervisor::new(settings);
        supervisor.stop().await;
        supervisor.stop().await;
        assert!(!supervisor.is_running());
    }
}
