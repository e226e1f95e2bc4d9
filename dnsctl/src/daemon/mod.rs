mod engine;
mod rpc;

pub use engine::Engine;
pub use rpc::{UdsController, UnixListenerGuard};

use crate::config::{load_config, parse_config_path, ConfigError, RawConfig};
use crate::system::ShellRunner;
use chrono::Timelike;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::{format::Writer, time::FormatTime};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct SystemTime;

impl FormatTime for SystemTime {
    fn format_time(&self, w: &mut Writer<'_>) -> core::fmt::Result {
        let time = chrono::prelude::Local::now();
        write!(
            w,
            "{:02}:{:02}:{:02}.{:03}",
            time.hour() % 24,
            time.minute(),
            time.second(),
            time.timestamp_subsec_millis()
        )
    }
}

pub fn init_tracing() -> Result<(), ConfigError> {
    let stdout_layer = fmt::layer()
        .compact()
        .with_writer(std::io::stdout)
        .with_timer(SystemTime);
    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(
            EnvFilter::builder()
                .with_default_directive(
                    Directive::from_str("dnsctl=info")
                        .map_err(|_| ConfigError::Internal("Tracing filter"))?,
                )
                .from_env_lossy(),
        )
        .init();
    Ok(())
}

/// The privileged daemon: one engine serving RPC on a unix domain
/// socket until interrupted.
pub struct App {
    engine: Arc<Engine>,
    uds_socket: Arc<UnixListenerGuard>,
}

impl App {
    pub fn create(
        config_path: Option<PathBuf>,
        socket_path: Option<PathBuf>,
    ) -> anyhow::Result<Self> {
        init_tracing()?;
        let config = load_app_config(&config_path)?;
        let socket = socket_path.unwrap_or_else(|| config.socket_path.clone());
        let uds_socket = Arc::new(UnixListenerGuard::new(&socket)?);
        tracing::info!("Listening on {}", socket.to_string_lossy());
        let engine = Arc::new(Engine::new(Arc::new(ShellRunner), &config));
        Ok(Self { engine, uds_socket })
    }

    pub async fn serve(self) {
        let controller = UdsController::new(self.engine.clone());
        let uds_socket = self.uds_socket.clone();
        tokio::select! {
            r = controller.run(uds_socket) => {
                if let Err(e) = r {
                    tracing::error!("RPC controller exited: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
            }
        }
        self.engine.shutdown().await;
    }
}

pub fn load_app_config(explicit: &Option<PathBuf>) -> Result<RawConfig, ConfigError> {
    let path = parse_config_path(explicit)?;
    load_config(&path)
}
