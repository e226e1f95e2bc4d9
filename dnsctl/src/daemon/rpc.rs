use crate::daemon::engine::Engine;
use dnsctlapi::rpc::{ControlService, MAX_CODEC_FRAME_LENGTH};
use dnsctlapi::CommandResponse;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tarpc::context::Context;
use tarpc::server::{BaseChannel, Channel};
use tarpc::tokio_serde::formats::Bincode;
use tarpc::tokio_util::codec::LengthDelimitedCodec;
use tokio::net::UnixListener;

pub struct UnixListenerGuard {
    path: PathBuf,
    listener: Option<UnixListener>,
}

impl UnixListenerGuard {
    pub fn new<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        remove_stale_socket(&path)?;
        let listener = UnixListener::bind(&path)?;
        // A connect() needs the write bit. Under launchd/systemd there
        // is no invoking user to chown to, so the mode must open the
        // socket to unprivileged clients on every start path.
        let mut perms = std::fs::metadata(&path)?.permissions();
        perms.set_mode(0o666);
        std::fs::set_permissions(&path, perms)?;
        if let Some((uid, gid)) = invoking_user() {
            nix::unistd::chown(&path, Some(uid), Some(gid))?;
        }
        Ok(Self {
            path,
            listener: Some(listener),
        })
    }

    pub fn get_listener(&self) -> &UnixListener {
        self.listener.as_ref().unwrap()
    }
}

impl Drop for UnixListenerGuard {
    fn drop(&mut self) {
        self.listener = None;
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::error!("Error when removing unix domain socket: {}", e)
        }
    }
}

/// A leftover socket file from a crashed daemon would make `bind` fail;
/// remove it only after confirming nothing is accepting on it.
fn remove_stale_socket(path: &Path) -> anyhow::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if UnixStream::connect(path).is_ok() {
        anyhow::bail!(
            "Socket {} is in use; another instance is running",
            path.to_string_lossy()
        );
    }
    tracing::warn!("Removing stale socket {}", path.to_string_lossy());
    std::fs::remove_file(path)?;
    Ok(())
}

fn invoking_user() -> Option<(nix::unistd::Uid, nix::unistd::Gid)> {
    let name = std::env::var("SUDO_USER").ok()?;
    match nix::unistd::User::from_name(&name) {
        Ok(Some(user)) => Some((user.uid, user.gid)),
        _ => None,
    }
}

#[derive(Clone)]
pub struct UdsController {
    engine: Arc<Engine>,
}

impl UdsController {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub async fn run(self, listener: Arc<UnixListenerGuard>) -> io::Result<()> {
        let mut codec_builder = LengthDelimitedCodec::builder();
        codec_builder.max_frame_length(MAX_CODEC_FRAME_LENGTH);
        loop {
            let (conn, _addr) = listener.get_listener().accept().await?;
            let framed = codec_builder.new_framed(conn);
            let transport = tarpc::serde_transport::new(framed, Bincode::default());
            tokio::spawn(
                BaseChannel::with_defaults(transport).execute(
                    UdsRpcServer {
                        engine: self.engine.clone(),
                    }
                    .serve(),
                ),
            );
        }
    }
}

#[derive(Clone)]
struct UdsRpcServer {
    engine: Arc<Engine>,
}

#[tarpc::server]
impl ControlService for UdsRpcServer {
    async fn is_ready(self, _ctx: Context) -> bool {
        true
    }

    async fn apply_dns(self, _ctx: Context, servers: Vec<String>) -> CommandResponse {
        self.engine.apply(servers).await
    }

    async fn clear_dns(self, _ctx: Context) -> CommandResponse {
        self.engine.clear().await
    }

    async fn flush_cache(self, _ctx: Context) -> CommandResponse {
        self.engine.flush().await
    }

    async fn active_resolvers(self, _ctx: Context) -> Vec<String> {
        self.engine.active_resolvers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_socket_connectable_without_invoking_user() {
        // a service-manager start has no SUDO_USER; the unprivileged
        // client must still get the write bit on the socket
        std::env::remove_var("SUDO_USER");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dnsctl-test.sock");
        let guard = UnixListenerGuard::new(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o666, 0o666, "socket mode {:o}", mode);
        assert!(UnixStream::connect(&path).is_ok());
        drop(guard);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_stale_socket_is_rebound() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dnsctl-stale.sock");
        {
            let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
            drop(listener);
        }
        assert!(path.exists());
        std::env::remove_var("SUDO_USER");
        let _guard = UnixListenerGuard::new(&path).unwrap();
        assert!(UnixStream::connect(&path).is_ok());
    }
}
