use crate::client::elevation::{ElevatedRunner, ServiceInstaller};
use crate::config::RawConfig;
use crate::daemon::Engine;
use crate::error::ChannelError;
use dnsctlapi::rpc::{ControlServiceClient, MAX_CODEC_FRAME_LENGTH};
use dnsctlapi::CommandResponse;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tarpc::context::Context;
use tarpc::tokio_serde::formats::Bincode;
use tarpc::tokio_util::codec::LengthDelimitedCodec;
use tokio::net::UnixStream;
use tokio::sync::Mutex;

const INSTALL_WAIT: Duration = Duration::from_secs(10);
const INSTALL_POLL: Duration = Duration::from_millis(500);

/// A request the unprivileged side wants executed with privileges.
#[derive(Debug, Clone)]
pub enum Operation {
    Apply(Vec<String>),
    Clear,
    Flush,
}

/// How an authorization attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationOutcome {
    /// The persistent engine was already reachable.
    AlreadyAuthorized,
    /// The service was installed and the engine came up.
    NewlyAuthorized,
    /// The user declined the elevation prompt.
    Denied,
}

enum ChannelState {
    Disconnected,
    Ready(ControlServiceClient),
}

/// Owns the connection to the privileged engine and the escalation
/// ladder used when it is not reachable: connect, install the system
/// service, or fall back to a one-shot elevated run.
pub struct ChannelManager {
    socket_path: PathBuf,
    config: RawConfig,
    state: Mutex<ChannelState>,
}

impl ChannelManager {
    pub fn new(socket_path: PathBuf, config: RawConfig) -> Self {
        Self {
            socket_path,
            config,
            state: Mutex::new(ChannelState::Disconnected),
        }
    }

    /// Execute one operation, escalating as needed.
    pub async fn call(&self, op: Operation) -> Result<CommandResponse, ChannelError> {
        match self.ensure_connected().await {
            Ok(client) => self.call_engine(&client, op).await,
            Err(e) => {
                tracing::debug!("Engine unreachable ({}), escalating", e);
                self.escalate_and_call(op).await
            }
        }
    }

    /// Make the privileged engine permanently available, reporting how
    /// that was achieved. No DNS state is touched.
    pub async fn ensure_authorized(&self) -> Result<EscalationOutcome, ChannelError> {
        if self.ensure_connected().await.is_ok() {
            return Ok(EscalationOutcome::AlreadyAuthorized);
        }
        match self.install_service().await {
            Ok(()) => Ok(EscalationOutcome::NewlyAuthorized),
            Err(ChannelError::AuthorizationDenied) => Ok(EscalationOutcome::Denied),
            Err(e) => Err(e),
        }
    }

    /// Resolvers the system reports active, via the engine when present
    /// and empty otherwise. Status queries never trigger escalation.
    pub async fn active_resolvers(&self) -> Option<Vec<String>> {
        match self.ensure_connected().await {
            Ok(client) => client.active_resolvers(Context::current()).await.ok(),
            Err(_) => None,
        }
    }

    pub async fn is_engine_reachable(&self) -> bool {
        self.ensure_connected().await.is_ok()
    }

    async fn ensure_connected(&self) -> Result<ControlServiceClient, ChannelError> {
        let mut state = self.state.lock().await;
        if let ChannelState::Ready(client) = &*state {
            // the cached client may be backed by a dead daemon
            if client.is_ready(Context::current()).await.is_ok() {
                return Ok(client.clone());
            }
            *state = ChannelState::Disconnected;
        }
        let client = self.connect().await?;
        *state = ChannelState::Ready(client.clone());
        Ok(client)
    }

    async fn connect(&self) -> Result<ControlServiceClient, ChannelError> {
        let conn = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| ChannelError::Unreachable(e.to_string()))?;
        let mut codec_builder = LengthDelimitedCodec::builder();
        codec_builder.max_frame_length(MAX_CODEC_FRAME_LENGTH);
        let transport = tarpc::serde_transport::new(codec_builder.new_framed(conn), Bincode::default());
        let client = ControlServiceClient::new(Default::default(), transport).spawn();
        if !client
            .is_ready(Context::current())
            .await
            .map_err(ChannelError::Transport)?
        {
            return Err(ChannelError::Unreachable("engine not ready".to_string()));
        }
        Ok(client)
    }

    async fn call_engine(
        &self,
        client: &ControlServiceClient,
        op: Operation,
    ) -> Result<CommandResponse, ChannelError> {
        let resp = match op {
            Operation::Apply(servers) => client.apply_dns(Context::current(), servers).await?,
            Operation::Clear => client.clear_dns(Context::current()).await?,
            Operation::Flush => client.flush_cache(Context::current()).await?,
        };
        Ok(resp)
    }

    async fn escalate_and_call(&self, op: Operation) -> Result<CommandResponse, ChannelError> {
        let install = self.install_service().await;
        self.resume_after_install(install, op).await
    }

    /// The one-shot fallback is attempted whenever the persistent path
    /// failed, including a denied install; its own result (success or a
    /// second denial) is what the caller sees.
    async fn resume_after_install(
        &self,
        install: Result<(), ChannelError>,
        op: Operation,
    ) -> Result<CommandResponse, ChannelError> {
        match install {
            Ok(()) => {
                let client = self.ensure_connected().await?;
                self.call_engine(&client, op).await
            }
            Err(e) => {
                tracing::warn!("Service installation failed ({}), running one-shot", e);
                self.call_direct(op).await
            }
        }
    }

    async fn install_service(&self) -> Result<(), ChannelError> {
        let installer = ServiceInstaller::new();
        installer.install()?;
        // the service manager starts the daemon asynchronously
        let deadline = tokio::time::Instant::now() + INSTALL_WAIT;
        loop {
            if self.connect().await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ChannelError::InstallFailed(
                    "service installed but engine never came up".to_string(),
                ));
            }
            tokio::time::sleep(INSTALL_POLL).await;
        }
    }

    /// One-shot path: the same engine logic runs in this process, with
    /// every external command routed through an elevation prompt. The
    /// request is validated identically to the persistent path.
    async fn call_direct(&self, op: Operation) -> Result<CommandResponse, ChannelError> {
        let runner = Arc::new(ElevatedRunner::new());
        let engine = Engine::new(runner.clone(), &self.config);
        let resp = match op {
            Operation::Apply(servers) => engine.apply(servers).await,
            Operation::Clear => engine.clear().await,
            Operation::Flush => engine.flush().await,
        };
        engine.shutdown().await;
        if runner.was_denied() {
            return Err(ChannelError::AuthorizationDenied);
        }
        Ok(resp)
    }
}

#[cfg(all(test, not(target_os = "macos")))]
mod tests {
    use super::*;

    fn manager_with_dead_socket() -> ChannelManager {
        ChannelManager::new(
            PathBuf::from("/nonexistent/dnsctl-test.sock"),
            RawConfig::default(),
        )
    }

    // The one-shot path shells out through pkexec; in a test
    // environment that either fails to spawn (collapsing into a failure
    // response) or is refused outright (a fresh denial). Both prove the
    // fallback ran; only install-stage errors would be anything else.
    fn assert_one_shot_was_attempted(result: Result<CommandResponse, ChannelError>) {
        match result {
            Ok(resp) => assert!(!resp.ok),
            Err(ChannelError::AuthorizationDenied) => {}
            Err(other) => panic!("one-shot fallback was not attempted: {}", other),
        }
    }

    #[tokio::test]
    async fn test_denied_install_still_attempts_one_shot() {
        let mgr = manager_with_dead_socket();
        let result = mgr
            .resume_after_install(Err(ChannelError::AuthorizationDenied), Operation::Flush)
            .await;
        assert_one_shot_was_attempted(result);
    }

    #[tokio::test]
    async fn test_failed_install_still_attempts_one_shot() {
        let mgr = manager_with_dead_socket();
        let result = mgr
            .resume_after_install(
                Err(ChannelError::InstallFailed("no service manager".to_string())),
                Operation::Flush,
            )
            .await;
        assert_one_shot_was_attempted(result);
    }

    #[tokio::test]
    async fn test_call_escalates_past_unreachable_socket() {
        // a dead socket must walk the whole ladder, never surface as a
        // bare transport error
        let mgr = manager_with_dead_socket();
        let result = mgr.call(Operation::Flush).await;
        assert!(!matches!(result, Err(ChannelError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_status_queries_never_escalate() {
        let mgr = manager_with_dead_socket();
        assert!(mgr.active_resolvers().await.is_none());
        assert!(!mgr.is_engine_reachable().await);
    }
}
