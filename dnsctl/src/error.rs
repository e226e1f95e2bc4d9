use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("No valid DNS servers after normalization")]
    NoValidServers,
    #[error("{0}")]
    Backend(#[from] BackendError),
    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("No network services found")]
    NoNetworkServices,
    #[error("Failed for {service}: {output}")]
    ServiceFailed { service: String, output: String },
    #[error("Flush error: {0}")]
    Flush(String),
    #[error("Failed to run {0}: {1}")]
    Command(&'static str, #[source] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Profile installer rejected payload: {0}")]
    InstallRejected(String),
    #[error("Failed to run {0}: {1}")]
    Command(&'static str, #[source] std::io::Error),
    #[error("Failed to write profile payload: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Proxy binary not found at {0}")]
    BinaryMissing(PathBuf),
    #[error("Proxy config template not found at {0}")]
    TemplateMissing(PathBuf),
    #[error("Unsupported proxy upstream: {0}")]
    UnsupportedUpstream(String),
    #[error("Stamp field exceeds 127 bytes: {0}")]
    StampField(String),
    #[error("Proxy crashed during startup: {0}")]
    LaunchFailed(String),
    #[error("Proxy started but port {0} did not open within {1}s")]
    Timeout(u16, u64),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Privileged engine unreachable: {0}")]
    Unreachable(String),
    #[error("Authorization denied by user")]
    AuthorizationDenied,
    #[error("Service installation failed: {0}")]
    InstallFailed(String),
    #[error("Transport error: {0}")]
    Transport(#[from] tarpc::client::RpcError),
}
