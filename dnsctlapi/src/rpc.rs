use crate::CommandResponse;

pub const MAX_CODEC_FRAME_LENGTH: usize = 4 * 1024 * 1024;

#[tarpc::service]
pub trait ControlService {
    /// Liveness probe; also used by the client to distinguish a reachable
    /// engine from a stale socket file.
    async fn is_ready() -> bool;

    async fn apply_dns(servers: Vec<String>) -> CommandResponse;

    async fn clear_dns() -> CommandResponse;

    async fn flush_cache() -> CommandResponse;

    /// Active resolvers as currently observed by the system, for status display.
    async fn active_resolvers() -> Vec<String>;
}
