use crate::client::{ChannelManager, EscalationOutcome, Operation};
use crate::config::RawConfig;
use crate::dns::{classify, find_preset};
use crate::system::{ShellRunner, SystemDnsBackend};
use anyhow::{anyhow, Result};
use colored::Colorize;
use dnsctlapi::CommandResponse;
use std::path::PathBuf;
use std::sync::Arc;

pub struct Requester {
    channel: ChannelManager,
}

impl Requester {
    pub fn new(socket_path: PathBuf, config: RawConfig) -> Self {
        Self {
            channel: ChannelManager::new(socket_path, config),
        }
    }

    pub async fn apply(&self, servers: Vec<String>, preset: Option<String>) -> Result<()> {
        let servers = match preset {
            Some(name) => match find_preset(&name) {
                Some(p) => p.servers.iter().map(|s| s.to_string()).collect(),
                None => return Err(anyhow!("Unknown preset: {}", name)),
            },
            None => servers,
        };
        if classify(&servers).is_empty() {
            return Err(anyhow!("No valid DNS servers after normalization"));
        }
        let resp = self.channel.call(Operation::Apply(servers)).await?;
        print_response(resp)
    }

    pub async fn clear(&self) -> Result<()> {
        let resp = self.channel.call(Operation::Clear).await?;
        print_response(resp)
    }

    pub async fn flush(&self) -> Result<()> {
        let resp = self.channel.call(Operation::Flush).await?;
        print_response(resp)
    }

    pub async fn authorize(&self) -> Result<()> {
        match self.channel.ensure_authorized().await? {
            EscalationOutcome::AlreadyAuthorized => {
                println!("{}", "Engine already authorized".green())
            }
            EscalationOutcome::NewlyAuthorized => {
                println!("{}", "Service installed and running".green())
            }
            EscalationOutcome::Denied => {
                println!("{}", "Authorization denied by user".red());
                return Err(anyhow!("Authorization denied"));
            }
        }
        Ok(())
    }

    /// Show engine reachability and the resolvers the system considers
    /// active. Works without the engine by reading system state
    /// directly; never triggers an elevation prompt.
    pub async fn status(&self) -> Result<()> {
        let resolvers = match self.channel.active_resolvers().await {
            Some(resolvers) => {
                println!("Engine: {}", "running".green());
                resolvers
            }
            None => {
                println!("Engine: {}", "not running".yellow());
                SystemDnsBackend::new(Arc::new(ShellRunner))
                    .active_resolvers()
                    .unwrap_or_default()
            }
        };
        if resolvers.is_empty() {
            println!("Active resolvers: {}", "none detected".italic());
        } else {
            println!("Active resolvers:");
            for r in resolvers {
                println!("  - {}", r.cyan());
            }
        }
        Ok(())
    }

    pub fn list_presets(&self) -> Result<()> {
        for preset in crate::dns::builtin_presets() {
            println!(
                "{}: {}",
                preset.name.bold().green(),
                preset.servers.join(", ")
            );
        }
        Ok(())
    }
}

fn print_response(resp: CommandResponse) -> Result<()> {
    if resp.ok {
        println!("{}", resp.message.green());
        Ok(())
    } else {
        println!("{}", resp.message.red());
        Err(anyhow!("Operation failed"))
    }
}
