mod request;

use crate::ProgramArgs;
use anyhow::anyhow;
use clap::{Args, CommandFactory, Subcommand, ValueHint};
use std::path::PathBuf;
use std::process::exit;

#[derive(Debug, Args)]
pub(crate) struct DaemonOptions {
    /// Path of configuration. Default to $HOME/.config/dnsctl/config.yml
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub(crate) struct ApplyOptions {
    /// DNS servers: IPs, https:// (DoH) or tls:// (DoT) entries
    #[clap(value_hint = ValueHint::Other)]
    pub servers: Vec<String>,
    /// Use a built-in preset instead of explicit servers
    #[arg(short, long)]
    pub preset: Option<String>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
pub(crate) enum PromptOptions {
    Bash,
    Zsh,
    Fish,
}

#[derive(Debug, Subcommand)]
pub(crate) enum SubCommand {
    /// Run the privileged engine in the foreground
    Daemon(DaemonOptions),
    /// Apply DNS servers to all network services
    Apply(ApplyOptions),
    /// Restore default DNS on all network services
    Clear,
    /// Flush the system resolution cache
    Flush,
    /// Show engine state and active resolvers
    Status,
    /// List built-in resolver presets
    Presets,
    /// Install the system service without changing DNS
    Authorize,
    /// Execute a dnsctl:// invocation URL
    Invoke {
        #[clap(value_hint = ValueHint::Url)]
        url: String,
    },
    /// Generate auto-completion profiles for shells
    #[command(subcommand)]
    Prompt(PromptOptions),
}

/// `dnsctl://apply?servers=1.1.1.1,9.9.9.9` and `dnsctl://disable`, the
/// surface the desktop frontends use for one-click switching.
pub(crate) fn parse_invocation(raw: &str) -> anyhow::Result<SubCommand> {
    let url = url::Url::parse(raw).map_err(|e| anyhow!("Invalid invocation URL: {}", e))?;
    if url.scheme() != "dnsctl" {
        return Err(anyhow!("Unsupported URL scheme: {}", url.scheme()));
    }
    match url.host_str() {
        Some("apply") => {
            let servers: Vec<String> = url
                .query_pairs()
                .find(|(k, _)| k == "servers")
                .map(|(_, v)| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default();
            if servers.is_empty() {
                return Err(anyhow!("Invocation URL carries no servers"));
            }
            Ok(SubCommand::Apply(ApplyOptions {
                servers,
                preset: None,
            }))
        }
        Some("disable") => Ok(SubCommand::Clear),
        Some("flush") => Ok(SubCommand::Flush),
        other => Err(anyhow!(
            "Unknown invocation action: {}",
            other.unwrap_or("(none)")
        )),
    }
}

pub(crate) async fn controller_main(args: ProgramArgs) -> ! {
    let cmd = match args.cmd {
        SubCommand::Prompt(shell) => {
            let generator = match shell {
                PromptOptions::Bash => clap_complete::Shell::Bash,
                PromptOptions::Zsh => clap_complete::Shell::Zsh,
                PromptOptions::Fish => clap_complete::Shell::Fish,
            };
            let mut command = ProgramArgs::command();
            let bin_name = command.get_name().to_string();
            clap_complete::generate(generator, &mut command, bin_name, &mut std::io::stdout());
            exit(0)
        }
        SubCommand::Invoke { url } => match parse_invocation(&url) {
            Ok(cmd) => cmd,
            Err(err) => {
                eprintln!("{}", err);
                exit(-1)
            }
        },
        cmd => cmd,
    };

    let config = match crate::daemon::load_app_config(&None) {
        Ok(c) => c,
        Err(err) => {
            eprintln!("Failed to load config: {}", err);
            exit(-1)
        }
    };
    let socket_path = args
        .socket
        .clone()
        .unwrap_or_else(|| config.socket_path.clone());
    let requester = request::Requester::new(socket_path, config);
    let result = match cmd {
        SubCommand::Apply(opt) => requester.apply(opt.servers, opt.preset).await,
        SubCommand::Clear => requester.clear().await,
        SubCommand::Flush => requester.flush().await,
        SubCommand::Status => requester.status().await,
        SubCommand::Presets => requester.list_presets(),
        SubCommand::Authorize => requester.authorize().await,
        SubCommand::Daemon(_) | SubCommand::Prompt(_) | SubCommand::Invoke { .. } => {
            unreachable!()
        }
    };
    match result {
        Ok(_) => exit(0),
        Err(err) => {
            eprintln!("{}", err);
            exit(-1)
        }
    }
}
