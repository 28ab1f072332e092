//! Command line interface for shunt.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// shunt - per-app capture into an upstream HTTP proxy
#[derive(Parser, Debug)]
#[command(
    name = "shunt",
    author,
    version,
    about = "Route selected apps through an upstream HTTP proxy, with authentication",
    long_about = r#"
shunt captures the traffic of selected apps (local users on Linux) on a
virtual interface and hands it to a packet translation engine aimed at an
upstream HTTP proxy. When the proxy needs credentials, a local relay on
127.0.0.1 injects Proxy-Authorization into every CONNECT.

QUICK START:
  Capture:  shunt run --proxy proxy.example.com:3128 --app alice
  Auth:     shunt run --proxy proxy:3128 --user alice --password secret --app bob
  Relay:    shunt relay --upstream proxy:3128 --user alice --password secret
"#
)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    pub log_level: String,

    /// Log format
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a capture session and run until interrupted
    Run(RunArgs),

    /// Run only the authenticating relay
    Relay(RelayArgs),

    /// Manage saved proxy servers
    Profiles(ProfilesArgs),

    /// Show example configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

/// Proxy credentials shared by `run` and `relay`
#[derive(Args, Debug, Clone, Default)]
pub struct CredentialArgs {
    /// Proxy username
    #[arg(short, long, env = "SHUNT_PROXY_USER")]
    pub user: Option<String>,

    /// Proxy password
    #[arg(short, long, env = "SHUNT_PROXY_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

/// Run command arguments
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Upstream HTTP proxy (host:port)
    #[arg(long)]
    pub proxy: Option<String>,

    #[command(flatten)]
    pub credentials: CredentialArgs,

    /// App to capture, a user name or uid (can be specified multiple times)
    #[arg(short, long = "app")]
    pub apps: Vec<String>,

    /// Use a saved proxy server (id or name) instead of --proxy
    #[arg(long, conflicts_with = "proxy")]
    pub profile: Option<String>,

    /// Translator program overriding the configured engine
    #[arg(long)]
    pub engine: Option<PathBuf>,

    /// Local relay port
    #[arg(long)]
    pub relay_port: Option<u16>,

    /// TUN device name
    #[arg(long)]
    pub device: Option<String>,
}

/// Relay command arguments
#[derive(Args, Debug)]
pub struct RelayArgs {
    /// Upstream HTTP proxy (host:port)
    #[arg(long)]
    pub upstream: String,

    #[command(flatten)]
    pub credentials: CredentialArgs,

    /// Local port on 127.0.0.1
    #[arg(long)]
    pub port: Option<u16>,

    /// Print relay statistics every interval (seconds, 0 = never)
    #[arg(long, default_value = "0")]
    pub stats_interval: u64,
}

/// Profile management arguments
#[derive(Args, Debug)]
pub struct ProfilesArgs {
    /// Profiles file path
    #[arg(long)]
    pub file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: ProfileCommands,
}

/// Profile subcommands
#[derive(Subcommand, Debug)]
pub enum ProfileCommands {
    /// List saved servers
    List,
    /// Add a server
    Add {
        /// Display name
        name: String,
        /// Proxy address (host:port)
        address: String,
        /// Proxy protocol
        #[arg(long, default_value = "http")]
        kind: ProfileKind,
        #[command(flatten)]
        credentials: CredentialArgs,
        /// Make it the active server
        #[arg(long)]
        activate: bool,
    },
    /// Remove a server
    Remove {
        /// Server id or name
        id: String,
    },
    /// Select the active server
    Activate {
        /// Server id or name
        id: String,
    },
    /// Clear the active server
    Deactivate,
    /// Enable or disable a server
    Toggle {
        /// Server id or name
        id: String,
    },
    /// Replace the global app list
    Apps {
        /// Apps to capture by default
        apps: Vec<String>,
    },
}

/// Config command arguments
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Output path
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Print the default config file location and exit
    #[arg(long)]
    pub path: bool,
}

/// Completions command arguments
#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: Shell,
}

/// Log format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
        }
    }
}

/// Saved server protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProfileKind {
    Http,
    Socks5,
}

impl From<ProfileKind> for crate::config::ProxyKind {
    fn from(kind: ProfileKind) -> Self {
        match kind {
            ProfileKind::Http => Self::Http,
            ProfileKind::Socks5 => Self::Socks5,
        }
    }
}

/// Shell for completions
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
}

impl From<Shell> for clap_complete::Shell {
    fn from(shell: Shell) -> Self {
        match shell {
            Shell::Bash => Self::Bash,
            Shell::Zsh => Self::Zsh,
            Shell::Fish => Self::Fish,
            Shell::PowerShell => Self::PowerShell,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from([
            "shunt", "run", "--proxy", "proxy:3128", "--user", "alice", "--password", "secret",
            "--app", "bob", "--app", "1001",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.proxy.as_deref(), Some("proxy:3128"));
        assert_eq!(args.credentials.user.as_deref(), Some("alice"));
        assert_eq!(args.apps, vec!["bob", "1001"]);
    }

    #[test]
    fn test_profile_conflicts_with_proxy() {
        let result = Cli::try_parse_from([
            "shunt", "run", "--proxy", "p:1", "--profile", "office",
        ]);
        assert!(result.is_err());
    }
}
