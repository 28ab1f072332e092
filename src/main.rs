//! shunt CLI - per-app capture into an upstream HTTP proxy.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use tokio::sync::broadcast::error::RecvError;

use shunt::cli::*;
use shunt::config::{init_logging, Config, LoggingConfig, ProfileStore, ProxyProfile, ProxyProfiles};
use shunt::engine::CommandEngine;
use shunt::error::{Error, Result};
use shunt::proxy::AuthRelay;
use shunt::signals::{Signal, SignalHandler};
use shunt::tun::{LinuxTunProvider, SessionEvent, TunnelManager};
use shunt::types::{AppId, Credentials, ProxyTarget, SessionConfig, SessionReport};
use shunt::VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().or_else(|| {
        let path = Config::default_path();
        path.exists().then_some(path)
    });
    let config = match &config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let log_config = LoggingConfig {
        level: cli.log_level.clone(),
        format: cli.log_format.as_str().to_string(),
        color: !cli.no_color && config.logging.color,
        file: config.logging.file.clone(),
    };
    init_logging(&log_config)?;

    if cli.no_color {
        colored::control::set_override(false);
    }

    match cli.command {
        Commands::Run(args) => run_session(args, config, config_path).await,
        Commands::Relay(args) => run_relay(args, config).await,
        Commands::Profiles(args) => run_profiles(args),
        Commands::Config(args) => run_config(args),
        Commands::Completions(args) => run_completions(args),
    }
}

fn print_banner(title: &str) {
    println!("{}", "╔══════════════════════════════════════════╗".bright_cyan());
    println!("{}", format!("║     {title:<37}║").bright_cyan());
    println!("{}", format!("║     Version {VERSION:<29}║").bright_cyan());
    println!("{}", "╚══════════════════════════════════════════╝".bright_cyan());
    println!();
}

fn credentials_from(args: &CredentialArgs) -> Credentials {
    Credentials::new(
        args.user.clone().unwrap_or_default(),
        args.password.clone().unwrap_or_default(),
    )
}

fn parse_target(s: &str) -> Result<ProxyTarget> {
    ProxyTarget::parse(s)
        .ok_or_else(|| Error::InvalidConfig(format!("Invalid proxy address (expected host:port): {s}")))
}

/// Build the session from flags, a saved profile, or the config file, in that order.
fn build_session(args: &RunArgs, config: &Config) -> Result<SessionConfig> {
    let mut store = ProfileStore::new(ProfileStore::default_path());
    let profiles = store.load();

    let apps: Vec<AppId> = if !args.apps.is_empty() {
        args.apps.iter().map(|s| AppId::from(s.as_str())).collect()
    } else if !profiles.global_app_list.is_empty() && config.proxy.apps.is_empty() {
        profiles.global_apps().collect()
    } else {
        config.proxy.apps.iter().map(|s| AppId::from(s.as_str())).collect()
    };

    if let Some(proxy) = &args.proxy {
        let credentials = credentials_from(&args.credentials);
        return Ok(SessionConfig::new(parse_target(proxy)?, credentials, apps));
    }

    if let Some(key) = &args.profile {
        let profile = profiles
            .find(key)
            .ok_or_else(|| Error::InvalidConfig(format!("No saved server named {key}")))?;
        return profile.session(apps);
    }

    if let Some(session) = config.proxy.session() {
        let mut session = session.with_apps(apps);
        if args.credentials.user.is_some() || args.credentials.password.is_some() {
            session.credentials = credentials_from(&args.credentials);
        }
        return Ok(session);
    }

    if let Some(profile) = profiles.active_server() {
        return profile.session(apps);
    }

    Err(Error::InvalidConfig(
        "No proxy configured. Use --proxy, --profile, or the [proxy] config section".into(),
    ))
}

fn print_report(report: &SessionReport, manager: &TunnelManager) {
    println!("{} {}", "✓".green(), report.status.message());
    for app in &report.apps {
        println!("  {} {} ({})", "●".green(), app.display_name, app.id);
    }
    for id in &report.skipped {
        println!("  {} {} {}", "●".yellow(), id, "(not found, skipped)".dimmed());
    }
    println!();
    println!("{}", manager.describe().bright_white());
    println!();
    println!("Press {} to stop", "Ctrl+C".bright_white());
}

/// Run a capture session until interrupted
async fn run_session(args: RunArgs, mut config: Config, config_path: Option<PathBuf>) -> Result<()> {
    print_banner("SHUNT");

    if !shunt::tun::check_privileges() {
        println!("{} Creating interfaces requires elevated privileges.", "⚠".yellow());
        println!("  Run with {} or grant CAP_NET_ADMIN:", "sudo".bright_white());
        println!("    sudo setcap cap_net_admin+ep $(which shunt)");
        println!();
    }

    if let Some(program) = &args.engine {
        config.engine.program = Some(program.clone());
    }
    if let Some(port) = args.relay_port {
        config.relay.port = port;
    }
    if let Some(device) = &args.device {
        config.interface.device_name = device.clone();
    }

    let session = build_session(&args, &config)?;

    let engine = CommandEngine::new(config.engine.clone());
    let provider = LinuxTunProvider::new(config.interface.clone());
    let manager = TunnelManager::new(Box::new(engine), Arc::new(provider), config.relay.clone())
        .with_interface_config(config.interface.clone());

    let signals = SignalHandler::new();
    let mut signal_rx = signals.subscribe();
    let mut events = manager.subscribe();
    {
        let signals = signals.clone();
        tokio::spawn(async move { signals.listen().await });
    }

    println!("{} Proxy:  {}", "→".cyan(), session.proxy);
    println!(
        "{} Auth:   {}",
        "→".cyan(),
        if session.has_credentials() { "relay on 127.0.0.1".green() } else { "none".dimmed() }
    );
    println!();

    let report = match manager.start_session(session).await {
        Ok(report) => report,
        Err(e) => {
            let status = e.status();
            println!("{} {}: {}", "✗".red(), status.message(), e);
            manager.shutdown().await;
            std::process::exit(status.exit_code());
        }
    };
    print_report(&report, &manager);

    loop {
        tokio::select! {
            signal = signal_rx.recv() => match signal {
                Ok(Signal::Hangup) => {
                    if let Err(e) = restart_session(&args, config_path.as_deref(), &manager).await {
                        println!("{} Restart failed: {}", "✗".red(), e);
                        break;
                    }
                }
                Ok(_) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(_)) => {}
            },
            event = events.recv() => match event {
                Ok(SessionEvent::EngineExited(reason)) => {
                    println!("{} Engine exited: {}", "✗".red(), reason);
                    break;
                }
                Ok(SessionEvent::EngineError { code, message }) => {
                    println!("{} Engine error {}: {}", "⚠".yellow(), code, message);
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    println!();
    println!("{} Stopping...", "→".cyan());
    manager.shutdown().await;
    println!("{} Stopped", "✓".green());

    Ok(())
}

/// SIGHUP: reload the config file and restart with the resulting session.
async fn restart_session(args: &RunArgs, config_path: Option<&Path>, manager: &TunnelManager) -> Result<()> {
    let config = match config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let session = build_session(args, &config)?;
    let report = manager.start_session(session).await?;
    print_report(&report, manager);
    Ok(())
}

/// Run only the authenticating relay
async fn run_relay(args: RelayArgs, config: Config) -> Result<()> {
    print_banner("SHUNT RELAY");

    let upstream = parse_target(&args.upstream)?;
    let credentials = credentials_from(&args.credentials);
    if !credentials.is_complete() {
        println!("{} No complete credentials given; requests are forwarded without auth.", "⚠".yellow());
    }

    let port = args.port.unwrap_or(config.relay.port);
    let mut relay = AuthRelay::new(config.relay.clone());
    let local = match relay.start(upstream.clone(), &credentials, port).await {
        Ok(addr) => addr,
        Err(e) => {
            let status = e.status();
            println!("{} {}: {}", "✗".red(), status.message(), e);
            std::process::exit(status.exit_code());
        }
    };

    println!("{} Listening on {}", "✓".green(), local.to_string().bright_white());
    println!("{} Upstream     {}", "→".cyan(), upstream);
    println!();
    println!("Press {} to stop", "Ctrl+C".bright_white());

    let signals = SignalHandler::new();
    let mut interval = (args.stats_interval > 0)
        .then(|| tokio::time::interval(Duration::from_secs(args.stats_interval)));

    let listen = signals.listen();
    tokio::pin!(listen);
    loop {
        tokio::select! {
            () = &mut listen => break,
            _ = async {
                match interval.as_mut() {
                    Some(interval) => interval.tick().await,
                    None => std::future::pending().await,
                }
            } => {
                let stats = relay.stats();
                println!(
                    "  {} active {}  accepted {}  established {}  rejected {}  failed {}  up {}  down {}",
                    "●".cyan(),
                    stats.active,
                    stats.accepted,
                    stats.established,
                    stats.rejected,
                    stats.failed,
                    stats.bytes_to_upstream,
                    stats.bytes_to_client,
                );
            }
        }
    }

    relay.stop().await;
    println!("{} Relay stopped", "✓".green());
    Ok(())
}

/// Manage saved proxy servers
fn run_profiles(args: ProfilesArgs) -> Result<()> {
    let mut store = ProfileStore::new(args.file.unwrap_or_else(ProfileStore::default_path));

    let resolve = |profiles: &ProxyProfiles, key: &str| -> Result<String> {
        profiles
            .find(key)
            .map(|p| p.id.clone())
            .ok_or_else(|| Error::InvalidConfig(format!("No saved server named {key}")))
    };

    let profiles = match args.command {
        ProfileCommands::List => store.load(),
        ProfileCommands::Add {
            name,
            address,
            kind,
            credentials,
            activate,
        } => {
            let target = parse_target(&address)?;
            let profile = ProxyProfile::new(name, target.host, target.port, kind.into())
                .with_credentials(credentials_from(&credentials));
            let id = profile.id.clone();
            let profiles = store.add_server(profile)?;
            println!("{} Added {}", "✓".green(), id);
            if activate {
                store.set_active_server(Some(id))?
            } else {
                profiles
            }
        }
        ProfileCommands::Remove { id } => {
            let id = resolve(&store.load(), &id)?;
            store.delete_server(&id)?
        }
        ProfileCommands::Activate { id } => {
            let id = resolve(&store.load(), &id)?;
            store.set_active_server(Some(id))?
        }
        ProfileCommands::Deactivate => store.set_active_server(None)?,
        ProfileCommands::Toggle { id } => {
            let id = resolve(&store.load(), &id)?;
            store.toggle_server_enabled(&id)?
        }
        ProfileCommands::Apps { apps } => store.update_global_app_list(apps)?,
    };

    print_profiles(&profiles, store.path());
    Ok(())
}

fn print_profiles(profiles: &ProxyProfiles, path: &Path) {
    println!("{} {}", "Profiles:".bright_white().bold(), path.display().to_string().dimmed());
    if profiles.servers.is_empty() {
        println!("  {}", "(none)".dimmed());
    }
    for server in &profiles.servers {
        let active = profiles.active_server_id.as_deref() == Some(server.id.as_str());
        let marker = match (active, server.enabled) {
            (true, true) => "●".green(),
            (_, true) => "○".normal(),
            (_, false) => "○".dimmed(),
        };
        println!(
            "  {} {:<16} {} {}",
            marker,
            server.name,
            server.display_info(),
            server.id.dimmed()
        );
    }
    if !profiles.global_app_list.is_empty() {
        println!("{} {}", "Apps:".bright_white().bold(), profiles.global_app_list.join(", "));
    }
}

/// Generate shell completions
fn run_completions(args: CompletionsArgs) -> Result<()> {
    use clap::CommandFactory;
    use clap_complete::generate;

    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(clap_complete::Shell::from(args.shell), &mut cmd, name, &mut std::io::stdout());

    Ok(())
}

/// Show example configuration
fn run_config(args: ConfigArgs) -> Result<()> {
    if args.path {
        println!("{}", Config::default_path().display());
        return Ok(());
    }

    let output = toml::to_string_pretty(&Config::example())
        .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

    if let Some(ref path) = args.output {
        std::fs::write(path, &output)?;
        println!("{} Configuration written to {}", "✓".green(), path.display());
    } else {
        println!("{output}");
    }

    Ok(())
}
