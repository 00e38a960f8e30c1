//! `roostd`, the chat server daemon.
//!
//! Loads configuration (file + `ROOST_*` env overrides + CLI flags), starts
//! the composition root, and runs until SIGTERM/SIGINT. Initialization
//! failures exit nonzero with a single machine-parseable
//! `init_error: <reason>` line on stderr.

use {
    clap::Parser,
    tracing::{error, info},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    roost_config::{ConfigWatcher, SharedConfig},
    roost_server::ServerManager,
};

#[derive(Parser)]
#[command(name = "roostd", about = "Roost chat server backbone")]
struct Cli {
    /// Path to a config file (otherwise discovered from standard locations).
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Port to listen on (overrides config value).
    #[arg(long)]
    port: Option<u16>,

    /// Address to bind to (overrides config value).
    #[arg(long)]
    bind: Option<String>,

    /// Disable TLS even if the config enables it.
    #[arg(long, default_value_t = false)]
    no_tls: bool,

    /// Log level override (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Print effective configuration and exit.
    #[arg(long, default_value_t = false)]
    check_config: bool,
}

fn init_telemetry(cli: &Cli, config: &roost_config::RoostConfig) {
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.json_format {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(config.logging.console_output),
            )
            .init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Load config: explicit path, or discovery. Env overrides apply in the
    // loader; CLI flags win over both.
    let mut config = match cli.config {
        Some(ref path) => match roost_config::load_config(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("init_error: {e:#}");
                std::process::exit(1);
            },
        },
        None => roost_config::discover_and_load(),
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref bind) = cli.bind {
        config.server.bind_address = bind.clone();
    }
    if cli.no_tls {
        config.server.use_tls = false;
    }

    init_telemetry(&cli, &config);

    if cli.check_config {
        match serde_json::to_string_pretty(&config) {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => {
                eprintln!("init_error: {e}");
                std::process::exit(1);
            },
        }
        return;
    }

    info!(version = env!("CARGO_PKG_VERSION"), "roostd starting");

    let shared = SharedConfig::new(config);

    // Hot reload: watch whichever file the config came from.
    let watch_path = cli
        .config
        .clone()
        .or_else(roost_config::find_config_file);
    let _watcher = match watch_path {
        Some(path) => match ConfigWatcher::start(&path, shared.clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                error!(error = %e, "config watcher unavailable, continuing without hot reload");
                None
            },
        },
        None => None,
    };

    let manager = match ServerManager::build(shared).await {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("init_error: {e:#}");
            std::process::exit(1);
        },
    };
    if let Err(e) = manager.start().await {
        eprintln!("init_error: {e:#}");
        std::process::exit(1);
    }

    wait_for_shutdown_signal().await;

    manager.stop().await;
    info!("bye");
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            },
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = term.recv() => info!("SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received");
    }
}
