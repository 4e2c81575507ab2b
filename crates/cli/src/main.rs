mod assistant_commands;
mod callback_server;
mod config_commands;
mod echo;
mod link_commands;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "feedlink", about = "feedlink: messaging feeds for automation engines")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Custom config directory (overrides default ~/.config/feedlink/).
    #[arg(long, global = true, env = "FEEDLINK_CONFIG_DIR")]
    config_dir: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the manager and bind configured engines (default).
    Run,
    /// Link a messaging account through the authorization handshake.
    Link {
        /// Print the authorization link instead of opening a browser.
        #[arg(long)]
        no_browser: bool,
    },
    /// Show whether an account is linked and which engines are configured.
    Status,
    /// Forget the linked account and clear stored credentials.
    Unlink,
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "feedlink starting");

    if let Some(ref dir) = cli.config_dir {
        feedlink_config::set_config_dir(dir.clone());
    }

    match cli.command {
        None | Some(Commands::Run) => assistant_commands::run().await,
        Some(Commands::Link { no_browser }) => link_commands::link(no_browser).await,
        Some(Commands::Status) => assistant_commands::status(),
        Some(Commands::Unlink) => assistant_commands::unlink().await,
        Some(Commands::Config { action }) => config_commands::handle_config(action),
    }
}
