use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use kaet::{
    config::Config,
    irc::{self, Connection, Outcome},
    CommandEngine, Dispatcher, HelixClient,
};

#[derive(Parser, Debug)]
#[command(name = "kaet")]
#[command(about = "Twitchチャンネル用チャットボット")]
#[command(version)]
struct Args {
    /// 設定ファイルパス
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// データ（コマンド・スクリプト・引用）の保存先
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// 詳細ログを表示 (INFO level)
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // トレーシング初期化（デフォルトはWARN、--verboseでINFO）
    let args = Args::parse();
    let default_level = if args.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::load_default().unwrap_or_else(|e| {
            tracing::warn!("Failed to load default config: {}, using defaults", e);
            Config::default()
        }),
    };

    // 環境変数とコマンドライン引数で上書き
    config.apply_env();
    if let Some(dir) = &args.data_dir {
        config.storage.data_dir = dir.display().to_string();
    }
    config.validate()?;

    tracing::info!("kaet v{} starting...", kaet::VERSION);
    tracing::info!("Channel: #{}", config.bot.channel);
    tracing::info!("Bot user: {}", config.bot.user);
    tracing::info!("Data directory: {}", config.storage.data_dir);
    tracing::info!("Password: {}", set_or_unset(&config.irc.password));
    tracing::info!("Client ID: {}", set_or_unset(&config.twitch.client_id));
    tracing::info!("API token: {}", set_or_unset(&config.twitch.token));

    let facts = Arc::new(HelixClient::from_config(&config.twitch));
    let engine = CommandEngine::bootstrap(&config, facts).context("Failed to start command engine")?;
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(engine)).context("Failed to create dispatcher")?);

    let connection = Connection::from_config(&config);
    match irc::run(&connection, dispatcher).await? {
        Outcome::Reconnect => {
            tracing::warn!("Server requested reconnect; exiting with code {}", irc::RECONNECT_EXIT_CODE);
            std::process::exit(irc::RECONNECT_EXIT_CODE);
        }
        Outcome::Closed => anyhow::bail!("Connection to {} closed", connection.server),
    }
}

fn set_or_unset(value: &Option<String>) -> &'static str {
    if value.as_deref().is_some_and(|v| !v.is_empty()) {
        "set"
    } else {
        "unset"
    }
}
