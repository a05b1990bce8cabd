//! 設定ファイル管理モジュール
//!
//! default.tomlから設定を読み込み、環境変数で上書きした上で
//! 型安全な設定構造体を提供します。

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// アプリケーション全体の設定
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// IRC接続設定
    #[serde(default)]
    pub irc: IrcConfig,
    /// ボット設定
    #[serde(default)]
    pub bot: BotConfig,
    /// 永続ストア設定
    #[serde(default)]
    pub storage: StorageConfig,
    /// スクリプト実行設定
    #[serde(default)]
    pub script: ScriptConfig,
    /// 引用設定
    #[serde(default)]
    pub quotes: QuotesConfig,
    /// Twitch API設定
    #[serde(default)]
    pub twitch: TwitchConfig,
}

/// IRC接続設定
#[derive(Debug, Clone, Deserialize)]
pub struct IrcConfig {
    /// 接続先サーバー（host:port）
    #[serde(default = "default_server")]
    pub server: String,
    /// 送信間隔（ミリ秒）
    #[serde(default = "default_send_interval_ms")]
    pub send_interval_ms: u64,
    /// OAuthパスワード（通常は環境変数 PASSWORD で指定）
    pub password: Option<String>,
}

/// ボット設定
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BotConfig {
    /// 参加するチャンネル名（#なし）
    #[serde(default)]
    pub channel: String,
    /// ボットのユーザー名
    #[serde(default)]
    pub user: String,
    /// !sourcecode で表示するURL
    #[serde(default = "default_source_url")]
    pub source_url: String,
}

/// 永続ストア設定
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// JSONファイルを置くディレクトリ
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// スクリプト実行設定
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptConfig {
    /// 1回の実行で許可する命令数（0で無制限）
    #[serde(default = "default_instruction_limit")]
    pub instruction_limit: u64,
    /// インタプリタのメモリ上限（バイト、0で無制限）
    #[serde(default = "default_memory_limit")]
    pub memory_limit: usize,
}

/// 引用設定
#[derive(Debug, Clone, Deserialize)]
pub struct QuotesConfig {
    /// 引用に付けるタイムスタンプのタイムゾーン
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

/// Twitch API設定
#[derive(Debug, Clone, Deserialize)]
pub struct TwitchConfig {
    /// Helix APIのベースURL
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// クライアントID（通常は環境変数 CLIENT_ID で指定）
    pub client_id: Option<String>,
    /// アクセストークン（通常は環境変数 TWITCH_TOKEN で指定）
    pub token: Option<String>,
    /// 接続タイムアウト（秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// 読み取りタイムアウト（秒）
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,
}

// デフォルト値を返す関数群
fn default_server() -> String {
    "irc.chat.twitch.tv:6667".to_string()
}

fn default_send_interval_ms() -> u64 {
    1000 // Twitchのレート制限対策
}

fn default_source_url() -> String {
    "github.com/Fugiman/kaet".to_string()
}

fn default_data_dir() -> String {
    ".".to_string()
}

fn default_instruction_limit() -> u64 {
    1_000_000
}

fn default_memory_limit() -> usize {
    16 * 1024 * 1024
}

fn default_timezone() -> String {
    "America/Vancouver".to_string()
}

fn default_api_url() -> String {
    "https://api.twitch.tv/helix".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    30
}

impl Default for IrcConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            send_interval_ms: default_send_interval_ms(),
            password: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            instruction_limit: default_instruction_limit(),
            memory_limit: default_memory_limit(),
        }
    }
}

impl Default for QuotesConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
        }
    }
}

impl Default for TwitchConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            client_id: None,
            token: None,
            connect_timeout: default_connect_timeout(),
            read_timeout: default_read_timeout(),
        }
    }
}

impl Config {
    /// TOMLファイルから設定を読み込む
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// TOML文字列から設定をパース
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .context("Failed to parse TOML config")
    }

    /// デフォルト設定ファイルパスを取得
    pub fn default_config_path() -> PathBuf {
        if let Ok(config_path) = std::env::var("KAET_CONFIG") {
            return PathBuf::from(config_path);
        }

        // カレントディレクトリのconfig/default.toml
        let cwd_config = PathBuf::from("config/default.toml");
        if cwd_config.exists() {
            return cwd_config;
        }

        // ホームディレクトリの.kaet/config.toml
        if let Some(home) = dirs::home_dir() {
            let home_config = home.join(".kaet").join("config.toml");
            if home_config.exists() {
                return home_config;
            }
        }

        cwd_config
    }

    /// デフォルト設定ファイルから読み込み（存在しない場合は自動生成）
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path();

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            if let Err(e) = Self::create_default_config(&config_path) {
                tracing::warn!("Failed to create default config: {}", e);
            } else {
                tracing::info!("Created default config at {}", config_path.display());
            }
            Ok(Self::default())
        }
    }

    /// デフォルト設定ファイルを生成
    fn create_default_config(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let default_content = r#"# kaet default configuration
# Secrets come from the environment: PASSWORD, CLIENT_ID, TWITCH_TOKEN

[irc]
server = "irc.chat.twitch.tv:6667"
send_interval_ms = 1000

[bot]
# channel = "kate"      # or CHANNEL
# user = "kaetbot"      # or BOT_USER
source_url = "github.com/Fugiman/kaet"

[storage]
data_dir = "."

[script]
instruction_limit = 1000000
memory_limit = 16777216  # bytes

[quotes]
timezone = "America/Vancouver"

[twitch]
api_url = "https://api.twitch.tv/helix"
connect_timeout = 10   # seconds
read_timeout = 30      # seconds
"#;

        std::fs::write(path, default_content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// 環境変数で上書き
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// 任意の取得関数で上書き（空文字列は無視）
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(channel) = get("CHANNEL") {
            self.bot.channel = channel;
        }
        if let Some(user) = get("BOT_USER") {
            self.bot.user = user;
        }
        if let Some(password) = get("PASSWORD") {
            self.irc.password = Some(password);
        }
        if let Some(client_id) = get("CLIENT_ID") {
            self.twitch.client_id = Some(client_id);
        }
        if let Some(token) = get("TWITCH_TOKEN") {
            self.twitch.token = Some(token);
        }
    }

    /// 起動に必要な値が揃っているか確認
    pub fn validate(&self) -> Result<()> {
        if self.bot.channel.trim().is_empty() {
            anyhow::bail!("channel is not configured (set CHANNEL or [bot].channel)");
        }
        if self.bot.user.trim().is_empty() {
            anyhow::bail!("bot user is not configured (set BOT_USER or [bot].user)");
        }
        self.timezone()?;
        Ok(())
    }

    /// 引用用タイムゾーンをパース
    pub fn timezone(&self) -> Result<chrono_tz::Tz> {
        self.quotes
            .timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| anyhow::anyhow!("Invalid timezone '{}': {}", self.quotes.timezone, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[irc]
server = "localhost:6667"
send_interval_ms = 250

[bot]
channel = "kate"
user = "kaetbot"

[storage]
data_dir = "/var/lib/kaet"

[script]
instruction_limit = 5000
"#;
        let config = Config::parse(toml_content).unwrap();

        assert_eq!(config.irc.server, "localhost:6667");
        assert_eq!(config.irc.send_interval_ms, 250);
        assert_eq!(config.bot.channel, "kate");
        assert_eq!(config.bot.user, "kaetbot");
        assert_eq!(config.storage.data_dir, "/var/lib/kaet");
        assert_eq!(config.script.instruction_limit, 5000);
        assert_eq!(config.script.memory_limit, 16 * 1024 * 1024); // デフォルト値
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();

        assert_eq!(config.irc.server, "irc.chat.twitch.tv:6667");
        assert_eq!(config.irc.send_interval_ms, 1000);
        assert_eq!(config.storage.data_dir, ".");
        assert_eq!(config.script.instruction_limit, 1_000_000);
        assert_eq!(config.quotes.timezone, "America/Vancouver");
        assert_eq!(config.twitch.api_url, "https://api.twitch.tv/helix");
        assert_eq!(config.twitch.connect_timeout, 10);
        assert_eq!(config.twitch.read_timeout, 30);
        assert!(config.irc.password.is_none());
    }

    #[test]
    fn test_empty_config() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.irc.server, "irc.chat.twitch.tv:6667");
        assert!(config.bot.channel.is_empty());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("CHANNEL", "kate"),
            ("BOT_USER", "kaetbot"),
            ("PASSWORD", "secret"),
            ("CLIENT_ID", "abc"),
            ("TWITCH_TOKEN", ""),
        ]
        .into_iter()
        .collect();

        let mut config = Config::parse("[bot]\nchannel = \"other\"\n").unwrap();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.bot.channel, "kate");
        assert_eq!(config.bot.user, "kaetbot");
        assert_eq!(config.irc.password.as_deref(), Some("secret"));
        assert_eq!(config.twitch.client_id.as_deref(), Some("abc"));
        assert!(config.twitch.token.is_none()); // 空文字列は無視
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        assert!(config.validate().is_err());

        config.bot.channel = "kate".to_string();
        config.bot.user = "kaetbot".to_string();
        assert!(config.validate().is_ok());

        config.quotes.timezone = "Not/AZone".to_string();
        assert!(config.validate().is_err());
    }
}
