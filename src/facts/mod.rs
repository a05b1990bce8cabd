//! 外部情報（ゲーム名・配信時間・サブスク数）の取得

pub mod twitch;

pub use twitch::HelixClient;

use anyhow::Result;
use async_trait::async_trait;

/// チャンネルの外部情報を提供するトレイト
#[async_trait]
pub trait FactProvider: Send + Sync {
    /// 現在のゲーム名
    async fn current_game(&self, channel: &str) -> Result<String>;

    /// 配信時間の説明文
    async fn uptime(&self, channel: &str) -> Result<String>;

    /// サブスクライバー数
    async fn subscriber_count(&self, channel: &str) -> Result<u64>;
}
