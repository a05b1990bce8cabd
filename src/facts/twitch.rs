//! Twitch Helix APIクライアント

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use super::FactProvider;
use crate::config::TwitchConfig;

/// Helixの一覧レスポンス
#[derive(Deserialize, Debug)]
struct Page<T> {
    data: Vec<T>,
    /// サブスク一覧の場合のみ
    #[serde(default)]
    total: Option<u64>,
}

#[derive(Deserialize, Debug)]
struct User {
    id: String,
}

#[derive(Deserialize, Debug)]
struct ChannelInfo {
    #[serde(default)]
    game_name: String,
}

#[derive(Deserialize, Debug)]
struct Stream {
    started_at: String,
}

#[derive(Deserialize, Debug)]
struct Subscription {}

#[derive(Clone)]
pub struct HelixClient {
    client: Client,
    base_url: String,
    client_id: Option<String>,
    token: Option<String>,
    broadcaster_ids: std::sync::Arc<Mutex<HashMap<String, String>>>,
}

impl HelixClient {
    fn build_client(connect_timeout_secs: u64, read_timeout_secs: u64) -> Client {
        Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .timeout(Duration::from_secs(read_timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new())
    }

    /// TwitchConfigからクライアントを作成
    pub fn from_config(config: &TwitchConfig) -> Self {
        Self {
            client: Self::build_client(config.connect_timeout, config.read_timeout),
            base_url: config.api_url.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            token: config.token.clone(),
            broadcaster_ids: Default::default(),
        }
    }

    /// GETリクエストを送りJSONを返す
    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let url = format!("{}/{}", self.base_url, path);
        let mut request = self.client.get(&url).query(query);
        if let Some(client_id) = &self.client_id {
            request = request.header("Client-Id", client_id);
        }
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Request to {} failed", path))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Twitch API returned {} for {}", status, path);
        }

        response
            .json::<T>()
            .await
            .with_context(|| format!("Failed to decode response from {}", path))
    }

    /// ログイン名からブロードキャスターIDを取得（キャッシュ付き）
    async fn broadcaster_id(&self, channel: &str) -> Result<String> {
        let login = channel.trim_start_matches('#').to_lowercase();
        if let Some(id) = self.broadcaster_ids.lock().get(&login) {
            return Ok(id.clone());
        }

        let page: Page<User> = self.get("users", &[("login", login.as_str())]).await?;
        let id = page
            .data
            .into_iter()
            .next()
            .map(|u| u.id)
            .ok_or_else(|| anyhow::anyhow!("Unknown channel: {}", login))?;

        self.broadcaster_ids.lock().insert(login, id.clone());
        Ok(id)
    }
}

#[async_trait]
impl FactProvider for HelixClient {
    async fn current_game(&self, channel: &str) -> Result<String> {
        let id = self.broadcaster_id(channel).await?;
        let page: Page<ChannelInfo> = self.get("channels", &[("broadcaster_id", id.as_str())]).await?;
        let game = page
            .data
            .into_iter()
            .next()
            .map(|c| c.game_name)
            .unwrap_or_default();

        if game.is_empty() {
            Ok("nothing".to_string())
        } else {
            Ok(game)
        }
    }

    async fn uptime(&self, channel: &str) -> Result<String> {
        let login = channel.trim_start_matches('#').to_lowercase();
        let page: Page<Stream> = self.get("streams", &[("user_login", login.as_str())]).await?;

        match page.data.into_iter().next() {
            Some(stream) => {
                let started = DateTime::parse_from_rfc3339(&stream.started_at)
                    .with_context(|| format!("Invalid started_at: {}", stream.started_at))?
                    .with_timezone(&Utc);
                let elapsed = (Utc::now() - started).to_std().unwrap_or_default();
                Ok(format!("{} has been live for {}", login, format_duration(elapsed)))
            }
            None => Ok(format!("{} is not live right now.", login)),
        }
    }

    async fn subscriber_count(&self, channel: &str) -> Result<u64> {
        let id = self.broadcaster_id(channel).await?;
        let page: Page<Subscription> = self
            .get("subscriptions", &[("broadcaster_id", id.as_str()), ("first", "1")])
            .await?;
        page.total
            .ok_or_else(|| anyhow::anyhow!("subscriptions response was missing total"))
    }
}

/// 経過時間を「1 hour, 5 minutes」形式に変換
pub fn format_duration(elapsed: Duration) -> String {
    let total_minutes = elapsed.as_secs() / 60;
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;

    let unit = |n: u64, name: &str| format!("{} {}{}", n, name, if n == 1 { "" } else { "s" });

    match (hours, minutes) {
        (0, m) => unit(m, "minute"),
        (h, 0) => unit(h, "hour"),
        (h, m) => format!("{}, {}", unit(h, "hour"), unit(m, "minute")),
    }
}
