//! Twitchチャットへの接続
//!
//! 受信行は1行ずつ別タスクで処理し、送信は専用タスクが一定間隔で書き出す。

use anyhow::{Context, Result};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};

use super::message::Message;
use crate::config::Config;
use crate::dispatch::{Dispatcher, Reply};

/// 受信行の最大長
const MAX_LINE_LENGTH: usize = 8192;

/// 送信キューの長さ
const OUTBOUND_QUEUE: usize = 1000;

/// ボット自身の発言に付ける不可視の印（他のボットとのループ防止）
const ANTI_LOOP_MARK: char = '\u{200B}';

/// 接続が終了した理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// サーバーが再接続を要求した
    Reconnect,
    /// サーバーが接続を閉じた
    Closed,
}

/// 接続設定
#[derive(Debug, Clone)]
pub struct Connection {
    pub server: String,
    pub user: String,
    pub channel: String,
    pub password: Option<String>,
    pub send_interval: Duration,
}

impl Connection {
    pub fn from_config(config: &Config) -> Self {
        Self {
            server: config.irc.server.clone(),
            user: config.bot.user.to_lowercase(),
            channel: config.bot.channel.trim_start_matches('#').to_lowercase(),
            password: config.irc.password.clone(),
            send_interval: Duration::from_millis(config.irc.send_interval_ms),
        }
    }

    /// 接続直後に送る行
    pub fn handshake(&self) -> Vec<String> {
        let mut lines = vec!["CAP REQ :twitch.tv/tags\r\n".to_string()];
        if let Some(password) = &self.password {
            let token = password.strip_prefix("oauth:").unwrap_or(password);
            lines.push(format!("PASS oauth:{}\r\n", token));
        }
        lines.push(format!("USER {}\r\n", self.user));
        lines.push(format!("NICK {}\r\n", self.user));
        lines.push(format!("JOIN #{}\r\n", self.channel));
        lines.push("CAP REQ :twitch.tv/commands\r\n".to_string());
        lines
    }
}

/// 返信をPRIVMSG行に整形する
///
/// 改行はスペースに置き換え、1行に収める。
pub fn format_privmsg(reply: &Reply) -> String {
    let text: String = reply
        .text
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect();
    format!("PRIVMSG {} :{}{}\r\n", reply.target, ANTI_LOOP_MARK, text)
}

/// 接続して切断されるまで処理を続ける
pub async fn run(connection: &Connection, dispatcher: Arc<Dispatcher>) -> Result<Outcome> {
    tracing::info!("Connecting to {}", connection.server);
    let stream = TcpStream::connect(&connection.server)
        .await
        .with_context(|| format!("Failed to connect to {}", connection.server))?;
    let (reader, mut writer) = stream.into_split();

    for line in connection.handshake() {
        writer.write_all(line.as_bytes()).await.context("Handshake failed")?;
    }
    tracing::info!("Joined #{} as {}", connection.channel, connection.user);

    let (tx, rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    let writer_task = tokio::spawn(write_loop(writer, rx, connection.send_interval));

    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let outcome = loop {
        let line = match lines.next().await {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                tracing::warn!("Dropping unreadable line: {}", e);
                continue;
            }
            None => break Outcome::Closed,
        };

        let Some(message) = Message::parse(&line) else {
            continue;
        };
        tracing::debug!("[IN] {}", line);

        match message.command.as_str() {
            "PING" => {
                let pong = format!("PONG :{}\r\n", message.args.join(" "));
                if tx.send(pong).await.is_err() {
                    break Outcome::Closed;
                }
            }
            "RECONNECT" => break Outcome::Reconnect,
            "PRIVMSG" | "USERNOTICE" => {
                let dispatcher = dispatcher.clone();
                let tx = tx.clone();
                let channel = connection.channel.clone();
                tokio::spawn(async move {
                    for reply in handle_message(&dispatcher, &message, &channel).await {
                        if tx.send(format_privmsg(&reply)).await.is_err() {
                            break;
                        }
                    }
                });
            }
            _ => {}
        }
    };

    drop(tx);
    writer_task.abort();
    tracing::info!("Connection ended: {:?}", outcome);
    Ok(outcome)
}

/// 1メッセージ分の返信を作る
pub async fn handle_message(dispatcher: &Dispatcher, message: &Message, channel: &str) -> Vec<Reply> {
    if let Some(username) = message.subscriber_name() {
        return dispatcher.welcome_subscriber(username).await.into_iter().collect();
    }

    match message.to_chat_event(channel) {
        Some(event) => dispatcher.handle(&event).await,
        None => Vec::new(),
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<String>, interval: Duration) {
    while let Some(line) = rx.recv().await {
        tracing::debug!("[OUT] {}", line.trim_end());
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::error!("Failed to write to server: {}", e);
            return;
        }
        tokio::time::sleep(interval).await;
    }
}
