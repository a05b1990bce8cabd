//! ディスパッチャ
//!
//! 受信したチャット行からトリガーを取り出し、レジストリで解決して実行する。
//! 失敗はすべてチャット用の文字列に変換され、ディスパッチ自体は失敗しない。

use regex::Regex;
use std::sync::Arc;

use crate::commands::{split_first, Invocation, Sender, NEW_SUB_EVENT};
use crate::engine::CommandEngine;

/// Twitchのサブスク通知を送ってくるユーザー
const NOTIFY_USER: &str = "twitchnotify";

/// 受信したチャットメッセージ
#[derive(Debug, Clone, Default)]
pub struct ChatEvent {
    /// 送信元プレフィックス（`nick!user@host`）
    pub origin: String,
    /// 送信先（チャンネルまたはボット自身）
    pub target: String,
    /// 本文
    pub text: String,
    pub sender: Sender,
}

impl ChatEvent {
    /// 送信元のニックネーム
    pub fn nick(&self) -> &str {
        self.origin.split('!').next().unwrap_or("")
    }
}

/// 送信する1行分の返信
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub target: String,
    pub text: String,
}

pub struct Dispatcher {
    engine: Arc<CommandEngine>,
    /// 呼び出しプレフィックス（小文字、先に一致したものを使う）
    prefixes: Vec<String>,
    subscription: Regex,
}

impl Dispatcher {
    pub fn new(engine: Arc<CommandEngine>) -> Result<Self, regex::Error> {
        let bot = engine.bot_user().to_lowercase();
        let prefixes = vec!["!".to_string(), format!("{} ", bot), format!("@{} ", bot)];

        let subscription = Regex::new(&format!(
            r"(?i)^(\S+) just subscribed (?:to {}|with Twitch Prime)!$",
            regex::escape(engine.channel())
        ))?;

        Ok(Self {
            engine,
            prefixes,
            subscription,
        })
    }

    pub fn engine(&self) -> &CommandEngine {
        &self.engine
    }

    /// 1行を処理し、送信すべき返信をすべて返す
    pub async fn handle(&self, event: &ChatEvent) -> Vec<Reply> {
        let mut replies = Vec::new();

        if let Some(username) = self.subscriber_name(event) {
            if let Some(reply) = self.welcome_subscriber(username).await {
                replies.push(reply);
            }
        }

        if let Some(reply) = self.dispatch(event).await {
            replies.push(reply);
        }

        replies
    }

    /// コマンドとして解釈して実行する
    ///
    /// プレフィックスなし・未知のトリガー・権限不足・空の結果はいずれも `None`。
    pub async fn dispatch(&self, event: &ChatEvent) -> Option<Reply> {
        let rest = self.strip_prefix(&event.text)?;
        let (trigger, argument) = split_first(rest);

        let entry = self.engine.registry().resolve(&trigger)?;
        if entry.privileged && !event.sender.privileged {
            tracing::debug!("Ignoring privileged !{} from {}", trigger, event.nick());
            return None;
        }

        tracing::info!("{} invoked !{} ({})", event.nick(), trigger, entry.backend.kind());
        let invocation = Invocation::new(argument, Some(&event.sender));
        let text = match entry.backend.invoke(&self.engine, &invocation).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("!{} failed: {}", trigger, e);
                e.to_chat()
            }
        };

        if text.is_empty() {
            return None;
        }

        Some(Reply {
            target: event.target.clone(),
            text,
        })
    }

    /// サブスク通知なら新規サブスクのユーザー名を返す
    pub fn subscriber_name<'e>(&self, event: &'e ChatEvent) -> Option<&'e str> {
        if !event.nick().eq_ignore_ascii_case(NOTIFY_USER) {
            return None;
        }
        self.subscription
            .captures(event.text.trim_end())
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    }

    /// 新規サブスクの歓迎メッセージ（未設定・失敗時は `None`）
    pub async fn welcome_subscriber(&self, username: &str) -> Option<Reply> {
        let entry = self.engine.event_entry(NEW_SUB_EVENT)?;
        let invocation = Invocation::new(username, None);

        match entry.backend.invoke(&self.engine, &invocation).await {
            Ok(text) if !text.is_empty() => {
                tracing::info!("Welcoming new subscriber {}", username);
                Some(Reply {
                    target: format!("#{}", self.engine.channel()),
                    text,
                })
            }
            Ok(_) => None,
            Err(e) => {
                tracing::error!("Failed to render {} message for {}: {}", NEW_SUB_EVENT, username, e);
                None
            }
        }
    }

    /// 大文字小文字を区別せずプレフィックスを取り除く
    fn strip_prefix<'t>(&self, text: &'t str) -> Option<&'t str> {
        self.prefixes.iter().find_map(|prefix| {
            let head = text.get(..prefix.len())?;
            if head.eq_ignore_ascii_case(prefix) {
                text.get(prefix.len()..)
            } else {
                None
            }
        })
    }
}
