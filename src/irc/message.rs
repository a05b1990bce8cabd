//! IRCメッセージの解析
//!
//! `@tags :prefix COMMAND arg1 arg2 :trailing` 形式の1行を分解する。

use std::collections::HashMap;

use crate::commands::Sender;
use crate::dispatch::ChatEvent;

/// 解析済みのIRCメッセージ
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// IRCv3タグ（値はアンエスケープ済み）
    pub tags: HashMap<String, String>,
    pub prefix: String,
    pub command: String,
    pub args: Vec<String>,
}

impl Message {
    /// 1行を解析する（コマンドがなければ `None`）
    pub fn parse(line: &str) -> Option<Self> {
        let mut rest = line.trim_end_matches(['\r', '\n']);
        let mut message = Message::default();

        if let Some(stripped) = rest.strip_prefix('@') {
            let (tags, remainder) = stripped.split_once(' ')?;
            message.tags = parse_tags(tags);
            rest = remainder.trim_start_matches(' ');
        }

        if let Some(stripped) = rest.strip_prefix(':') {
            let (prefix, remainder) = stripped.split_once(' ').unwrap_or((stripped, ""));
            message.prefix = prefix.to_string();
            rest = remainder.trim_start_matches(' ');
        }

        let (command, mut params) = rest.split_once(' ').unwrap_or((rest, ""));
        if command.is_empty() {
            return None;
        }
        message.command = command.to_ascii_uppercase();

        while !params.is_empty() {
            if let Some(trailing) = params.strip_prefix(':') {
                message.args.push(trailing.to_string());
                break;
            }
            let (arg, remainder) = params.split_once(' ').unwrap_or((params, ""));
            if !arg.is_empty() {
                message.args.push(arg.to_string());
            }
            params = remainder;
        }

        Some(message)
    }

    /// タグの値
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(|v| v.as_str())
    }

    /// プレフィックスのニックネーム部分
    pub fn nick(&self) -> &str {
        self.prefix.split('!').next().unwrap_or("")
    }

    /// 送信者の権限と表示名
    ///
    /// モデレーター・配信者バッジ・チャンネル主本人を特権ユーザーとみなす。
    pub fn sender(&self, channel: &str) -> Sender {
        let nick = self.nick();
        let is_broadcaster = self
            .tag("badges")
            .map(|badges| badges.split(',').any(|b| b.starts_with("broadcaster/")))
            .unwrap_or(false);

        let display_name = match self.tag("display-name") {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => nick.to_string(),
        };

        Sender {
            display_name,
            privileged: self.tag("mod") == Some("1") || is_broadcaster || nick.eq_ignore_ascii_case(channel),
            subscriber: self.tag("subscriber") == Some("1"),
        }
    }

    /// PRIVMSGならディスパッチ用のイベントに変換
    pub fn to_chat_event(&self, channel: &str) -> Option<ChatEvent> {
        if self.command != "PRIVMSG" || self.args.len() < 2 {
            return None;
        }

        Some(ChatEvent {
            origin: self.prefix.clone(),
            target: self.args[0].clone(),
            text: self.args[1].clone(),
            sender: self.sender(channel),
        })
    }

    /// USERNOTICEのサブスク通知ならユーザー名を返す
    pub fn subscriber_name(&self) -> Option<&str> {
        if self.command != "USERNOTICE" {
            return None;
        }
        match self.tag("msg-id") {
            Some("sub") | Some("resub") => {}
            _ => return None,
        }
        match self.tag("display-name") {
            Some(name) if !name.is_empty() => Some(name),
            _ => self.tag("login"),
        }
    }
}

fn parse_tags(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter(|tag| !tag.is_empty())
        .map(|tag| match tag.split_once('=') {
            Some((key, value)) => (key.to_string(), unescape_tag(value)),
            None => (tag.to_string(), String::new()),
        })
        .collect()
}

fn unescape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}
