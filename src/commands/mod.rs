//! コマンドのバックエンド
//!
//! 固定（組み込み）・保存テキスト・Luaスクリプト・イベントテンプレートの4種類。

pub mod builtin;
pub mod events;
pub mod quote;

pub use builtin::{Builtin, ALIASES};
pub use events::{EventMessages, KNOWN_EVENTS, NEW_SUB_EVENT};

use crate::engine::CommandEngine;
use crate::error::CommandResult;
use crate::registry::CommandEntry;

/// コマンドを送った人の情報
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sender {
    /// 表示名
    pub display_name: String,
    /// モデレーター（または配信者）かどうか
    pub privileged: bool,
    /// サブスクライバーかどうか
    pub subscriber: bool,
}

/// 1回のコマンド呼び出しのコンテキスト
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    /// トリガー以降の引数文字列
    pub argument: &'a str,
    /// 送信者（分かる場合のみ）
    pub sender: Option<&'a Sender>,
}

impl<'a> Invocation<'a> {
    pub fn new(argument: &'a str, sender: Option<&'a Sender>) -> Self {
        Self { argument, sender }
    }
}

/// イベントメッセージを引数をユーザー名として描画する
pub(crate) async fn render_event(
    engine: &CommandEngine,
    event: &str,
    invocation: &Invocation<'_>,
) -> CommandResult<String> {
    engine
        .events()
        .render(event, invocation.argument, engine.facts(), engine.channel())
        .await
}

/// コマンドの実行方法
pub enum Backend {
    /// 組み込みコマンド
    Constant(Builtin),
    /// 保存されたテキストをそのまま返す
    Text(String),
    /// 保存されたLuaスクリプト
    Script { name: String, source: String },
    /// イベントメッセージのテンプレート（イベント名で参照）
    Template(String),
}

impl Backend {
    /// コマンドを実行し、チャットに送る文字列を返す（空なら何も送らない）
    pub async fn invoke(&self, engine: &CommandEngine, invocation: &Invocation<'_>) -> CommandResult<String> {
        match self {
            Backend::Constant(builtin) => builtin.run(engine, invocation).await,
            Backend::Text(text) => Ok(text.clone()),
            Backend::Script { name, source } => Ok(engine.interpreter().invoke(name, source, invocation).await?),
            Backend::Template(event) => render_event(engine, event, invocation).await,
        }
    }

    /// 種類名（ログ用）
    pub fn kind(&self) -> &'static str {
        match self {
            Backend::Constant(_) => "builtin",
            Backend::Text(_) => "text",
            Backend::Script { .. } => "script",
            Backend::Template(_) => "template",
        }
    }
}

impl CommandEntry {
    /// 組み込みコマンド（削除不可）
    pub fn constant(builtin: Builtin) -> Self {
        Self {
            privileged: builtin.privileged(),
            backend: Backend::Constant(builtin),
            removable: false,
        }
    }

    /// 保存テキストコマンド
    pub fn stored_text(text: &str) -> Self {
        Self {
            backend: Backend::Text(text.to_string()),
            privileged: false,
            removable: true,
        }
    }

    /// イベントメッセージ（引数をユーザー名として描画する）
    pub fn template(event: &str) -> Self {
        Self {
            backend: Backend::Template(event.to_string()),
            privileged: false,
            removable: false,
        }
    }

    /// スクリプトコマンド（コンパイル済みであること）
    pub fn script(name: &str, source: &str) -> Self {
        Self {
            backend: Backend::Script {
                name: name.to_string(),
                source: source.to_string(),
            },
            privileged: false,
            removable: true,
        }
    }
}

/// 最初の空白で分割し、先頭の単語を小文字にする
pub fn split_first(input: &str) -> (String, &str) {
    let mut parts = input.splitn(2, ' ');
    let head = parts.next().unwrap_or("").to_lowercase();
    let rest = parts.next().unwrap_or("");
    (head, rest)
}

/// 先頭の`!`を1つだけ取り除く
pub fn trim_sigil(trigger: &str) -> &str {
    trigger.strip_prefix('!').unwrap_or(trigger)
}
