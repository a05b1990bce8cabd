use chrono::Utc;

use super::{quote, render_event, split_first, trim_sigil, Invocation, KNOWN_EVENTS};
use crate::engine::CommandEngine;
use crate::error::{CommandError, CommandResult};
use crate::registry::CommandEntry;

/// 組み込みコマンド
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    /// コマンド一覧
    Help,
    /// 配信時間
    Uptime,
    /// 現在のゲーム
    Game,
    /// 引用を表示
    Quote,
    /// ソースコードの場所
    SourceCode,
    /// 引用を追加
    AddQuote,
    /// 引用を空にする（番号は再利用しない）
    RemoveQuote,
    /// テキストコマンドを追加
    AddCommand,
    /// コマンドを削除
    RemoveCommand,
    /// スクリプトコマンドを追加
    AddScript,
    /// スクリプトコマンドを削除
    RemoveScript,
    /// イベントメッセージを設定
    SetEventMessage,
    /// イベントメッセージを削除
    RemoveEventMessage,
    /// イベントメッセージを試す
    TestEventMessage,
}

/// 起動時に登録するエイリアス（エイリアス, 正規トリガー）
pub const ALIASES: &[(&str, &str)] = &[
    ("halp", "help"),
    ("add", "addcommand"),
    ("addcom", "addcommand"),
    ("remove", "removecommand"),
    ("removecom", "removecommand"),
    ("del", "removecommand"),
    ("delcom", "removecommand"),
    ("delcommand", "removecommand"),
    ("source", "sourcecode"),
    ("code", "sourcecode"),
    ("delquote", "removequote"),
    ("delscript", "removescript"),
];

impl Builtin {
    pub const ALL: &'static [Builtin] = &[
        Builtin::Help,
        Builtin::Uptime,
        Builtin::Game,
        Builtin::Quote,
        Builtin::SourceCode,
        Builtin::AddQuote,
        Builtin::RemoveQuote,
        Builtin::AddCommand,
        Builtin::RemoveCommand,
        Builtin::AddScript,
        Builtin::RemoveScript,
        Builtin::SetEventMessage,
        Builtin::RemoveEventMessage,
        Builtin::TestEventMessage,
    ];

    /// トリガー名
    pub fn name(&self) -> &'static str {
        match self {
            Builtin::Help => "help",
            Builtin::Uptime => "uptime",
            Builtin::Game => "game",
            Builtin::Quote => "quote",
            Builtin::SourceCode => "sourcecode",
            Builtin::AddQuote => "addquote",
            Builtin::RemoveQuote => "removequote",
            Builtin::AddCommand => "addcommand",
            Builtin::RemoveCommand => "removecommand",
            Builtin::AddScript => "addscript",
            Builtin::RemoveScript => "removescript",
            Builtin::SetEventMessage => "seteventmessage",
            Builtin::RemoveEventMessage => "removeeventmessage",
            Builtin::TestEventMessage => "testeventmessage",
        }
    }

    /// モデレーター専用かどうか
    pub fn privileged(&self) -> bool {
        !matches!(
            self,
            Builtin::Help | Builtin::Uptime | Builtin::Game | Builtin::Quote | Builtin::SourceCode
        )
    }

    pub async fn run(&self, engine: &CommandEngine, invocation: &Invocation<'_>) -> CommandResult<String> {
        let argument = invocation.argument;
        match self {
            Builtin::Help => Ok(format!("Available Commands: {}", engine.registry().names().join(" "))),
            Builtin::Uptime => engine
                .facts()
                .uptime(engine.channel())
                .await
                .map_err(|e| CommandError::Lookup(e.to_string())),
            Builtin::Game => {
                let game = engine
                    .facts()
                    .current_game(engine.channel())
                    .await
                    .map_err(|e| CommandError::Lookup(e.to_string()))?;
                Ok(format!("{} is playing {}", engine.channel(), game))
            }
            Builtin::Quote => Ok(random_quote(engine, argument)),
            Builtin::SourceCode => Ok(format!(
                "Contribute to kaet's source code at {} VoHiYo",
                engine.settings().source_url
            )),
            Builtin::AddQuote => add_quote(engine, argument).await,
            Builtin::RemoveQuote => remove_quote(engine, argument),
            Builtin::AddCommand => add_text_command(engine, argument),
            Builtin::RemoveCommand | Builtin::RemoveScript => remove_command(engine, argument),
            Builtin::AddScript => add_script_command(engine, argument).await,
            Builtin::SetEventMessage => {
                let (event, template) = split_first(argument);
                if event.is_empty() || template.trim().is_empty() {
                    return Err(CommandError::Usage("!seteventmessage <event> <template>"));
                }
                engine.events().set(&event, template)
            }
            Builtin::RemoveEventMessage => {
                let (event, _) = split_first(argument.trim());
                if event.is_empty() {
                    return Err(CommandError::Usage("!removeeventmessage <event>"));
                }
                Ok(engine.events().remove(&event)?)
            }
            Builtin::TestEventMessage => {
                let (event, username) = split_first(argument);
                if engine.event_entry(&event).is_some() {
                    // Backend::invoke を経由すると非同期再帰になる
                    let invocation = Invocation::new(username, invocation.sender);
                    render_event(engine, &event, &invocation).await
                } else {
                    Ok(format!(
                        "There's no event '{}'. Available events: {}",
                        event,
                        KNOWN_EVENTS.join(", ")
                    ))
                }
            }
        }
    }
}

fn random_quote(engine: &CommandEngine, query: &str) -> String {
    quote::lookup(engine.quotes(), query, &mut rand::thread_rng())
}

async fn add_quote(engine: &CommandEngine, argument: &str) -> CommandResult<String> {
    let text = argument.trim();
    if text.is_empty() {
        return Err(CommandError::Usage("!addquote <text>"));
    }

    let game = match engine.facts().current_game(engine.channel()).await {
        Ok(game) => game,
        Err(e) => {
            tracing::warn!("Game lookup for quote failed: {}", e);
            "unknown".to_string()
        }
    };

    let formatted = quote::format_quote(text, &game, Utc::now(), engine.settings().timezone);
    let key = engine.quotes().append(&formatted)?;
    tracing::info!("Added quote #{}", key);
    Ok(format!("Quote #{} added.", key))
}

fn remove_quote(engine: &CommandEngine, argument: &str) -> CommandResult<String> {
    let number = quote::parse_number(argument).ok_or(CommandError::Usage("!removequote #<number>"))?;
    if engine.quotes().blank(&number.to_string())? {
        tracing::info!("Blanked quote #{}", number);
        Ok(format!("Quote #{} removed.", number))
    } else {
        Ok(format!("Quote #{} not found.", number))
    }
}

fn add_text_command(engine: &CommandEngine, argument: &str) -> CommandResult<String> {
    let (trigger, text) = split_first(argument);
    let trigger = trim_sigil(&trigger);
    if trigger.is_empty() || text.trim().is_empty() {
        return Err(CommandError::Usage("!addcommand <trigger> <text>"));
    }

    engine.registry().try_declare(trigger, CommandEntry::stored_text(text), || {
        engine.command_store().add(trigger, text)?;
        if engine.script_store().contains(trigger) {
            engine.script_store().remove(trigger)?;
        }
        Ok(())
    })?;

    tracing::info!("Added text command !{}", trigger);
    Ok(format!("Command !{} added.", trigger))
}

async fn add_script_command(engine: &CommandEngine, argument: &str) -> CommandResult<String> {
    let (trigger, source) = split_first(argument);
    let trigger = trim_sigil(&trigger);
    if trigger.is_empty() || source.trim().is_empty() {
        return Err(CommandError::Usage("!addscript <trigger> <lua source>"));
    }

    // コンパイルに失敗したら何も保存しない
    engine.interpreter().check(trigger, source).await?;

    engine.registry().try_declare(trigger, CommandEntry::script(trigger, source), || {
        engine.script_store().add(trigger, source)?;
        if engine.command_store().contains(trigger) {
            engine.command_store().remove(trigger)?;
        }
        Ok(())
    })?;

    tracing::info!("Added script command !{}", trigger);
    Ok(format!("Script !{} added.", trigger))
}

fn remove_command(engine: &CommandEngine, argument: &str) -> CommandResult<String> {
    let (trigger, _) = split_first(argument.trim());
    let trigger = trim_sigil(&trigger);
    if trigger.is_empty() {
        return Err(CommandError::Usage("!removecommand <trigger>"));
    }

    let existed = engine.registry().try_undeclare(trigger, || {
        for store in [engine.command_store(), engine.script_store()] {
            if store.contains(trigger) {
                store.remove(trigger)?;
            }
        }
        Ok(())
    })?;

    if existed {
        tracing::info!("Removed command !{}", trigger);
        Ok(format!("Command !{} removed.", trigger))
    } else {
        Ok(format!("No command !{}.", trigger))
    }
}
