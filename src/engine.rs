//! コマンドエンジン
//!
//! レジストリ・各ストア・インタプリタ・外部情報プロバイダをまとめて所有し、
//! ディスパッチャとコマンドに明示的に渡す。

use anyhow::{Context, Result};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::commands::{Builtin, EventMessages, ALIASES, KNOWN_EVENTS};
use crate::config::{Config, ScriptConfig};
use crate::facts::FactProvider;
use crate::registry::{CommandEntry, CommandRegistry};
use crate::script::ScriptEngine;
use crate::store::Store;

/// テキストコマンドのストア名
pub const COMMANDS_STORE: &str = "commands";
/// スクリプトコマンドのストア名
pub const SCRIPTS_STORE: &str = "scripts";
/// 引用のストア名
pub const QUOTES_STORE: &str = "quotes";
/// イベントメッセージのストア名
pub const EVENTS_STORE: &str = "eventmessages";

/// エンジンの動作設定
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// チャンネル名（#なし）
    pub channel: String,
    /// ボットのユーザー名（小文字）
    pub bot_user: String,
    /// !sourcecode のURL
    pub source_url: String,
    /// 引用のタイムゾーン
    pub timezone: Tz,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            channel: config.bot.channel.trim_start_matches('#').to_lowercase(),
            bot_user: config.bot.user.to_lowercase(),
            source_url: config.bot.source_url.clone(),
            timezone: config.timezone()?,
        })
    }
}

pub struct CommandEngine {
    settings: EngineSettings,
    registry: CommandRegistry,
    commands: Store,
    scripts: Store,
    quotes: Store,
    events: EventMessages,
    /// イベント名 -> テンプレートのエントリ（レジストリには入れない）
    event_entries: HashMap<String, CommandEntry>,
    interpreter: Arc<ScriptEngine>,
    facts: Arc<dyn FactProvider>,
}

impl CommandEngine {
    /// 設定からエンジンを構築
    pub fn bootstrap(config: &Config, facts: Arc<dyn FactProvider>) -> Result<Self> {
        let settings = EngineSettings::from_config(config)?;
        Self::open(settings, Path::new(&config.storage.data_dir), &config.script, facts)
    }

    /// ストアを開き、保存済みコマンド・組み込み・エイリアスを登録する
    ///
    /// エイリアスの対象が存在しない場合はエラー（起動を中止すべき設定ミス）。
    pub fn open(
        settings: EngineSettings,
        data_dir: &Path,
        script: &ScriptConfig,
        facts: Arc<dyn FactProvider>,
    ) -> Result<Self> {
        let open = |name: &str| {
            Store::open(data_dir, name).with_context(|| format!("Failed to open store '{}'", name))
        };

        let engine = Self {
            settings,
            registry: CommandRegistry::new(),
            commands: open(COMMANDS_STORE)?,
            scripts: open(SCRIPTS_STORE)?,
            quotes: open(QUOTES_STORE)?,
            events: EventMessages::new(open(EVENTS_STORE)?),
            event_entries: KNOWN_EVENTS
                .iter()
                .map(|event| (event.to_string(), CommandEntry::template(event)))
                .collect(),
            interpreter: Arc::new(ScriptEngine::new(script).context("Failed to create script engine")?),
            facts,
        };

        engine.load_stored_commands();
        engine.declare_builtins();
        engine.declare_aliases()?;

        tracing::info!("Command engine ready with {} commands", engine.registry.len());
        Ok(engine)
    }

    fn load_stored_commands(&self) {
        for (trigger, text) in self.commands.entries() {
            self.registry.declare(&trigger, CommandEntry::stored_text(&text));
        }

        for (trigger, source) in self.scripts.entries() {
            match self.interpreter.compile(&trigger, &source) {
                Ok(()) => self.registry.declare(&trigger, CommandEntry::script(&trigger, &source)),
                Err(e) => tracing::warn!("Skipping stored script !{}: {}", trigger, e),
            }
        }
    }

    fn declare_builtins(&self) {
        for builtin in Builtin::ALL {
            if self.registry.contains(builtin.name()) {
                tracing::warn!("Stored command !{} is shadowed by a built-in", builtin.name());
            }
            self.registry.declare(builtin.name(), CommandEntry::constant(*builtin));
        }
    }

    fn declare_aliases(&self) -> Result<()> {
        for (alias, canonical) in ALIASES {
            self.registry.declare_alias(alias, canonical)?;
        }
        for builtin in Builtin::ALL {
            let aliases = self.registry.aliases_of(builtin.name());
            if !aliases.is_empty() {
                tracing::debug!("!{} aliases: {}", builtin.name(), aliases.join(", "));
            }
        }
        Ok(())
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn channel(&self) -> &str {
        &self.settings.channel
    }

    pub fn bot_user(&self) -> &str {
        &self.settings.bot_user
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn command_store(&self) -> &Store {
        &self.commands
    }

    pub fn script_store(&self) -> &Store {
        &self.scripts
    }

    pub fn quotes(&self) -> &Store {
        &self.quotes
    }

    pub fn events(&self) -> &EventMessages {
        &self.events
    }

    pub fn interpreter(&self) -> &Arc<ScriptEngine> {
        &self.interpreter
    }

    /// イベントメッセージを描画するエントリ
    pub fn event_entry(&self, event: &str) -> Option<&CommandEntry> {
        self.event_entries.get(event)
    }

    pub fn facts(&self) -> &dyn FactProvider {
        self.facts.as_ref()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_builtins_and_aliases() {
        let temp_dir = tempdir().unwrap();
        let engine = engine_in(temp_dir.path());

        assert_eq!(engine.registry().len(), Builtin::ALL.len());
        for (alias, _) in ALIASES {
            assert!(engine.registry().resolve(alias).is_some(), "{}", alias);
        }
        assert!(engine.registry().resolve("addcommand").unwrap().privileged);
        assert!(!engine.registry().resolve("help").unwrap().privileged);
    }

    #[test]
    fn test_stored_commands_are_loaded() {
        let temp_dir = tempdir().unwrap();
        {
            let commands = Store::open(temp_dir.path(), COMMANDS_STORE).unwrap();
            commands.add("hello", "Hi there!").unwrap();
            // 組み込みと同名のものは上書きされる
            commands.add("help", "shadow").unwrap();

            let scripts = Store::open(temp_dir.path(), SCRIPTS_STORE).unwrap();
            scripts.add("dice", "reply('4')").unwrap();
            scripts.add("broken", "reply(").unwrap();
        }

        let engine = engine_in(temp_dir.path());
        let hello = engine.registry().resolve("hello").unwrap();
        assert!(matches!(&hello.backend, crate::commands::Backend::Text(t) if t == "Hi there!"));
        assert!(hello.removable);

        assert!(!engine.registry().resolve("help").unwrap().removable);
        assert_eq!(engine.registry().resolve("dice").unwrap().backend.kind(), "script");
        assert!(engine.registry().resolve("broken").is_none());
        // 壊れたスクリプトもストアには残る
        assert!(engine.script_store().contains("broken"));
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.bot.channel = "#Kate".to_string();
        config.bot.user = "KaetBot".to_string();

        let settings = EngineSettings::from_config(&config).unwrap();
        assert_eq!(settings.channel, "kate");
        assert_eq!(settings.bot_user, "kaetbot");
        assert_eq!(settings.timezone, chrono_tz::America::Vancouver);
    }
}
