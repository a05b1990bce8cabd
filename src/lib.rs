//! kaet: Twitchチャンネル用チャットボット
//!
//! 保存型のテキストコマンド、サンドボックス化したLuaスクリプトコマンド、
//! 引用ログ、サブスク歓迎メッセージを備えたIRCボット。

pub mod commands;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod facts;
pub mod irc;
pub mod registry;
pub mod script;
pub mod store;

// 主要な型の再エクスポート
pub use commands::{Backend, Builtin, EventMessages, Invocation, Sender};
pub use config::{BotConfig, Config, IrcConfig, QuotesConfig, ScriptConfig, StorageConfig, TwitchConfig};
pub use dispatch::{ChatEvent, Dispatcher, Reply};
pub use engine::{CommandEngine, EngineSettings};
pub use error::{CommandError, CommandResult, RegistryError, ScriptError, StoreError};
pub use facts::{FactProvider, HelixClient};
pub use registry::{CommandEntry, CommandRegistry};
pub use script::ScriptEngine;
pub use store::Store;

/// バージョン情報
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
