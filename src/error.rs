//! エラー型定義
//!
//! コマンド単位のエラーはチャットに表示する診断文字列へ変換される。
//! 起動時の設定エラーだけがプロセスを停止させる。

use thiserror::Error;

/// 永続ストアのエラー
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error ({path}): {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode store {name}: {source}")]
    Encode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// コマンドレジストリのエラー
#[derive(Debug, Error)]
pub enum RegistryError {
    /// 未登録のコマンドへのエイリアス（起動時の致命的エラー）
    #[error("invalid alias: {alias} -> {target}")]
    UnknownAliasTarget { alias: String, target: String },

    /// 削除・上書き不可のエントリを変更しようとした
    #[error("!{0} is a built-in command and cannot be changed.")]
    Protected(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// スクリプト実行エンジンのエラー
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("compile error: {0}")]
    Compile(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("script exceeded its instruction budget ({0} instructions)")]
    BudgetExceeded(u64),
}

/// コマンド実行時のエラー（チャットに診断として表示される）
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// 外部APIの呼び出し失敗
    #[error("lookup failed: {0}")]
    Lookup(String),

    #[error("Template error: {0}")]
    Template(String),

    /// 使い方の誤り
    #[error("Usage: {0}")]
    Usage(&'static str),
}

impl CommandError {
    /// チャットに送る診断メッセージ
    pub fn to_chat(&self) -> String {
        match self {
            // 利用者の入力ミスはそのまま表示
            CommandError::Registry(RegistryError::Protected(_))
            | CommandError::Usage(_)
            | CommandError::Template(_) => self.to_string(),
            _ => format!("ERROR: {}", self),
        }
    }
}

pub type CommandResult<T> = std::result::Result<T, CommandError>;
