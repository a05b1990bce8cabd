//! コマンドレジストリ
//!
//! トリガー名からコマンドを引く。エイリアスは1段だけ辿る。
//! 変更可能なエントリの差し替えは永続化が成功してから行う。

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::commands::Backend;
use crate::error::{RegistryError, StoreError};

/// レジストリに登録されるコマンド
pub struct CommandEntry {
    /// 実行方法
    pub backend: Backend,
    /// モデレーター専用かどうか
    pub privileged: bool,
    /// add/removeで上書き・削除できるかどうか
    pub removable: bool,
}

#[derive(Default)]
struct Tables {
    /// トリガー -> コマンド
    commands: HashMap<String, Arc<CommandEntry>>,
    /// エイリアス -> 正規トリガー
    aliases: HashMap<String, String>,
    /// 正規トリガー -> エイリアス一覧（表示用）
    reverse_aliases: HashMap<String, Vec<String>>,
}

/// コマンドレジストリ - トリガーの登録と解決
///
/// テーブル全体を1つの読み書きロックで保護する。
pub struct CommandRegistry {
    tables: RwLock<Tables>,
}

impl CommandRegistry {
    /// 新しいレジストリを作成
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }

    /// トリガーを解決（エイリアスは1段だけたどる）
    pub fn resolve(&self, trigger: &str) -> Option<Arc<CommandEntry>> {
        let tables = self.tables.read();
        let key = tables
            .aliases
            .get(trigger)
            .map(|s| s.as_str())
            .unwrap_or(trigger);
        tables.commands.get(key).cloned()
    }

    /// コマンドを登録（既存は置き換え）
    pub fn declare(&self, trigger: &str, entry: CommandEntry) {
        self.tables
            .write()
            .commands
            .insert(trigger.to_string(), Arc::new(entry));
    }

    /// コマンドを削除
    pub fn undeclare(&self, trigger: &str) -> Option<Arc<CommandEntry>> {
        self.tables.write().commands.remove(trigger)
    }

    /// エイリアスを登録
    ///
    /// 対象のコマンドが未登録ならエラー。起動時にのみ呼ばれ、
    /// 呼び出し側はこのエラーを致命的として扱う。
    pub fn declare_alias(&self, alias: &str, canonical: &str) -> Result<(), RegistryError> {
        let mut tables = self.tables.write();
        if !tables.commands.contains_key(canonical) {
            return Err(RegistryError::UnknownAliasTarget {
                alias: alias.to_string(),
                target: canonical.to_string(),
            });
        }
        tables.aliases.insert(alias.to_string(), canonical.to_string());
        tables
            .reverse_aliases
            .entry(canonical.to_string())
            .or_default()
            .push(alias.to_string());
        Ok(())
    }

    /// 削除可能なコマンドとして登録
    ///
    /// 既存エントリが保護されていれば何もせずに拒否する。`persist` が
    /// 成功した後でのみ置き換えるので、永続化された内容と動作は一致する。
    pub fn try_declare<F>(&self, trigger: &str, entry: CommandEntry, persist: F) -> Result<(), RegistryError>
    where
        F: FnOnce() -> Result<(), StoreError>,
    {
        let mut tables = self.tables.write();
        Self::check_removable(&tables, trigger)?;
        persist()?;
        tables.commands.insert(trigger.to_string(), Arc::new(entry));
        Ok(())
    }

    /// 削除可能なコマンドを削除
    ///
    /// `purge` は登録の有無にかかわらず実行される。登録されていたかを返す。
    pub fn try_undeclare<F>(&self, trigger: &str, purge: F) -> Result<bool, RegistryError>
    where
        F: FnOnce() -> Result<(), StoreError>,
    {
        let mut tables = self.tables.write();
        Self::check_removable(&tables, trigger)?;
        purge()?;
        Ok(tables.commands.remove(trigger).is_some())
    }

    fn check_removable(tables: &Tables, trigger: &str) -> Result<(), RegistryError> {
        if tables.aliases.contains_key(trigger) {
            return Err(RegistryError::Protected(trigger.to_string()));
        }
        match tables.commands.get(trigger) {
            Some(existing) if !existing.removable => Err(RegistryError::Protected(trigger.to_string())),
            _ => Ok(()),
        }
    }

    /// 正規トリガー名一覧を辞書順で取得（エイリアスは含まない）
    pub fn names(&self) -> Vec<String> {
        let tables = self.tables.read();
        let mut names: Vec<String> = tables.commands.keys().cloned().collect();
        names.sort();
        names
    }

    /// 正規トリガーに対するエイリアス一覧
    pub fn aliases_of(&self, canonical: &str) -> Vec<String> {
        self.tables
            .read()
            .reverse_aliases
            .get(canonical)
            .cloned()
            .unwrap_or_default()
    }

    /// 登録済みかチェック（エイリアスも含む）
    pub fn contains(&self, trigger: &str) -> bool {
        self.resolve(trigger).is_some()
    }

    /// コマンド数を取得
    pub fn len(&self) -> usize {
        self.tables.read().commands.len()
    }

    /// 空かチェック
    pub fn is_empty(&self) -> bool {
        self.tables.read().commands.is_empty()
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Builtin;

    fn text(value: &str) -> CommandEntry {
        CommandEntry::stored_text(value)
    }

    #[test]
    fn test_registry() {
        let registry = CommandRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.resolve("anything").is_none());
    }

    #[test]
    fn test_declare_and_undeclare() {
        let registry = CommandRegistry::new();
        registry.declare("hello", text("Hi"));
        assert!(registry.contains("hello"));

        registry.undeclare("hello");
        assert!(!registry.contains("hello"));
    }

    #[test]
    fn test_alias_resolves_to_same_entry() {
        let registry = CommandRegistry::new();
        registry.declare("help", CommandEntry::constant(Builtin::Help));
        registry.declare_alias("halp", "help").unwrap();

        let canonical = registry.resolve("help").unwrap();
        let aliased = registry.resolve("halp").unwrap();
        assert!(Arc::ptr_eq(&canonical, &aliased));
        assert_eq!(registry.aliases_of("help"), vec!["halp"]);
    }

    #[test]
    fn test_alias_to_unknown_is_error() {
        let registry = CommandRegistry::new();
        let err = registry.declare_alias("halp", "help").unwrap_err();
        assert!(matches!(err, RegistryError::UnknownAliasTarget { .. }));
    }

    #[test]
    fn test_aliases_do_not_chain() {
        let registry = CommandRegistry::new();
        registry.declare("help", CommandEntry::constant(Builtin::Help));
        registry.declare_alias("halp", "help").unwrap();
        // エイリアスはエントリではないので、エイリアスへのエイリアスは作れない
        assert!(registry.declare_alias("hlp", "halp").is_err());
    }

    #[test]
    fn test_names_sorted_without_aliases() {
        let registry = CommandRegistry::new();
        registry.declare("zeta", text("z"));
        registry.declare("help", CommandEntry::constant(Builtin::Help));
        registry.declare("alpha", text("a"));
        registry.declare_alias("halp", "help").unwrap();

        assert_eq!(registry.names(), vec!["alpha", "help", "zeta"]);
    }

    #[test]
    fn test_try_declare_rejects_protected() {
        let registry = CommandRegistry::new();
        registry.declare("help", CommandEntry::constant(Builtin::Help));
        registry.declare_alias("halp", "help").unwrap();

        let mut persisted = false;
        let err = registry
            .try_declare("help", text("shadow"), || {
                persisted = true;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, RegistryError::Protected(_)));
        assert!(!persisted);

        assert!(registry.try_declare("halp", text("shadow"), || Ok(())).is_err());
        assert!(!registry.resolve("help").unwrap().removable);
    }

    #[test]
    fn test_try_declare_replaces_removable() {
        let registry = CommandRegistry::new();
        registry.try_declare("hello", text("one"), || Ok(())).unwrap();
        registry.try_declare("hello", text("two"), || Ok(())).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_try_declare_skips_swap_when_persist_fails() {
        let registry = CommandRegistry::new();
        let result = registry.try_declare("hello", text("one"), || {
            Err(StoreError::Io {
                path: "commands.json".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            })
        });
        assert!(result.is_err());
        assert!(!registry.contains("hello"));
    }

    #[test]
    fn test_try_undeclare() {
        let registry = CommandRegistry::new();
        registry.declare("help", CommandEntry::constant(Builtin::Help));
        registry.declare("hello", text("Hi"));

        assert!(registry.try_undeclare("help", || Ok(())).is_err());
        assert!(registry.try_undeclare("hello", || Ok(())).unwrap());
        assert!(!registry.try_undeclare("hello", || Ok(())).unwrap());
    }

    #[test]
    fn test_concurrent_resolve_and_replace() {
        let registry = CommandRegistry::new();
        registry.declare("help", CommandEntry::constant(Builtin::Help));
        registry.declare_alias("halp", "help").unwrap();

        std::thread::scope(|scope| {
            for writer in 0..4 {
                let registry = &registry;
                scope.spawn(move || {
                    for round in 0..200 {
                        let value = format!("w{}r{}", writer, round);
                        registry.try_declare("hello", text(&value), || Ok(())).unwrap();
                        if round % 3 == 0 {
                            registry.try_undeclare("hello", || Ok(())).unwrap();
                        }
                    }
                    registry.try_declare("hello", text("done"), || Ok(())).unwrap();
                });
            }
            for _ in 0..4 {
                let registry = &registry;
                scope.spawn(move || {
                    for _ in 0..500 {
                        let help = registry.resolve("help").unwrap();
                        let halp = registry.resolve("halp").unwrap();
                        assert!(Arc::ptr_eq(&help, &halp));
                        if let Some(entry) = registry.resolve("hello") {
                            assert!(entry.removable);
                            assert!(matches!(&entry.backend, Backend::Text(t) if t.starts_with('w') || t == "done"));
                        }
                    }
                });
            }
        });

        let hello = registry.resolve("hello").unwrap();
        assert!(matches!(&hello.backend, Backend::Text(t) if t == "done"));
        assert_eq!(registry.names(), vec!["hello", "help"]);
    }
}
