//! 永続キー/バリューストア
//!
//! `<data_dir>/<name>.json` に単一のJSONオブジェクトとして保存する。
//! 変更のたびにファイル全体を書き直し、同期してから返る。

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::StoreError;

/// 文字列キー -> 文字列値の永続マップ
pub struct Store {
    /// ストア名（ファイル名）
    name: String,
    /// バックエンドファイルのパス
    path: PathBuf,
    /// メモリ上のデータ（読み書きとも同じロック下で扱う）
    data: RwLock<BTreeMap<String, String>>,
}

impl Store {
    /// ストアを開く
    ///
    /// ファイルが無ければ空で作成する。内容が壊れている場合は
    /// 警告を出して空のマップから始める。
    pub fn open(data_dir: &Path, name: &str) -> Result<Self, StoreError> {
        let path = data_dir.join(format!("{}.json", name));
        let io_err = |source| StoreError::Io {
            path: path.display().to_string(),
            source,
        };

        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir).map_err(io_err)?;
        }

        // 作成できない場合はここで失敗させる
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        let content = std::fs::read_to_string(&path).map_err(io_err)?;
        let data = if content.trim().is_empty() {
            BTreeMap::new()
        } else {
            match serde_json::from_str::<BTreeMap<String, String>>(&content) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!("Store '{}' is malformed, starting empty: {}", name, e);
                    BTreeMap::new()
                }
            }
        };

        tracing::info!("Opened store '{}' with {} keys", name, data.len());

        Ok(Self {
            name: name.to_string(),
            path,
            data: RwLock::new(data),
        })
    }

    /// 全キーを辞書順で取得
    pub fn keys(&self) -> Vec<String> {
        self.data.read().keys().cloned().collect()
    }

    /// 全エントリのスナップショットを辞書順で取得
    pub fn entries(&self) -> Vec<(String, String)> {
        self.data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.data.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// 値を追加（既存キーは上書き）
    pub fn add(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut data = self.data.write();
        data.insert(key.to_string(), value.to_string());
        self.save(&data)
    }

    /// 次の連番キーで値を追加し、そのキーを返す
    ///
    /// 連番はキー総数から始まる。空にされた値もキーとして数える。
    pub fn append(&self, value: &str) -> Result<String, StoreError> {
        let mut data = self.data.write();
        let mut counter = data.len();
        while data.contains_key(&counter.to_string()) {
            counter += 1;
        }
        let key = counter.to_string();
        data.insert(key.clone(), value.to_string());
        self.save(&data)?;
        Ok(key)
    }

    /// キーを完全に削除
    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut data = self.data.write();
        data.remove(key);
        self.save(&data)
    }

    /// 値を空文字列で上書きする（キーは残す）
    ///
    /// キーが存在したかどうかを返す。
    pub fn blank(&self, key: &str) -> Result<bool, StoreError> {
        let mut data = self.data.write();
        match data.get_mut(key) {
            Some(value) => {
                value.clear();
                self.save(&data)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// ファイル全体を書き直す
    ///
    /// 一時ファイルに書いて同期した後にリネームする。失敗してもメモリ上の
    /// 変更は残り、次の保存で書き出される。
    fn save(&self, data: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let json = serde_json::to_string(data).map_err(|source| StoreError::Encode {
            name: self.name.clone(),
            source,
        })?;

        let io_err = |source| StoreError::Io {
            path: self.path.display().to_string(),
            source,
        };

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(json.as_bytes()).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;

        tracing::debug!("Saved store '{}' ({} keys)", self.name, data.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_add_and_reload() {
        let temp_dir = tempdir().unwrap();

        let store = Store::open(temp_dir.path(), "commands").unwrap();
        store.add("hello", "Hi there!").unwrap();
        drop(store);

        let reopened = Store::open(temp_dir.path(), "commands").unwrap();
        assert_eq!(reopened.get("hello").as_deref(), Some("Hi there!"));
        assert_eq!(reopened.get("missing"), None);
    }

    #[test]
    fn test_append_numbering_survives_blank() {
        let temp_dir = tempdir().unwrap();
        let store = Store::open(temp_dir.path(), "quotes").unwrap();

        assert_eq!(store.append("first").unwrap(), "0");
        assert_eq!(store.append("second").unwrap(), "1");

        assert!(store.blank("0").unwrap());
        assert_eq!(store.get("0").as_deref(), Some(""));
        assert_eq!(store.append("third").unwrap(), "2");

        assert!(!store.blank("42").unwrap());
        assert!(!store.contains("42"));
    }

    #[test]
    fn test_append_skips_used_keys() {
        let temp_dir = tempdir().unwrap();
        let store = Store::open(temp_dir.path(), "quotes").unwrap();

        store.add("1", "manually added").unwrap();
        assert_eq!(store.append("next").unwrap(), "2");
    }

    #[test]
    fn test_keys_sorted() {
        let temp_dir = tempdir().unwrap();
        let store = Store::open(temp_dir.path(), "commands").unwrap();

        store.add("zeta", "z").unwrap();
        store.add("alpha", "a").unwrap();
        store.add("mid", "m").unwrap();

        assert_eq!(store.keys(), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_remove() {
        let temp_dir = tempdir().unwrap();
        let store = Store::open(temp_dir.path(), "commands").unwrap();

        store.add("temp", "value").unwrap();
        store.remove("temp").unwrap();
        assert!(store.is_empty());

        let reopened = Store::open(temp_dir.path(), "commands").unwrap();
        assert!(!reopened.contains("temp"));
    }

    #[test]
    fn test_malformed_file_starts_empty() {
        let temp_dir = tempdir().unwrap();
        std::fs::write(temp_dir.path().join("quotes.json"), "{not json").unwrap();

        let store = Store::open(temp_dir.path(), "quotes").unwrap();
        assert!(store.is_empty());
        assert_eq!(store.append("fresh").unwrap(), "0");
    }

    #[test]
    fn test_missing_directory_is_created() {
        let temp_dir = tempdir().unwrap();
        let nested = temp_dir.path().join("data").join("stores");

        let store = Store::open(&nested, "eventmessages").unwrap();
        assert!(store.is_empty());
        assert!(nested.join("eventmessages.json").exists());
    }
}
