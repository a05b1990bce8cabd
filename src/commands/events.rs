//! イベントメッセージ（サブスク時の歓迎メッセージなど）
//!
//! テンプレートはHandlebars形式で、`{{Username}}` と `{{NumberOfSubs}}` が使える。
//! 設定時にコンパイルしてエラーをその場で返し、以降はコンパイル済みのものを使う。

use handlebars::{Handlebars, Template};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashSet;

use crate::error::{CommandError, CommandResult, StoreError};
use crate::facts::FactProvider;
use crate::store::Store;

/// 新規サブスクのイベント名
pub const NEW_SUB_EVENT: &str = "newsub";

/// メッセージを設定できるイベント
pub const KNOWN_EVENTS: &[&str] = &[NEW_SUB_EVENT];

/// 外部APIでサブスク数を取得するテンプレート関数
const SUB_COUNT_FIELD: &str = "NumberOfSubs";

/// イベントメッセージ管理
pub struct EventMessages {
    store: Store,
    templates: RwLock<Compiled>,
}

struct Compiled {
    registry: Handlebars<'static>,
    /// サブスク数を参照するイベント
    needs_sub_count: HashSet<String>,
}

impl EventMessages {
    /// ストアから読み込み、保存済みテンプレートをコンパイルする
    pub fn new(store: Store) -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);

        let mut compiled = Compiled {
            registry,
            needs_sub_count: HashSet::new(),
        };

        for (event, source) in store.entries() {
            match Template::compile(&source) {
                Ok(template) => compiled.install(&event, &source, template),
                Err(e) => tracing::warn!("Skipping stored event message for '{}': {}", event, e),
            }
        }

        Self {
            store,
            templates: RwLock::new(compiled),
        }
    }

    /// メッセージを設定し、チャット用の応答を返す
    pub fn set(&self, event: &str, source: &str) -> CommandResult<String> {
        if !KNOWN_EVENTS.contains(&event) {
            return Ok(format!(
                "There's no event '{}'. Available events: {}",
                event,
                KNOWN_EVENTS.join(", ")
            ));
        }

        let template = Template::compile(source).map_err(|e| CommandError::Template(e.to_string()))?;

        // 保存と差し替えを同じロック下で行い、ストアと描画内容を一致させる
        let mut templates = self.templates.write();
        self.store.add(event, source)?;
        templates.install(event, source, template);

        tracing::info!("Event message for '{}' set", event);
        Ok(format!("Message for {} set.", event))
    }

    /// メッセージを削除し、チャット用の応答を返す
    pub fn remove(&self, event: &str) -> Result<String, StoreError> {
        let mut templates = self.templates.write();
        if !self.store.contains(event) {
            return Ok(format!("There is already no message for {}", event));
        }

        self.store.remove(event)?;
        templates.registry.unregister_template(event);
        templates.needs_sub_count.remove(event);

        Ok(format!("Message for {} removed.", event))
    }

    /// メッセージが設定されているか
    pub fn contains(&self, event: &str) -> bool {
        self.templates.read().registry.has_template(event)
    }

    /// テンプレートを描画する（未設定なら空文字列）
    ///
    /// サブスク数が必要な場合はロックを持たずに先に取得する。
    pub async fn render(
        &self,
        event: &str,
        username: &str,
        facts: &dyn FactProvider,
        channel: &str,
    ) -> CommandResult<String> {
        if !KNOWN_EVENTS.contains(&event) {
            tracing::warn!("Event '{}' is not a known event; users cannot set a message for it", event);
        }

        let needs_sub_count = {
            let templates = self.templates.read();
            if !templates.registry.has_template(event) {
                return Ok(String::new());
            }
            templates.needs_sub_count.contains(event)
        };

        let mut data = json!({ "Username": username.trim() });
        if needs_sub_count {
            let count = facts
                .subscriber_count(channel)
                .await
                .map_err(|e| CommandError::Lookup(e.to_string()))?;
            data[SUB_COUNT_FIELD] = json!(count);
        }

        let templates = self.templates.read();
        if !templates.registry.has_template(event) {
            // 取得中に削除された
            return Ok(String::new());
        }
        templates
            .registry
            .render(event, &data)
            .map_err(|e| CommandError::Template(e.to_string()))
    }
}

impl Compiled {
    fn install(&mut self, event: &str, source: &str, template: Template) {
        self.registry.register_template(event, template);
        if source.contains(SUB_COUNT_FIELD) {
            self.needs_sub_count.insert(event.to_string());
        } else {
            self.needs_sub_count.remove(event);
        }
    }
}
