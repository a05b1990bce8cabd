//! Luaスクリプト実行エンジン
//!
//! 全スクリプトで1つのインタプリタを共有する。ファイル・プロセス・ネットワーク・
//! コルーチン系のライブラリは読み込まない。
//!
//! 各実行は共有グローバルの複製から作った環境テーブルで動き、
//! スクリプトから共有テーブルへは到達できない。

use mlua::{HookTriggers, Lua, LuaOptions, StdLib, Table, Value, Variadic, VmState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::commands::{Invocation, Sender};
use crate::config::ScriptConfig;
use crate::error::ScriptError;

/// 引数文字列のグローバル名
pub const ARGS_GLOBAL: &str = "args";
/// 送信者の表示名
pub const USER_GLOBAL: &str = "user";
/// 送信者がモデレーターかどうか
pub const MOD_GLOBAL: &str = "is_mod";
/// 送信者がサブスクライバーかどうか
pub const SUB_GLOBAL: &str = "is_sub";
/// 出力を設定するコールバック
pub const REPLY_GLOBAL: &str = "reply";

/// 呼び出しごとに設定・消去されるグローバル
const CONTEXT_GLOBALS: &[&str] = &[ARGS_GLOBAL, USER_GLOBAL, MOD_GLOBAL, SUB_GLOBAL, REPLY_GLOBAL];

/// サンドボックスから取り除く基本ライブラリ関数
const REMOVED_BASE_FUNCTIONS: &[&str] = &["dofile", "loadfile", "load", "print"];

/// フック呼び出し間隔（命令数）
const HOOK_INTERVAL: u32 = 1000;

const BUDGET_MESSAGE: &str = "instruction budget exceeded";

/// 予算超過後は pcall/xpcall で捕まえても再送出する
const PROTECTED_CALL_WRAPPERS: &str = r#"
local exceeded, message = ...
local raw_pcall, raw_xpcall, raise = pcall, xpcall, error
local function check(ok, ...)
    if not ok and exceeded() then
        raise(message, 0)
    end
    return ok, ...
end
pcall = function(...) return check(raw_pcall(...)) end
xpcall = function(...) return check(raw_xpcall(...)) end
"#;

/// 1回の実行あたりの命令数予算
struct Budget {
    limit: u64,
    used: AtomicU64,
    exceeded: AtomicBool,
}

impl Budget {
    fn reset(&self) {
        self.used.store(0, Ordering::Relaxed);
        self.exceeded.store(false, Ordering::Relaxed);
    }

    fn is_exceeded(&self) -> bool {
        self.exceeded.load(Ordering::Relaxed)
    }

    /// フックから呼ばれる。予算を超えたらtrue
    fn tick(&self) -> bool {
        let used = self.used.fetch_add(u64::from(HOOK_INTERVAL), Ordering::Relaxed)
            + u64::from(HOOK_INTERVAL);
        if used > self.limit {
            self.exceeded.store(true, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

/// 共有インタプリタ
///
/// `run` は引数のバインド、実行、バインド解除までを1つのロック下で行う。
/// 並行して呼ばれても実行は1つずつ直列化される。非同期側からは
/// `invoke` / `check` を使い、ブロッキングスレッドで実行する。
pub struct ScriptEngine {
    lua: Mutex<Lua>,
    budget: Arc<Budget>,
}

impl ScriptEngine {
    /// 制限付きのインタプリタを作成
    pub fn new(config: &ScriptConfig) -> Result<Self, ScriptError> {
        let libs = StdLib::STRING | StdLib::TABLE | StdLib::MATH | StdLib::UTF8;
        let lua = Lua::new_with(libs, LuaOptions::default())
            .map_err(|e| ScriptError::Runtime(describe(&e)))?;

        let budget = Arc::new(Budget {
            limit: config.instruction_limit,
            used: AtomicU64::new(0),
            exceeded: AtomicBool::new(false),
        });

        Self::restrict(&lua, &budget).map_err(|e| ScriptError::Runtime(describe(&e)))?;

        if config.memory_limit > 0 {
            lua.set_memory_limit(config.memory_limit)
                .map_err(|e| ScriptError::Runtime(describe(&e)))?;
        }

        if config.instruction_limit > 0 {
            let hook_budget = Arc::clone(&budget);
            lua.set_hook(
                HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
                move |_, _| {
                    // 超過後は毎回失敗させる
                    if hook_budget.tick() {
                        Err(mlua::Error::runtime(BUDGET_MESSAGE))
                    } else {
                        Ok(VmState::Continue)
                    }
                },
            );
        }

        tracing::info!(
            "Script engine ready (instruction limit: {}, memory limit: {} bytes)",
            config.instruction_limit,
            config.memory_limit
        );

        Ok(Self {
            lua: Mutex::new(lua),
            budget,
        })
    }

    /// ファイル読み込み・コード読み込み・標準出力を取り除き、
    /// 予算超過を捕まえられないようにする
    fn restrict(lua: &Lua, budget: &Arc<Budget>) -> mlua::Result<()> {
        let globals = lua.globals();
        for name in REMOVED_BASE_FUNCTIONS {
            globals.set(*name, mlua::Nil)?;
        }
        // printはログに流す
        let print = lua.create_function(|_, values: Variadic<String>| {
            tracing::debug!("[lua] {}", values.join("\t"));
            Ok(())
        })?;
        globals.set("print", print)?;

        let wrapper_budget = Arc::clone(budget);
        let exceeded = lua.create_function(move |_, ()| Ok(wrapper_budget.is_exceeded()))?;
        lua.load(PROTECTED_CALL_WRAPPERS)
            .set_name("=sandbox")
            .call::<()>((exceeded, BUDGET_MESSAGE))?;

        // 文字列メタテーブル（共有のstringライブラリ）を隠す
        lua.load(r#"getmetatable("").__metatable = false"#).exec()
    }

    /// スクリプトをコンパイルのみ行い、構文エラーを検出する
    pub fn compile(&self, name: &str, source: &str) -> Result<(), ScriptError> {
        let lua = self.lua.lock();
        lua.load(source)
            .set_name(format!("={}", name))
            .into_function()
            .map(|_| ())
            .map_err(|e| ScriptError::Compile(describe(&e)))
    }

    /// `compile` をブロッキングスレッドで行う
    pub async fn check(self: &Arc<Self>, name: &str, source: &str) -> Result<(), ScriptError> {
        let engine = Arc::clone(self);
        let name = name.to_string();
        let source = source.to_string();
        tokio::task::spawn_blocking(move || engine.compile(&name, &source))
            .await
            .map_err(|e| ScriptError::Runtime(format!("script task failed: {}", e)))?
    }

    /// `run` をブロッキングスレッドで行う
    ///
    /// ロック待ちや長い実行で非同期ワーカーを止めない。
    pub async fn invoke(
        self: &Arc<Self>,
        name: &str,
        source: &str,
        invocation: &Invocation<'_>,
    ) -> Result<String, ScriptError> {
        let engine = Arc::clone(self);
        let name = name.to_string();
        let source = source.to_string();
        let argument = invocation.argument.to_string();
        let sender: Option<Sender> = invocation.sender.cloned();

        tokio::task::spawn_blocking(move || {
            engine.run(&name, &source, &Invocation::new(&argument, sender.as_ref()))
        })
        .await
        .map_err(|e| ScriptError::Runtime(format!("script task failed: {}", e)))?
    }

    /// スクリプトを実行し、`reply` で設定された出力を返す
    ///
    /// 成否にかかわらず、設定したグローバルはすべて消去してから返る。
    pub fn run(&self, name: &str, source: &str, invocation: &Invocation<'_>) -> Result<String, ScriptError> {
        let lua = self.lua.lock();
        self.budget.reset();

        let output = Arc::new(Mutex::new(String::new()));
        let result = Self::bind(&lua, invocation, Arc::clone(&output))
            .and_then(|_| Self::execute(&lua, name, source));

        if let Err(e) = Self::unbind(&lua) {
            tracing::error!("Failed to clear script context for '{}': {}", name, e);
        }

        match result {
            Ok(()) => Ok(std::mem::take(&mut *output.lock())),
            Err(_) if self.budget.is_exceeded() => {
                tracing::warn!("Script '{}' exceeded its instruction budget", name);
                Err(ScriptError::BudgetExceeded(self.budget.limit))
            }
            Err(e) => {
                tracing::debug!("Script '{}' failed: {}", name, e);
                Err(ScriptError::Runtime(describe(&e)))
            }
        }
    }

    fn bind(lua: &Lua, invocation: &Invocation<'_>, output: Arc<Mutex<String>>) -> mlua::Result<()> {
        let globals = lua.globals();
        globals.set(ARGS_GLOBAL, invocation.argument)?;

        if let Some(sender) = invocation.sender {
            globals.set(USER_GLOBAL, sender.display_name.as_str())?;
            globals.set(MOD_GLOBAL, sender.privileged)?;
            globals.set(SUB_GLOBAL, sender.subscriber)?;
        }

        let reply = lua.create_function(move |_, values: Variadic<String>| {
            if values.len() != 1 {
                return Err(mlua::Error::runtime(format!(
                    "reply expects exactly one argument, got {}",
                    values.len()
                )));
            }
            *output.lock() = values[0].clone();
            Ok(())
        })?;
        globals.set(REPLY_GLOBAL, reply)
    }

    /// 呼び出しごとの環境テーブルで実行する
    fn execute(lua: &Lua, name: &str, source: &str) -> mlua::Result<()> {
        let env = Self::sandbox_env(lua)?;
        lua.load(source)
            .set_name(format!("={}", name))
            .set_environment(env)
            .exec()
    }

    /// 共有グローバルを複製した環境を作る
    ///
    /// ライブラリのテーブルも1段複製し、`_G` は環境自身を指す。
    /// スクリプトによる書き換えはこの実行の中だけで終わる。
    fn sandbox_env(lua: &Lua) -> mlua::Result<Table> {
        let env = lua.create_table()?;
        for pair in lua.globals().pairs::<String, Value>() {
            let (key, value) = pair?;
            if key == "_G" {
                continue;
            }
            let value = match value {
                Value::Table(library) => Value::Table(copy_table(lua, &library)?),
                other => other,
            };
            env.raw_set(key, value)?;
        }
        env.raw_set("_G", env.clone())?;
        Ok(env)
    }

    fn unbind(lua: &Lua) -> mlua::Result<()> {
        let globals = lua.globals();
        for name in CONTEXT_GLOBALS {
            globals.set(*name, mlua::Nil)?;
        }
        Ok(())
    }
}

fn copy_table(lua: &Lua, source: &Table) -> mlua::Result<Table> {
    let copy = lua.create_table()?;
    for pair in source.pairs::<Value, Value>() {
        let (key, value) = pair?;
        copy.raw_set(key, value)?;
    }
    Ok(copy)
}

/// mlua のエラーを1行の診断に縮める
fn describe(err: &mlua::Error) -> String {
    let text = match err {
        mlua::Error::CallbackError { cause, .. } => cause.to_string(),
        other => other.to_string(),
    };
    text.lines().next().unwrap_or_default().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ScriptEngine {
        ScriptEngine::new(&ScriptConfig::default()).unwrap()
    }

    fn sender(name: &str, privileged: bool) -> Sender {
        Sender {
            display_name: name.to_string(),
            privileged,
            subscriber: false,
        }
    }

    #[test]
    fn test_reply_captures_output() {
        let engine = engine();
        let inv = Invocation::new("world", None);
        let out = engine.run("greet", r#"reply("hello " .. args)"#, &inv).unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn test_last_reply_wins_and_no_reply_is_empty() {
        let engine = engine();
        let inv = Invocation::new("", None);

        let out = engine.run("twice", r#"reply("a") reply("b")"#, &inv).unwrap();
        assert_eq!(out, "b");

        let out = engine.run("silent", "local x = 1 + 1", &inv).unwrap();
        assert_eq!(out, "");
    }

    #[test]
    fn test_reply_requires_one_argument() {
        let engine = engine();
        let inv = Invocation::new("", None);
        let err = engine.run("bad", r#"reply("a", "b")"#, &inv).unwrap_err();
        assert!(matches!(err, ScriptError::Runtime(_)));
    }

    #[test]
    fn test_context_does_not_leak_between_invocations() {
        let engine = engine();
        let alice = sender("Alice", true);

        let first = Invocation::new("x", Some(&alice));
        let out = engine.run("who", "reply(user .. tostring(is_mod))", &first).unwrap();
        assert_eq!(out, "Alicetrue");

        let second = Invocation::new("y", None);
        let out = engine
            .run("peek", "reply(tostring(user) .. tostring(is_mod) .. tostring(is_sub))", &second)
            .unwrap();
        assert_eq!(out, "nilnilnil");
    }

    #[test]
    fn test_globals_cleared_after_failure() {
        let engine = engine();
        let bob = sender("Bob", false);

        let inv = Invocation::new("boom", Some(&bob));
        assert!(engine.run("fail", "error('nope')", &inv).is_err());

        let inv = Invocation::new("", None);
        let out = engine
            .run("peek", "reply(tostring(user) .. tostring(reply ~= nil))", &inv)
            .unwrap();
        assert_eq!(out, "niltrue");
    }

    #[test]
    fn test_script_globals_do_not_persist() {
        let engine = engine();
        let inv = Invocation::new("", None);

        engine.run("set", "counter = 41", &inv).unwrap();
        let out = engine.run("get", "reply(tostring(counter))", &inv).unwrap();
        assert_eq!(out, "nil");
    }

    #[test]
    fn test_sandbox_has_no_io() {
        let engine = engine();
        let inv = Invocation::new("", None);
        let out = engine
            .run(
                "peek",
                "reply(tostring(io) .. tostring(os) .. tostring(require) .. tostring(coroutine) .. tostring(dofile) .. tostring(load))",
                &inv,
            )
            .unwrap();
        assert_eq!(out, "nilnilnilnilnilnil");

        let out = engine
            .run("libs", "reply(string.upper('ok') .. math.floor(2.5) .. #table.concat({'a','b'}) .. (6 & 3))", &inv)
            .unwrap();
        assert_eq!(out, "OK222");
    }

    #[test]
    fn test_compile_error_is_reported() {
        let engine = engine();
        let err = engine.compile("broken", "reply(").unwrap_err();
        assert!(matches!(err, ScriptError::Compile(_)));
        assert!(engine.compile("fine", "reply('ok')").is_ok());
    }

    #[test]
    fn test_runaway_script_hits_budget() {
        let config = ScriptConfig {
            instruction_limit: 100_000,
            ..ScriptConfig::default()
        };
        let engine = ScriptEngine::new(&config).unwrap();
        let inv = Invocation::new("", None);

        let err = engine.run("spin", "while true do end", &inv).unwrap_err();
        assert!(matches!(err, ScriptError::BudgetExceeded(100_000)));

        // 予算は呼び出しごとにリセットされる
        let out = engine.run("after", "reply('ok')", &inv).unwrap();
        assert_eq!(out, "ok");
    }

    #[test]
    fn test_budget_cannot_be_caught() {
        let config = ScriptConfig {
            instruction_limit: 100_000,
            ..ScriptConfig::default()
        };
        let engine = ScriptEngine::new(&config).unwrap();
        let inv = Invocation::new("", None);

        let source = "local n = 0 \
                      while n < 5000 do pcall(function() while true do end end) n = n + 1 end \
                      reply('survived ' .. n)";
        let err = engine.run("trap", source, &inv).unwrap_err();
        assert!(matches!(err, ScriptError::BudgetExceeded(100_000)), "{:?}", err);

        let source = "while true do xpcall(function() while true do end end, function(e) return e end) end";
        let err = engine.run("trap", source, &inv).unwrap_err();
        assert!(matches!(err, ScriptError::BudgetExceeded(100_000)), "{:?}", err);

        // 通常のエラーはこれまで通り捕まえられる
        let out = engine
            .run("caught", "local ok, e = pcall(error, 'x') reply(tostring(ok) .. e)", &inv)
            .unwrap();
        assert_eq!(out, "falsex");
    }

    #[test]
    fn test_shared_tables_are_not_writable() {
        let engine = engine();
        let inv = Invocation::new("", None);

        engine
            .run(
                "tamper",
                "_G.counter = 41 rawset(_G, 'other', 1) string.upper = function() return 'pwned' end",
                &inv,
            )
            .unwrap();

        let out = engine
            .run(
                "check",
                "reply(tostring(counter) .. ' ' .. tostring(other) .. ' ' .. string.upper('x') .. ' ' .. ('y'):upper())",
                &inv,
            )
            .unwrap();
        assert_eq!(out, "nil nil X Y");

        // 文字列メソッド経由でも共有ライブラリには届かない
        let out = engine.run("meta", "reply(tostring(getmetatable('')))", &inv).unwrap();
        assert_eq!(out, "false");
    }

    #[test]
    fn test_tampering_stays_within_one_run() {
        let engine = engine();
        let inv = Invocation::new("", None);
        let out = engine
            .run("local", "string.upper = function() return 'mine' end reply(string.upper('x'))", &inv)
            .unwrap();
        assert_eq!(out, "mine");
    }

    #[tokio::test]
    async fn test_invoke_runs_off_the_async_worker() {
        let engine = Arc::new(engine());
        let alice = sender("Alice", false);
        let inv = Invocation::new("hi", Some(&alice));

        let out = engine.invoke("greet", "reply(user .. ' says ' .. args)", &inv).await.unwrap();
        assert_eq!(out, "Alice says hi");

        assert!(engine.check("ok", "reply('x')").await.is_ok());
        assert!(matches!(engine.check("bad", "reply(").await, Err(ScriptError::Compile(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_invocations_do_not_mix_context() {
        let engine = Arc::new(engine());
        let source = "local s = 0 for i = 1, 2000 do s = s + i end reply(user .. ':' .. args)";

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    let who = sender(&format!("user{}", i), false);
                    let argument = format!("arg{}", i);
                    let inv = Invocation::new(&argument, Some(&who));
                    engine.invoke("echo", source, &inv).await
                })
            })
            .collect();

        for (i, task) in tasks.into_iter().enumerate() {
            let out = task.await.unwrap().unwrap();
            assert_eq!(out, format!("user{}:arg{}", i, i));
        }
    }
}
