//! 引用ログの検索と整形

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::store::Store;

/// 該当なしのときの応答
pub const NONE_FOUND: &str = "None Found";

/// 引用番号を解釈（`#3` / `3`）
pub fn parse_number(input: &str) -> Option<u64> {
    let trimmed = input.trim();
    trimmed.strip_prefix('#').unwrap_or(trimmed).parse().ok()
}

/// 引用を検索
///
/// - 空: 空でない引用からランダム
/// - `#N`: N番の引用そのもの
/// - それ以外: 大文字小文字を無視した部分一致からランダム
pub fn lookup<R: Rng + ?Sized>(quotes: &Store, query: &str, rng: &mut R) -> String {
    let query = query.trim();

    if query.starts_with('#') {
        return match parse_number(query).and_then(|n| quotes.get(&n.to_string())) {
            Some(quote) if !quote.is_empty() => quote,
            _ => NONE_FOUND.to_string(),
        };
    }

    let needle = query.to_lowercase();
    let candidates: Vec<String> = quotes
        .entries()
        .into_iter()
        .map(|(_, v)| v)
        .filter(|v| !v.is_empty())
        .filter(|v| needle.is_empty() || v.to_lowercase().contains(&needle))
        .collect();

    candidates
        .choose(rng)
        .cloned()
        .unwrap_or_else(|| NONE_FOUND.to_string())
}

/// 保存用に「ゲーム名と日時」を付ける
///
/// 日時は秒に丸めて指定タイムゾーンで RFC822 形式にする。
pub fn format_quote(quote: &str, game: &str, now: DateTime<Utc>, tz: Tz) -> String {
    let rounded = if now.nanosecond() >= 500_000_000 {
        now + chrono::Duration::seconds(1)
    } else {
        now
    };
    let local = rounded.with_timezone(&tz);
    format!("{} [Playing {} - {}]", quote, game, local.format("%d %b %y %H:%M %Z"))
}
