//! Twitch IRC

pub mod client;
pub mod message;

pub use client::{format_privmsg, run, Connection, Outcome};
pub use message::Message;

/// RECONNECT要求時の終了コード（外側のスーパーバイザーが再起動する）
pub const RECONNECT_EXIT_CODE: i32 = 69;
