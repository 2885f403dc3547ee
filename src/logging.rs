//! Structured logging setup: header format `YYYY-MM-DD HH:MM:SS
//! [<14-char-name>] [<lvl>] <msg>`, with messages over 500 chars truncated
//! in the middle. Built on `env_logger`, matching the teacher's `log` +
//! `env_logger` pairing.

use std::io::Write;

use chrono::Local;
use env_logger::Builder;
use log::LevelFilter;

const NAME_WIDTH: usize = 14;
const MAX_MESSAGE_LEN: usize = 500;

/// Truncates `msg` in the middle with ` … ` if it exceeds 500 chars,
/// preserving the start and end.
pub fn truncate_message(msg: &str) -> String {
    let chars: Vec<char> = msg.chars().collect();
    if chars.len() <= MAX_MESSAGE_LEN {
        return msg.to_string();
    }
    let keep = (MAX_MESSAGE_LEN - 3) / 2;
    let head: String = chars[..keep].iter().collect();
    let tail: String = chars[chars.len() - keep..].iter().collect();
    format!("{head} … {tail}")
}

fn fit_name(name: &str) -> String {
    if name.chars().count() >= NAME_WIDTH {
        name.chars().take(NAME_WIDTH).collect()
    } else {
        format!("{name:<NAME_WIDTH$}")
    }
}

/// Installs the process-wide logger. `level` and per-target overrides come
/// from `SIPHON_DEBUG` / `SIPHON_DEBUG_PARAMS` via [`crate::config::env`].
pub fn init(default_level: LevelFilter, debug_targets: &[String]) {
    let mut builder = Builder::new();
    builder.filter_level(default_level);
    for target in debug_targets {
        builder.filter_module(target, LevelFilter::Debug);
    }
    builder.format(|buf, record| {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let name = fit_name(record.target());
        let msg = truncate_message(&record.args().to_string());
        writeln!(buf, "{timestamp} [{name}] [{:<5}] {msg}", record.level())
    });
    let _ = builder.try_init();
}
