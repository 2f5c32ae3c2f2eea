use std::time::Duration;

use crate::{
    error::{Error, Result},
    log_buffer::LogSink,
    supervisor::ProcessHandle,
};

/// Shell control syntax, never forwarded to a bot.
const STRIPPED: &[char] = &[';', '&', '|', '`', '$', '(', ')', '{', '}', '<', '>'];

/// Normalises a console command: drops shell metacharacters and control
/// characters (including newlines, so one command is one stdin line), trims,
/// and caps the length at `max_chars` characters.
pub fn sanitize(raw: &str, max_chars: usize) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !STRIPPED.contains(c) && !c.is_control())
        .collect();
    cleaned.trim().chars().take(max_chars).collect()
}

/// Sanitises `raw`, writes it to the bot's stdin as one line and echoes it
/// into the log. Returns the text that was actually sent.
pub async fn deliver(
    handle: &ProcessHandle,
    sink: &LogSink,
    raw: &str,
    max_chars: usize,
    write_timeout: Duration,
) -> Result<String> {
    let cmd = sanitize(raw, max_chars);
    if cmd.is_empty() {
        return Err(Error::InvalidPayload("command is empty".to_string()));
    }
    handle.write_stdin(&format!("{cmd}\n"), write_timeout).await?;
    sink.emit(format!("> {cmd}"), false);
    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_metacharacters() {
        assert_eq!(sanitize("say hi; rm -rf / && echo $(id)", 200), "say hi rm -rf /  echo id");
        assert_eq!(sanitize("`whoami` | cat > x", 200), "whoami  cat  x");
    }

    #[test]
    fn newlines_cannot_smuggle_extra_commands() {
        assert_eq!(sanitize("first\nsecond\r\n", 200), "firstsecond");
    }

    #[test]
    fn truncates_on_char_boundary() {
        let s = "é".repeat(300);
        let out = sanitize(&s, 200);
        assert_eq!(out.chars().count(), 200);
    }

    #[test]
    fn whitespace_only_becomes_empty() {
        assert_eq!(sanitize("  ;;  ", 200), "");
    }
}
