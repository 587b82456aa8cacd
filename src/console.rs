//! Line-oriented command console for `link-controller`.
//!
//! # Commands
//!
//! - `send <text>` - Write `text` to the peripheral
//! - `hex <bytes>` - Write raw bytes given as hex (`01 ff` or `01ff`)
//! - `status` - Show session state and counters
//! - `help` - Show available commands
//! - `quit` - Stop the session and exit
//!
//! # Example Session
//!
//! ```text
//! > send mokaon
//! Queued 6 bytes
//! Delivered 6 bytes
//! > status
//! Session Status:
//!   State: idle (active)
//!   ...
//! ```

use crate::stats::SessionStats;
use std::sync::atomic::Ordering;

/// Parsed console command.
#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Write a payload.
    Send(Vec<u8>),
    /// Show session status.
    Status,
    /// Show help.
    Help,
    /// Exit.
    Quit,
    /// Unknown or invalid command, with a message for the user.
    Unknown(String),
}

impl ConsoleCommand {
    /// Parse a command from an input line.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        if input.is_empty() {
            return ConsoleCommand::Unknown(String::new());
        }

        let mut parts = input.splitn(2, ' ');
        let cmd = parts.next().unwrap_or("");
        let args = parts.next().unwrap_or("").trim();

        match cmd.to_lowercase().as_str() {
            "send" | "s" => {
                if args.is_empty() {
                    ConsoleCommand::Unknown("Usage: send <text>".to_string())
                } else {
                    ConsoleCommand::Send(args.as_bytes().to_vec())
                }
            }
            "hex" | "x" => match parse_hex(args) {
                Some(bytes) if !bytes.is_empty() => ConsoleCommand::Send(bytes),
                _ => ConsoleCommand::Unknown("Usage: hex <bytes>, e.g. hex 01 ff 7a".to_string()),
            },
            "status" | "st" => ConsoleCommand::Status,
            "help" | "h" | "?" => ConsoleCommand::Help,
            "quit" | "exit" | "q" => ConsoleCommand::Quit,
            _ => ConsoleCommand::Unknown(format!(
                "Unknown command: {}. Type 'help' for commands.",
                cmd
            )),
        }
    }
}

/// Parse hex digits, ignoring whitespace. `None` on odd length or bad digits.
fn parse_hex(input: &str) -> Option<Vec<u8>> {
    let digits: Vec<char> = input.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return None;
    }
    digits
        .chunks(2)
        .map(|pair| {
            let hi = pair[0].to_digit(16)?;
            let lo = pair[1].to_digit(16)?;
            Some((hi * 16 + lo) as u8)
        })
        .collect()
}

/// Help text for available commands.
pub const HELP_TEXT: &str = r#"
Available commands:
  send <text>    Write text to the peripheral
  hex <bytes>    Write raw bytes given as hex
  status         Show session state and counters
  help           Show this help
  quit           Stop and exit

Shortcuts: s=send, x=hex, st=status, h=help, q=quit

Commands written while disconnected are queued and sent once connected.
"#;

/// Format session status for display.
pub fn format_status(stats: &SessionStats) -> String {
    format!(
        "Session Status:\n  State: {} ({})\n  Uptime: {}s\n  Scans: {}  Connections: {}  Writes: {}  Queued: {}\n  Failures: {} ({} in a row{})\n",
        stats.state(),
        if stats.is_active() { "active" } else { "inactive" },
        stats.uptime_secs(),
        stats.link.scans.load(Ordering::Relaxed),
        stats.link.connections.load(Ordering::Relaxed),
        stats.link.writes.load(Ordering::Relaxed),
        stats.link.queued.load(Ordering::Relaxed),
        stats.failures.total(),
        stats.consecutive_failures(),
        if stats.is_degraded() { ", degraded" } else { "" }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_send() {
        assert_eq!(
            ConsoleCommand::parse("send mokaon"),
            ConsoleCommand::Send(b"mokaon".to_vec())
        );
        assert_eq!(
            ConsoleCommand::parse("s  two words "),
            ConsoleCommand::Send(b"two words".to_vec())
        );
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(
            ConsoleCommand::parse("hex 01 ff 7A"),
            ConsoleCommand::Send(vec![0x01, 0xff, 0x7a])
        );
        assert_eq!(
            ConsoleCommand::parse("x 01ff"),
            ConsoleCommand::Send(vec![0x01, 0xff])
        );
        assert!(matches!(ConsoleCommand::parse("hex 1"), ConsoleCommand::Unknown(_)));
        assert!(matches!(ConsoleCommand::parse("hex zz"), ConsoleCommand::Unknown(_)));
        assert!(matches!(ConsoleCommand::parse("hex"), ConsoleCommand::Unknown(_)));
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(ConsoleCommand::parse("status"), ConsoleCommand::Status);
        assert_eq!(ConsoleCommand::parse("ST"), ConsoleCommand::Status);
        assert_eq!(ConsoleCommand::parse("?"), ConsoleCommand::Help);
        assert_eq!(ConsoleCommand::parse("exit"), ConsoleCommand::Quit);
    }

    #[test]
    fn test_parse_unknown_and_empty() {
        assert!(matches!(ConsoleCommand::parse("foo"), ConsoleCommand::Unknown(_)));
        assert!(matches!(ConsoleCommand::parse("send"), ConsoleCommand::Unknown(_)));
        assert_eq!(ConsoleCommand::parse("   "), ConsoleCommand::Unknown(String::new()));
    }

    #[test]
    fn test_format_status() {
        let stats = SessionStats::new(5);
        let status = format_status(&stats);
        assert!(status.contains("State: scanning (inactive)"));
        assert!(status.contains("Writes: 0"));
        assert!(!status.contains("degraded"));
    }
}
