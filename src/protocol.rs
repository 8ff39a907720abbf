//! The line protocol spoken between the referee and the bots.
//!
//! Every exchange is a single `\n`-terminated ASCII line. The referee sends
//! observations and control messages on the bot's stdin; the bot answers on
//! its stdout with either a reserved message or a decimal action id.

use std::fmt::Write;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;

use crate::game::Action;

/// Expected reply to the handshake.
pub const READY_MESSAGE: &str = "ready";
/// Expected reply to the start of every match.
pub const START_MESSAGE: &str = "start";
/// Expected reply of a non-acting bot each turn.
pub const PONDER_MESSAGE: &str = "ponder";
/// Sent with the final score; also the expected acknowledgement.
pub const MATCH_OVER_MESSAGE: &str = "match over";
/// Sent once after the last match; the reply is never read.
pub const TOURNAMENT_OVER_MESSAGE: &str = "tournament over";

/// The two handshake lines: game name, then the seat as a single digit.
pub fn handshake_lines(game_name: &str, seat: usize) -> String {
    assert!(seat < 10, "seat index must fit a single digit");
    format!("{game_name}\n{seat}\n")
}

/// One observation line: base64 public tensor, base64 private tensor, and
/// the legal actions iff the bot is acting at this node.
pub fn observation_line(
    public_observation: &[u8],
    private_observation: &[u8],
    legal_actions: Option<&[Action]>,
) -> String {
    let mut line = String::new();
    line.push_str(&BASE64_STANDARD.encode(public_observation));
    line.push(' ');
    line.push_str(&BASE64_STANDARD.encode(private_observation));
    if let Some(actions) = legal_actions {
        for action in actions {
            // Infallible for String.
            let _ = write!(line, " {action}");
        }
    }
    line.push('\n');
    line
}

/// The end-of-match line carrying the bot's score truncated toward zero.
pub fn match_over_line(score: f64) -> String {
    format!("{MATCH_OVER_MESSAGE} {}\n", score as i64)
}

/// Parse a bot reply as an action id, consuming the entire string.
///
/// Trailing or leading garbage (`"3x"`, `" 3"`) yields `None` and counts as
/// a protocol error upstream.
pub fn parse_action(response: &str) -> Option<Action> {
    response.parse().ok()
}
