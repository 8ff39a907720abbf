//! # Bot Referee
//!
//! A tournament referee for arbitrary game-playing bots: it launches opaque
//! bot executables as child processes, mediates a turn-based game between
//! them over a line-delimited textual protocol with strict per-phase
//! deadlines, tolerates misbehavior (timeouts, malformed responses, illegal
//! moves), and aggregates statistics across many matches with restart and
//! disqualification policies.
//!
//! It provides:
//! - Per-bot communication channels with deadline-bounded non-blocking line
//!   reads ([`channel::BotChannel`])
//! - The per-turn protocol state machine interleaving observation dispatch,
//!   act/ponder waits, and response validation ([`referee::Referee`])
//! - Tournament-level error accounting, restarts, and disqualification
//!   ([`results::TournamentResults`])
//!
//! The game itself is an external collaborator implementing the
//! [`Game`](game::Game) and [`State`](game::State) traits; the referee never
//! knows its rules.
//!
//! # Usage Example
//!
//! ```no_run
//! use std::{path::PathBuf, sync::Arc, time::Duration};
//!
//! use bot_referee::prelude::*;
//! # fn load_game(_name: &str) -> Arc<dyn Game> { unimplemented!() }
//!
//! fn main() -> anyhow::Result<()> {
//!     bot_referee::logger::init_logger(false);
//!
//!     let settings = TournamentSettings::new()
//!         .with_timeout_act(Duration::from_secs(5))
//!         .with_timeout_ponder(Duration::from_millis(200))
//!         .with_max_invalid_behaviors(3)
//!         .with_disqualification_rate(0.1);
//!
//!     let game: Arc<dyn Game> = load_game("kuhn_poker");
//!     let executables = vec![PathBuf::from("./bot_a"), PathBuf::from("./bot_b")];
//!     let mut referee = Referee::new(game, executables, 42, settings)?;
//!
//!     let results = referee.play_tournament(100)?;
//!     print!("{}", results.verbose_summary());
//!     results.write_csv(&mut std::io::stdout(), true)?;
//!     Ok(())
//! }
//! ```
//!
//! # Bot protocol
//!
//! A bot reads its stdin line by line and answers on its stdout:
//!
//! - Handshake: the referee sends the game name and the bot's seat digit on
//!   two lines; the bot replies `ready`.
//! - Match start: the bot replies `start`.
//! - Each turn: the referee sends one line with the base64-encoded public
//!   and private observations, followed by the legal actions iff the bot is
//!   acting. An acting bot answers with a decimal action id, every other bot
//!   with `ponder`.
//! - End of match: the referee sends `match over <score>`; the bot replies
//!   `match over`.
//! - End of tournament: the referee sends `tournament over`; no reply is
//!   read.
//!
//! Anything a bot writes to stderr is forwarded to the referee's stderr,
//! prefixed with the bot index.
#![warn(missing_docs)]

pub mod channel;
pub mod game;
pub mod logger;
pub mod protocol;
pub mod referee;
pub mod results;
pub mod settings;

pub use anyhow;

/// Commonly used types and traits for quick access.
///
/// ```rust
/// use bot_referee::prelude::*;
/// ```
pub mod prelude {
    pub use crate::game::{Game, State};
    pub use crate::referee::Referee;
    pub use crate::results::{BotErrors, TournamentResults};
    pub use crate::settings::TournamentSettings;
}
