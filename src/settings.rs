//! Tournament timing and tolerance configuration.
//!
//! Settings can be created programmatically with [`TournamentSettings::new()`]
//! or from environment variables with [`TournamentSettings::from_env()`].
//! There is no live reconfiguration: the referee captures the settings at
//! construction.
//!
//! # Environment Variables
//!
//! All values are optional; unset or unparseable variables fall back to the
//! defaults.
//!
//! - `REFEREE_TIMEOUT_READY_MS` — deadline for the handshake reply (default: `200`)
//! - `REFEREE_TIMEOUT_START_MS` — deadline for the per-match start reply (default: `100`)
//! - `REFEREE_TIMEOUT_ACT_MS` — deadline for an acting player's move (default: `100`)
//! - `REFEREE_TIMEOUT_PONDER_MS` — deadline for a ponder reply (default: `50`)
//! - `REFEREE_TIMEOUT_MATCH_OVER_MS` — deadline for the end-of-match acknowledgement (default: `100`)
//! - `REFEREE_TIME_TOURNAMENT_OVER_MS` — grace delay after the tournament-over message (default: `100`)
//! - `REFEREE_MAX_INVALID_BEHAVIORS` — per-match error budget (default: `1`)
//! - `REFEREE_DISQUALIFICATION_RATE` — tolerated fraction of corrupted matches (default: `0.1`)

use std::{env, time::Duration};

use anyhow::bail;

/// Deadlines and misbehavior tolerances applied to every bot.
#[derive(Debug, Clone)]
pub struct TournamentSettings {
    /// Deadline for the initial handshake reply.
    pub timeout_ready: Duration,
    /// Deadline for the per-match start reply.
    pub timeout_start: Duration,
    /// Deadline for an acting player's move reply.
    pub timeout_act: Duration,
    /// Deadline for a non-acting player's ponder reply. Never exceeds
    /// `timeout_act`.
    pub timeout_ponder: Duration,
    /// Deadline for the end-of-match acknowledgement.
    pub timeout_match_over: Duration,
    /// Grace delay after sending the tournament-over message.
    pub time_tournament_over: Duration,
    /// Per-match error budget above which a bot's moves are replaced by
    /// uniform-random legal moves.
    pub max_invalid_behaviors: u32,
    /// Fraction of matches a bot may corrupt before being disqualified.
    pub disqualification_rate: f64,
}

impl TournamentSettings {
    /// Create settings with the default parameters.
    pub fn new() -> Self {
        Self {
            timeout_ready: Duration::from_millis(200),
            timeout_start: Duration::from_millis(100),
            timeout_act: Duration::from_millis(100),
            timeout_ponder: Duration::from_millis(50),
            timeout_match_over: Duration::from_millis(100),
            time_tournament_over: Duration::from_millis(100),
            max_invalid_behaviors: 1,
            disqualification_rate: 0.1,
        }
    }

    /// Create settings from environment variables, falling back to the
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        fn get_env_millis(var: &str, default: Duration) -> Duration {
            match env::var(var).ok().and_then(|v| v.parse::<u64>().ok()) {
                Some(ms) => Duration::from_millis(ms),
                None => default,
            }
        }

        let defaults = Self::new();
        Self {
            timeout_ready: get_env_millis("REFEREE_TIMEOUT_READY_MS", defaults.timeout_ready),
            timeout_start: get_env_millis("REFEREE_TIMEOUT_START_MS", defaults.timeout_start),
            timeout_act: get_env_millis("REFEREE_TIMEOUT_ACT_MS", defaults.timeout_act),
            timeout_ponder: get_env_millis("REFEREE_TIMEOUT_PONDER_MS", defaults.timeout_ponder),
            timeout_match_over: get_env_millis(
                "REFEREE_TIMEOUT_MATCH_OVER_MS",
                defaults.timeout_match_over,
            ),
            time_tournament_over: get_env_millis(
                "REFEREE_TIME_TOURNAMENT_OVER_MS",
                defaults.time_tournament_over,
            ),
            max_invalid_behaviors: env::var("REFEREE_MAX_INVALID_BEHAVIORS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_invalid_behaviors),
            disqualification_rate: env::var("REFEREE_DISQUALIFICATION_RATE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.disqualification_rate),
        }
    }

    /// Set the handshake deadline.
    pub fn with_timeout_ready(mut self, value: Duration) -> Self {
        self.timeout_ready = value;
        self
    }

    /// Set the per-match start deadline.
    pub fn with_timeout_start(mut self, value: Duration) -> Self {
        self.timeout_start = value;
        self
    }

    /// Set the acting deadline.
    pub fn with_timeout_act(mut self, value: Duration) -> Self {
        self.timeout_act = value;
        self
    }

    /// Set the ponder deadline.
    pub fn with_timeout_ponder(mut self, value: Duration) -> Self {
        self.timeout_ponder = value;
        self
    }

    /// Set the end-of-match acknowledgement deadline.
    pub fn with_timeout_match_over(mut self, value: Duration) -> Self {
        self.timeout_match_over = value;
        self
    }

    /// Set the grace delay after the tournament-over message.
    pub fn with_time_tournament_over(mut self, value: Duration) -> Self {
        self.time_tournament_over = value;
        self
    }

    /// Set the per-match error budget.
    pub fn with_max_invalid_behaviors(mut self, value: u32) -> Self {
        self.max_invalid_behaviors = value;
        self
    }

    /// Set the tolerated fraction of corrupted matches.
    pub fn with_disqualification_rate(mut self, value: f64) -> Self {
        self.disqualification_rate = value;
        self
    }

    /// Check internal consistency.
    ///
    /// # Errors
    /// Returned when the ponder deadline exceeds the acting deadline, or the
    /// disqualification rate lies outside `[0, 1]`.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.timeout_ponder > self.timeout_act {
            bail!(
                "timeout_ponder ({:?}) must not exceed timeout_act ({:?})",
                self.timeout_ponder,
                self.timeout_act
            );
        }
        if !(0.0..=1.0).contains(&self.disqualification_rate) {
            bail!(
                "disqualification_rate must lie in [0, 1], got {}",
                self.disqualification_rate
            );
        }
        Ok(())
    }
}

impl Default for TournamentSettings {
    fn default() -> Self {
        Self::new()
    }
}
