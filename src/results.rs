//! Per-bot error accounting and tournament statistics.

use std::io;

use crate::game::State;

/// How many errors of each kind a bot committed, per match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BotErrors {
    /// Missing or garbled response, unparseable action, or a wrong reserved
    /// message in the handshake/start/match-over exchanges.
    pub protocol_error: u32,
    /// Well-formed action id outside the legal set.
    pub illegal_actions: u32,
    /// Non-acting bot failed to reply `ponder` in time.
    pub ponder_error: u32,
    /// A read hit its deadline; counted in addition to the protocol or
    /// ponder error it occasioned.
    pub time_over: u32,
}

impl BotErrors {
    /// Sum of all four counters.
    pub fn total_errors(&self) -> u32 {
        self.protocol_error + self.illegal_actions + self.ponder_error + self.time_over
    }

    /// Zero all counters. Called at the beginning of every match.
    pub fn reset(&mut self) {
        *self = BotErrors::default();
    }
}

/// Outcome of a single match: the terminal state (carrying the full action
/// history and final returns) and the error counters at match end.
pub struct MatchResult {
    /// Terminal game state.
    pub terminal: Box<dyn State>,
    /// Error counters per seat, snapshotted at match end.
    pub errors: Vec<BotErrors>,
}

/// Online statistics over a whole tournament.
///
/// Per-bot return mean and variance follow Welford's algorithm so that the
/// results stay numerically stable over long tournaments.
pub struct TournamentResults {
    num_bots: usize,
    /// Every completed match, in playing order.
    pub matches: Vec<MatchResult>,
    /// Running mean of each bot's return.
    pub returns_mean: Vec<f64>,
    /// Aggregate squared deviation of each bot's return; divide by the
    /// number of matches for the population variance.
    pub returns_agg: Vec<f64>,
    /// Running mean of the match length in actions.
    pub history_len_mean: f64,
    /// How many matches each bot corrupted.
    pub corrupted_matches: Vec<u32>,
    /// Whether each bot was disqualified.
    pub disqualified: Vec<bool>,
    /// How often each bot was restarted.
    pub restarts: Vec<u32>,
}

impl TournamentResults {
    /// Empty statistics for `num_bots` seats.
    pub fn new(num_bots: usize) -> Self {
        Self {
            num_bots,
            matches: Vec::new(),
            returns_mean: vec![0.0; num_bots],
            returns_agg: vec![0.0; num_bots],
            history_len_mean: 0.0,
            corrupted_matches: vec![0; num_bots],
            disqualified: vec![false; num_bots],
            restarts: vec![0; num_bots],
        }
    }

    /// Number of seats.
    pub fn num_bots(&self) -> usize {
        self.num_bots
    }

    /// Number of completed matches.
    pub fn num_matches(&self) -> usize {
        self.matches.len()
    }

    /// Record a finished match and fold its returns and length into the
    /// running statistics.
    pub fn add_match(&mut self, terminal: Box<dyn State>, errors: Vec<BotErrors>) {
        let m = self.matches.len() as f64 + 1.0;
        let returns = terminal.returns();
        self.history_len_mean += (terminal.history().len() as f64 - self.history_len_mean) / m;
        for pl in 0..self.num_bots {
            let delta = returns[pl] - self.returns_mean[pl];
            self.returns_mean[pl] += delta / m;
            let delta2 = returns[pl] - self.returns_mean[pl];
            self.returns_agg[pl] += delta * delta2;
        }
        self.matches.push(MatchResult { terminal, errors });
    }

    /// Population variance of a bot's returns over the played matches.
    pub fn returns_var(&self, pl: usize) -> f64 {
        if self.matches.is_empty() {
            0.0
        } else {
            self.returns_agg[pl] / self.matches.len() as f64
        }
    }

    /// Human-readable final report.
    pub fn verbose_summary(&self) -> String {
        let mut report = String::new();
        report.push_str(&format!("In total played {} matches.\n", self.num_matches()));
        report.push_str(&format!(
            "Average length of a match was {} actions.\n",
            self.history_len_mean
        ));

        report.push_str("\nCorruption statistics:\n");
        for pl in 0..self.num_bots {
            report.push_str(&format!("Bot#{pl}: {}\n", self.corrupted_matches[pl]));
        }

        report.push_str("\nReturns statistics:\n");
        for pl in 0..self.num_bots {
            report.push_str(&format!(
                "Bot#{pl} mean: {} var: {}\n",
                self.returns_mean[pl],
                self.returns_var(pl)
            ));
        }
        report
    }

    /// Write one CSV row per match: space-separated action history, then
    /// `returns,protocol_error,illegal_actions,ponder_error,time_over` for
    /// every seat in order.
    ///
    /// # Errors
    /// Propagates failures of the underlying writer.
    pub fn write_csv<W: io::Write>(&self, w: &mut W, print_header: bool) -> io::Result<()> {
        if print_header {
            write!(w, "history")?;
            for pl in 0..self.num_bots {
                write!(
                    w,
                    ",returns[{pl}],protocol_error[{pl}],illegal_actions[{pl}],\
                     ponder_error[{pl}],time_over[{pl}]"
                )?;
            }
            writeln!(w)?;
        }
        for m in &self.matches {
            let history = m
                .terminal
                .history()
                .iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(" ");
            write!(w, "{history}")?;
            let returns = m.terminal.returns();
            for pl in 0..self.num_bots {
                let e = &m.errors[pl];
                write!(
                    w,
                    ",{},{},{},{},{}",
                    returns[pl], e.protocol_error, e.illegal_actions, e.ponder_error, e.time_over
                )?;
            }
            writeln!(w)?;
        }
        Ok(())
    }
}
