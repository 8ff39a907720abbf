//! Tournament orchestration: player lifecycle, the per-turn protocol state
//! machine, and the match loop with restart and disqualification policies.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::{bail, Context};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{info, instrument, trace, warn};

use crate::channel::{run_stderr_reader, run_stdout_reader, sleep_ms, BotChannel};
use crate::game::{sample_chance_outcome, Action, Game, State, INVALID_ACTION};
use crate::protocol::{
    handshake_lines, match_over_line, observation_line, parse_action, MATCH_OVER_MESSAGE,
    PONDER_MESSAGE, READY_MESSAGE, START_MESSAGE, TOURNAMENT_OVER_MESSAGE,
};
use crate::results::{BotErrors, TournamentResults};
use crate::settings::TournamentSettings;

/// Mediates a tournament between bot executables over their standard
/// streams, tolerating timeouts, malformed responses and illegal moves.
///
/// One [`BotChannel`] and two reader threads exist per seat while players
/// are running; the referee thread drives the whole protocol.
pub struct Referee {
    game: Arc<dyn Game>,
    executables: Vec<PathBuf>,
    rng: StdRng,
    settings: TournamentSettings,
    errors: Vec<BotErrors>,
    channels: Vec<Option<Arc<BotChannel>>>,
    threads_stdout: Vec<Option<JoinHandle<()>>>,
    threads_stderr: Vec<Option<JoinHandle<()>>>,
}

impl Referee {
    /// Create a referee for `game` with one bot executable per seat.
    ///
    /// # Errors
    /// Returned when the settings are inconsistent, the executables list is
    /// empty or does not match the game's player count, more than ten seats
    /// are requested (the handshake encodes the seat as one digit), or any
    /// bot file is missing or not executable.
    pub fn new(
        game: Arc<dyn Game>,
        executables: Vec<PathBuf>,
        seed: u64,
        settings: TournamentSettings,
    ) -> anyhow::Result<Self> {
        settings.validate()?;
        if executables.is_empty() {
            bail!("the executables list is empty");
        }
        if executables.len() != game.num_players() {
            bail!(
                "game '{}' has {} players but {} executables were given",
                game.name(),
                game.num_players(),
                executables.len()
            );
        }
        if executables.len() > 10 {
            bail!("at most 10 bots are supported (single-digit seat handshake)");
        }
        for executable in &executables {
            let metadata = std::fs::metadata(executable).with_context(|| {
                format!("the bot file '{}' was not found", executable.display())
            })?;
            use std::os::unix::fs::PermissionsExt;
            if metadata.permissions().mode() & 0o111 == 0 {
                bail!(
                    "the bot file '{}' cannot be executed (missing +x flag?)",
                    executable.display()
                );
            }
        }

        let num_bots = executables.len();
        Ok(Self {
            game,
            executables,
            rng: StdRng::seed_from_u64(seed),
            settings,
            errors: vec![BotErrors::default(); num_bots],
            channels: (0..num_bots).map(|_| None).collect(),
            threads_stdout: (0..num_bots).map(|_| None).collect(),
            threads_stderr: (0..num_bots).map(|_| None).collect(),
        })
    }

    /// Number of seats in the tournament.
    pub fn num_bots(&self) -> usize {
        self.executables.len()
    }

    /// The settings captured at construction.
    pub fn settings(&self) -> &TournamentSettings {
        &self.settings
    }

    /// Run `num_matches` matches and aggregate the statistics.
    ///
    /// If any handshake fails, every future match is marked corrupted for
    /// that seat and no match is played. A bot whose corrupted-match count
    /// exceeds `⌊num_matches × disqualification_rate⌋` is disqualified and
    /// the tournament ends early.
    ///
    /// # Errors
    /// Only fatal conditions: process spawning or the game engine failing.
    /// Bot misbehavior never surfaces here; it is accounted in the results.
    #[instrument(skip(self))]
    pub fn play_tournament(&mut self, num_matches: usize) -> anyhow::Result<TournamentResults> {
        let mut results = TournamentResults::new(self.num_bots());
        let start_ok = self.start_players()?;
        let mut all_ok = true;
        for pl in 0..self.num_bots() {
            all_ok = all_ok && start_ok[pl];
            if !start_ok[pl] {
                results.corrupted_matches[pl] = num_matches as u32;
            }
        }
        if !all_ok {
            info!("Could not start all players correctly, cannot play the tournament.");
            return Ok(results);
        }

        let corruption_threshold =
            (num_matches as f64 * self.settings.disqualification_rate) as u32;

        for match_number in 1..=num_matches {
            info!("{}", "-".repeat(80));
            info!("Playing match {match_number} / {num_matches}");
            info!("{}", "-".repeat(80));

            self.reset_error_tracking();
            let state = self.play_match()?;
            results.add_match(state, self.errors.clone());

            for pl in 0..self.num_bots() {
                if !self.corrupted_match_due(pl) {
                    continue;
                }
                info!("Bot#{pl} exceeded illegal behaviors in match {match_number}");
                results.corrupted_matches[pl] += 1;

                if results.corrupted_matches[pl] > corruption_threshold {
                    info!("Bot#{pl} is disqualified!");
                    results.disqualified[pl] = true;
                    self.tournament_over();
                    return Ok(results);
                }
                info!("Bot#{pl} is going to restart!");
                results.restarts[pl] += 1;
                self.restart_player(pl)?;
            }
        }

        info!("{}", "-".repeat(80));
        info!("Tournament is over!");
        info!("{}", "-".repeat(80));
        info!("{}", results.verbose_summary());
        self.tournament_over();

        Ok(results)
    }

    /// Start all players and collect their ready messages simultaneously.
    ///
    /// Returns one flag per seat telling whether the handshake succeeded.
    ///
    /// # Errors
    /// Returned when a bot process cannot be spawned.
    #[instrument(skip_all)]
    pub fn start_players(&mut self) -> anyhow::Result<Vec<bool>> {
        // A previous tournament may have left players running.
        self.shut_down_players();
        info!("Starting players.");
        for pl in 0..self.num_bots() {
            self.errors[pl].reset();
            self.spawn_channel(pl)?;
        }
        for pl in 0..self.num_bots() {
            self.send_handshake(pl);
        }
        // Blocking sleep to give time to the bots.
        thread::sleep(self.settings.timeout_ready);
        Ok(self.check_responses(READY_MESSAGE))
    }

    /// Start a single player and wait for its ready message.
    ///
    /// # Errors
    /// Returned when the bot process cannot be spawned.
    pub fn start_player(&mut self, pl: usize) -> anyhow::Result<bool> {
        info!("Starting player {pl} only.");
        self.spawn_channel(pl)?;
        self.send_handshake(pl);
        thread::sleep(self.settings.timeout_ready);
        Ok(self.check_response(READY_MESSAGE, pl))
    }

    /// Shut down all players: signal the channels, join every reader
    /// thread, and release channels and counters.
    pub fn shut_down_players(&mut self) {
        if self.channels.iter().all(Option::is_none) {
            return;
        }
        info!("Shutting down players.");
        for chn in self.channels.iter().flatten() {
            chn.shut_down();
        }
        for pl in 0..self.num_bots() {
            self.join_readers(pl);
            self.channels[pl] = None;
            self.errors[pl].reset();
        }
    }

    /// Shut down a single player.
    pub fn shut_down_player(&mut self, pl: usize) {
        info!("Shutting down player {pl} only.");
        if let Some(chn) = &self.channels[pl] {
            chn.shut_down();
        }
        self.join_readers(pl);
        self.channels[pl] = None;
        self.errors[pl].reset();
    }

    /// Replace a bot with a fresh process of the same executable.
    ///
    /// The outcome of the re-handshake is logged but not acted upon: a bot
    /// that comes back broken keeps corrupting matches until it crosses the
    /// disqualification threshold.
    ///
    /// # Errors
    /// Returned when the replacement process cannot be spawned.
    pub fn restart_player(&mut self, pl: usize) -> anyhow::Result<()> {
        self.shut_down_player(pl);
        if !self.start_player(pl)? {
            warn!("Bot#{pl} did not come back ready after its restart");
        }
        Ok(())
    }

    /// Tell every bot the tournament ended and grant the grace delay.
    /// Replies are deliberately never read.
    pub fn tournament_over(&mut self) {
        for chn in self.channels.iter().flatten() {
            if let Err(e) = chn.write_stdin(format!("{TOURNAMENT_OVER_MESSAGE}\n").as_bytes()) {
                warn!("{e:#}");
            }
        }
        thread::sleep(self.settings.time_tournament_over);
    }

    /// Zero all error counters. Called at the beginning of every match.
    pub fn reset_error_tracking(&mut self) {
        for e in &mut self.errors {
            e.reset();
        }
    }

    /// Whether `pl` corrupted the current match: it exceeded the error
    /// budget or committed at least one protocol error.
    fn corrupted_match_due(&self, pl: usize) -> bool {
        self.errors[pl].total_errors() > self.settings.max_invalid_behaviors
            || self.errors[pl].protocol_error > 0
    }

    fn spawn_channel(&mut self, pl: usize) -> anyhow::Result<()> {
        let channel = BotChannel::spawn(pl, &self.executables[pl])?;
        self.threads_stdout[pl] = Some(thread::spawn({
            let channel = channel.clone();
            move || run_stdout_reader(channel)
        }));
        self.threads_stderr[pl] = Some(thread::spawn({
            let channel = channel.clone();
            move || run_stderr_reader(channel)
        }));
        self.channels[pl] = Some(channel);
        Ok(())
    }

    fn send_handshake(&mut self, pl: usize) {
        info!("Bot#{pl}: {}", self.executables[pl].display());
        let chn = self.channel(pl);
        if let Err(e) = chn.write_stdin(handshake_lines(self.game.name(), pl).as_bytes()) {
            warn!("{e:#}");
        }
        chn.start_read(self.settings.timeout_ready);
    }

    fn join_readers(&mut self, pl: usize) {
        if let Some(th) = self.threads_stdout[pl].take() {
            if th.join().is_err() {
                warn!("Bot#{pl}: stdout reader thread panicked");
            }
        }
        if let Some(th) = self.threads_stderr[pl].take() {
            if th.join().is_err() {
                warn!("Bot#{pl}: stderr reader thread panicked");
            }
        }
    }

    fn channel(&self, pl: usize) -> Arc<BotChannel> {
        self.channels[pl]
            .as_ref()
            .expect("bot channel not running")
            .clone()
    }

    /// Quiesce the channel and compare its response against a reserved
    /// message, accounting a protocol error (and possibly a timeout) on
    /// mismatch.
    fn check_response(&mut self, expected: &str, pl: usize) -> bool {
        let chn = self.channel(pl);
        chn.cancel_read_blocking();
        let response = chn.response();
        if response == expected {
            trace!("Bot#{pl} {expected} ok.");
            true
        } else {
            info!("Bot#{pl} did not respond '{expected}', response was: '{response}'");
            self.errors[pl].protocol_error += 1;
            if chn.is_time_out() {
                info!("Bot#{pl} also timed out.");
                self.errors[pl].time_over += 1;
            }
            false
        }
    }

    fn check_responses(&mut self, expected: &str) -> Vec<bool> {
        (0..self.num_bots())
            .map(|pl| self.check_response(expected, pl))
            .collect()
    }

    /// Play a single match to its terminal state.
    #[instrument(skip_all)]
    fn play_match(&mut self) -> anyhow::Result<Box<dyn State>> {
        let num_bots = self.num_bots();
        let mut state = self.game.new_initial_state();
        let mut player_order: Vec<usize> = (0..num_bots).collect();
        let mut is_acting = vec![false; num_bots];

        // Check the start-of-match message.
        for pl in 0..num_bots {
            self.channel(pl).start_read(self.settings.timeout_start);
        }
        thread::sleep(self.settings.timeout_start);
        self.check_responses(START_MESSAGE);

        while !state.is_terminal() {
            trace!("History: {}", join_actions(&state.history()));

            // At a chance node nature moves and every bot only ponders.
            let only_ponder = state.is_chance_node();
            for pl in 0..num_bots {
                is_acting[pl] = state.is_player_acting(pl);
            }
            // Make sure no bot is preferred when we communicate with it.
            player_order.shuffle(&mut self.rng);

            // Send each player its observations, and its legal actions if
            // it has to act.
            for &pl in &player_order {
                let legal = is_acting[pl].then(|| state.legal_actions(pl));
                let line = observation_line(
                    &state.public_observation(pl),
                    &state.private_observation(pl),
                    legal.as_deref(),
                );
                if let Err(e) = self.channel(pl).write_stdin(line.as_bytes()) {
                    warn!("{e:#}");
                }
            }

            // Start waiting for the responses within the time limits.
            let start = Instant::now();
            for &pl in &player_order {
                let deadline = if is_acting[pl] {
                    self.settings.timeout_act
                } else {
                    self.settings.timeout_ponder
                };
                self.channel(pl).start_read(deadline);
            }

            // The ponder window is always fully spent.
            thread::sleep(self.settings.timeout_ponder);
            for pl in 0..num_bots {
                if is_acting[pl] {
                    continue;
                }
                let chn = self.channel(pl);
                let response = chn.response();
                if response == PONDER_MESSAGE {
                    trace!("Bot#{pl} ponder ok.");
                } else {
                    info!("Bot#{pl} ponder bad response: '{response}'");
                    self.errors[pl].ponder_error += 1;
                    if chn.is_time_out() {
                        info!("Bot#{pl} ponder timed out.");
                        self.errors[pl].time_over += 1;
                    }
                }
            }

            // Wait for the acting players, leaving early once everyone
            // answered, then quiesce all readers before inspecting state.
            if !only_ponder {
                loop {
                    let all_answered = (0..num_bots)
                        .all(|pl| !is_acting[pl] || self.channel(pl).has_read());
                    if all_answered {
                        break;
                    }
                    if start.elapsed() >= self.settings.timeout_act {
                        // One extra reader tick, so that a missing reply is
                        // recorded as a timeout rather than a cancelled read.
                        sleep_ms(2);
                        break;
                    }
                    sleep_ms(1);
                }
                for pl in 0..num_bots {
                    self.channel(pl).cancel_read_blocking();
                }
            }

            // Parse the submitted actions.
            let mut bot_actions = vec![INVALID_ACTION; num_bots];
            for pl in 0..num_bots {
                if !is_acting[pl] {
                    continue; // Ponders have been processed already.
                }
                let legal_actions = state.legal_actions(pl);
                let chn = self.channel(pl);

                if chn.is_time_out() {
                    info!("Bot#{pl} act timed out.");
                    self.errors[pl].time_over += 1;
                } else if !chn.has_read() {
                    info!("Bot#{pl} act no response.");
                    self.errors[pl].protocol_error += 1;
                } else {
                    let response = chn.response();
                    trace!("Bot#{pl} act response: '{response}'");
                    match parse_action(&response) {
                        None => {
                            info!("Bot#{pl} act invalid action.");
                            self.errors[pl].protocol_error += 1;
                        }
                        Some(action) if !legal_actions.contains(&action) => {
                            info!("Bot#{pl} act illegal action.");
                            self.errors[pl].illegal_actions += 1;
                        }
                        Some(action) => {
                            trace!("Bot#{pl} act ok.");
                            if self.errors[pl].total_errors() > self.settings.max_invalid_behaviors
                            {
                                // The bot forfeited its decision power for
                                // the rest of the match.
                                info!("Bot#{pl} acts randomly (exceeded illegal behaviors)");
                            } else {
                                bot_actions[pl] = action;
                            }
                        }
                    }
                }

                if bot_actions[pl] == INVALID_ACTION {
                    bot_actions[pl] = *legal_actions
                        .choose(&mut self.rng)
                        .expect("acting player has no legal actions");
                }
            }
            trace!("Bot actions: {}", join_actions(&bot_actions));

            // Advance the game.
            if state.is_chance_node() {
                let outcomes = state.chance_outcomes();
                let z: f64 = self.rng.gen_range(0.0..1.0);
                let (action, prob) = sample_chance_outcome(&outcomes, z);
                trace!("Chance action: {action} with prob {prob}");
                state.apply_action(action)?;
            } else if state.is_simultaneous_node() {
                state.apply_actions(&bot_actions)?;
            } else {
                let current = state.current_player();
                state.apply_action(bot_actions[current])?;
            }
        }

        let returns = state.returns();
        info!("Match over!");
        info!("History: {}", join_actions(&state.history()));

        for pl in 0..num_bots {
            let chn = self.channel(pl);
            if let Err(e) = chn.write_stdin(match_over_line(returns[pl]).as_bytes()) {
                warn!("{e:#}");
            }
            chn.start_read(self.settings.timeout_match_over);
        }

        for pl in 0..num_bots {
            info!("Bot#{pl} returns {}", returns[pl]);
            info!("Bot#{pl} protocol errors {}", self.errors[pl].protocol_error);
            info!("Bot#{pl} illegal actions {}", self.errors[pl].illegal_actions);
            info!("Bot#{pl} ponder errors {}", self.errors[pl].ponder_error);
            info!("Bot#{pl} time overs {}", self.errors[pl].time_over);
        }

        thread::sleep(self.settings.timeout_match_over);
        self.check_responses(MATCH_OVER_MESSAGE);

        Ok(state)
    }
}

impl Drop for Referee {
    fn drop(&mut self) {
        self.shut_down_players();
    }
}

fn join_actions(actions: &[Action]) -> String {
    actions
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}
