//! End-to-end tournaments against real bot processes.
//!
//! The bots are small POSIX shell scripts written into a temp directory and
//! launched by the referee like any external executable.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bot_referee::logger::init_logger;
use bot_referee::prelude::*;

use crate::games::{CoinFlipGame, MatchingPenniesGame, TurnTakingGame, HEADS, TAILS};


/// Replies correctly everywhere and always plays the first legal action.
const FIRST_ACTION_BOT: &str = r#"#!/bin/sh
read -r game_name
read -r seat
echo ready
echo start
while read -r line; do
  case "$line" in
    "tournament over") exit 0 ;;
    "match over"*) echo "match over"; echo start ;;
    *) set -- $line
       if [ "$#" -ge 3 ]; then echo "$3"; else echo ponder; fi ;;
  esac
done
"#;

/// Consumes everything and never says a word.
const SILENT_BOT: &str = r#"#!/bin/sh
while read -r line; do :; done
"#;

/// Always submits an action id far outside the legal set.
const ILLEGAL_BOT: &str = r#"#!/bin/sh
read -r game_name
read -r seat
echo ready
echo start
while read -r line; do
  case "$line" in
    "tournament over") exit 0 ;;
    "match over"*) echo "match over"; echo start ;;
    *) set -- $line
       if [ "$#" -ge 3 ]; then echo 999999; else echo ponder; fi ;;
  esac
done
"#;

/// Submits a well-formed action followed by trailing garbage.
const GARBAGE_BOT: &str = r#"#!/bin/sh
read -r game_name
read -r seat
echo ready
echo start
while read -r line; do
  case "$line" in
    "tournament over") exit 0 ;;
    "match over"*) echo "match over"; echo start ;;
    *) set -- $line
       if [ "$#" -ge 3 ]; then echo 3x; else echo ponder; fi ;;
  esac
done
"#;

/// Acts correctly but replies the wrong reserved word when pondering.
const BAD_PONDER_BOT: &str = r#"#!/bin/sh
read -r game_name
read -r seat
echo ready
echo start
while read -r line; do
  case "$line" in
    "tournament over") exit 0 ;;
    "match over"*) echo "match over"; echo start ;;
    *) set -- $line
       if [ "$#" -ge 3 ]; then echo "$3"; else echo ready; fi ;;
  esac
done
"#;

/// Falls asleep whenever it has to act and never wakes up in time.
const SLEEPY_BOT: &str = r#"#!/bin/sh
read -r game_name
read -r seat
echo ready
echo start
while read -r line; do
  case "$line" in
    "tournament over") exit 0 ;;
    "match over"*) echo "match over"; echo start ;;
    *) set -- $line
       if [ "$#" -ge 3 ]; then sleep 30; else echo ponder; fi ;;
  esac
done
"#;

fn write_bot(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

/// Corrupts its very first acting turn, then behaves; the marker file makes
/// the misbehavior survive a process restart.
fn marker_bot_body(marker: &Path) -> String {
    format!(
        r#"#!/bin/sh
read -r game_name
read -r seat
echo ready
echo start
while read -r line; do
  case "$line" in
    "tournament over") exit 0 ;;
    "match over"*) echo "match over"; echo start ;;
    *) set -- $line
       if [ "$#" -ge 3 ]; then
         if [ ! -f "{marker}" ]; then
           touch "{marker}"
           echo 3x
         else
           echo "$3"
         fi
       else
         echo ponder
       fi ;;
  esac
done
"#,
        marker = marker.display()
    )
}

fn test_settings() -> TournamentSettings {
    TournamentSettings::new()
        .with_timeout_ready(Duration::from_millis(800))
        .with_timeout_start(Duration::from_millis(500))
        .with_timeout_act(Duration::from_millis(800))
        .with_timeout_ponder(Duration::from_millis(200))
        .with_timeout_match_over(Duration::from_millis(400))
        .with_time_tournament_over(Duration::from_millis(100))
}

fn zero_errors(errors: &BotErrors) -> bool {
    errors.total_errors() == 0
}

#[test]
fn happy_path_sequential_match() {
    init_logger(false);
    let dir = tempfile::tempdir().unwrap();
    let bot = write_bot(dir.path(), "first_action.sh", FIRST_ACTION_BOT);

    let game = Arc::new(TurnTakingGame { horizon: 4 });
    let mut referee = Referee::new(game, vec![bot.clone(), bot], 42, test_settings()).unwrap();
    let results = referee.play_tournament(1).unwrap();

    assert_eq!(results.num_matches(), 1);
    let m = &results.matches[0];
    assert!(m.terminal.is_terminal());
    assert_eq!(m.terminal.history(), vec![0, 1, 2, 3]);
    assert!(m.errors.iter().all(zero_errors));
    assert_eq!(results.corrupted_matches, vec![0, 0]);
    assert_eq!(results.restarts, vec![0, 0]);
    assert_eq!(results.disqualified, vec![false, false]);
    assert_eq!(results.returns_mean, vec![1.0, -1.0]);
    assert_eq!(results.history_len_mean, 4.0);

    let mut csv = Vec::new();
    results.write_csv(&mut csv, true).unwrap();
    let csv = String::from_utf8(csv).unwrap();
    assert_eq!(csv.lines().nth(1).unwrap(), "0 1 2 3,1,0,0,0,0,-1,0,0,0,0");
}

#[test]
fn failed_handshake_corrupts_every_match() {
    init_logger(false);
    let dir = tempfile::tempdir().unwrap();
    let silent = write_bot(dir.path(), "silent.sh", SILENT_BOT);
    let bot = write_bot(dir.path(), "first_action.sh", FIRST_ACTION_BOT);

    let game = Arc::new(TurnTakingGame { horizon: 2 });
    let mut referee = Referee::new(game, vec![silent, bot], 42, test_settings()).unwrap();
    let results = referee.play_tournament(3).unwrap();

    assert_eq!(results.num_matches(), 0);
    assert_eq!(results.corrupted_matches, vec![3, 0]);
    assert_eq!(results.disqualified, vec![false, false]);
    assert_eq!(results.restarts, vec![0, 0]);
}

#[test]
fn illegal_action_is_replaced_and_disqualifies_under_zero_tolerance() {
    init_logger(false);
    let dir = tempfile::tempdir().unwrap();
    let illegal = write_bot(dir.path(), "illegal.sh", ILLEGAL_BOT);
    let bot = write_bot(dir.path(), "first_action.sh", FIRST_ACTION_BOT);

    let game = Arc::new(TurnTakingGame { horizon: 2 });
    let settings = test_settings()
        .with_max_invalid_behaviors(0)
        .with_disqualification_rate(0.0);
    let mut referee = Referee::new(game, vec![illegal, bot], 42, settings).unwrap();
    let results = referee.play_tournament(2).unwrap();

    // The corrupting match is recorded, then the tournament ends early.
    assert_eq!(results.num_matches(), 1);
    let m = &results.matches[0];
    assert_eq!(m.errors[0].illegal_actions, 1);
    assert_eq!(m.errors[0].protocol_error, 0);
    assert_eq!(m.errors[0].time_over, 0);
    assert!(zero_errors(&m.errors[1]));
    // A random legal action was substituted; the match still completed.
    let history = m.terminal.history();
    assert!(history[0] == 0 || history[0] == 10);
    assert_eq!(history[1], 1);
    assert_eq!(results.corrupted_matches, vec![1, 0]);
    assert_eq!(results.disqualified, vec![true, false]);
}

#[test]
fn trailing_garbage_is_a_protocol_error_and_restarts_the_bot() {
    init_logger(false);
    let dir = tempfile::tempdir().unwrap();
    let garbage = write_bot(dir.path(), "garbage.sh", GARBAGE_BOT);
    let bot = write_bot(dir.path(), "first_action.sh", FIRST_ACTION_BOT);

    let game = Arc::new(TurnTakingGame { horizon: 2 });
    let settings = test_settings().with_disqualification_rate(1.0);
    let mut referee = Referee::new(game, vec![garbage, bot], 42, settings).unwrap();
    let results = referee.play_tournament(1).unwrap();

    assert_eq!(results.num_matches(), 1);
    let m = &results.matches[0];
    assert_eq!(m.errors[0].protocol_error, 1);
    assert_eq!(m.errors[0].illegal_actions, 0);
    let history = m.terminal.history();
    assert!(history[0] == 0 || history[0] == 10);
    assert_eq!(history[1], 1);
    assert_eq!(results.corrupted_matches, vec![1, 0]);
    assert_eq!(results.restarts, vec![1, 0]);
    assert_eq!(results.disqualified, vec![false, false]);
}

#[test]
fn bad_ponder_reply_is_counted_but_harmless() {
    init_logger(false);
    let dir = tempfile::tempdir().unwrap();
    let bot = write_bot(dir.path(), "first_action.sh", FIRST_ACTION_BOT);
    let bad_ponder = write_bot(dir.path(), "bad_ponder.sh", BAD_PONDER_BOT);

    let game = Arc::new(TurnTakingGame { horizon: 2 });
    let mut referee = Referee::new(game, vec![bot, bad_ponder], 42, test_settings()).unwrap();
    let results = referee.play_tournament(1).unwrap();

    assert_eq!(results.num_matches(), 1);
    let m = &results.matches[0];
    assert_eq!(m.errors[1].ponder_error, 1);
    assert_eq!(m.errors[1].protocol_error, 0);
    assert_eq!(m.errors[1].illegal_actions, 0);
    assert!(zero_errors(&m.errors[0]));
    // No action substitution happened: the bot was not acting.
    assert_eq!(m.terminal.history(), vec![0, 1]);
    assert_eq!(results.corrupted_matches, vec![0, 0]);
    assert_eq!(results.returns_mean, vec![-1.0, 1.0]);
}

#[test]
fn act_timeout_substitutes_a_random_legal_action() {
    init_logger(false);
    let dir = tempfile::tempdir().unwrap();
    let sleepy = write_bot(dir.path(), "sleepy.sh", SLEEPY_BOT);
    let bot = write_bot(dir.path(), "first_action.sh", FIRST_ACTION_BOT);

    let game = Arc::new(TurnTakingGame { horizon: 1 });
    let settings = test_settings()
        .with_timeout_act(Duration::from_millis(400))
        .with_disqualification_rate(1.0);
    let mut referee = Referee::new(game, vec![sleepy, bot], 42, settings).unwrap();
    let results = referee.play_tournament(1).unwrap();

    assert_eq!(results.num_matches(), 1);
    let m = &results.matches[0];
    // The act deadline was hit for sure; the missed match-over
    // acknowledgement counts as a protocol error and, depending on which
    // clock trips first, possibly a second timeout.
    assert!(m.errors[0].time_over >= 1);
    assert_eq!(m.errors[0].protocol_error, 1);
    assert_eq!(m.errors[0].illegal_actions, 0);
    assert_eq!(m.errors[0].ponder_error, 0);
    assert!(zero_errors(&m.errors[1]));
    let history = m.terminal.history();
    assert!(history[0] == 0 || history[0] == 10);
    assert_eq!(results.returns_mean, vec![1.0, -1.0]);
    assert_eq!(results.restarts, vec![1, 0]);
    assert_eq!(results.disqualified, vec![false, false]);
}

#[test]
fn one_corrupted_match_restarts_without_disqualification() {
    init_logger(false);
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("already_corrupted");
    let flaky = write_bot(dir.path(), "flaky.sh", &marker_bot_body(&marker));
    let bot = write_bot(dir.path(), "first_action.sh", FIRST_ACTION_BOT);

    let game = Arc::new(TurnTakingGame { horizon: 2 });
    let settings = test_settings().with_disqualification_rate(0.5);
    let mut referee = Referee::new(game, vec![flaky, bot], 42, settings).unwrap();
    let results = referee.play_tournament(4).unwrap();

    assert_eq!(results.num_matches(), 4);
    assert_eq!(results.matches[0].errors[0].protocol_error, 1);
    for m in &results.matches[1..] {
        assert!(m.errors.iter().all(zero_errors));
    }
    assert_eq!(results.corrupted_matches, vec![1, 0]);
    assert_eq!(results.restarts, vec![1, 0]);
    assert_eq!(results.disqualified, vec![false, false]);
    // Every match ended with the same returns, so the variance vanishes.
    assert_eq!(results.returns_mean, vec![-1.0, 1.0]);
    assert!(results.returns_var(0).abs() < 1e-12);
    assert_eq!(results.history_len_mean, 2.0);
}

#[test]
fn chance_node_turns_are_ponder_only() {
    init_logger(false);
    let dir = tempfile::tempdir().unwrap();
    let bot = write_bot(dir.path(), "first_action.sh", FIRST_ACTION_BOT);

    let game = Arc::new(CoinFlipGame);
    let mut referee = Referee::new(game, vec![bot.clone(), bot], 7, test_settings()).unwrap();
    let results = referee.play_tournament(1).unwrap();

    assert_eq!(results.num_matches(), 1);
    let m = &results.matches[0];
    assert!(m.errors.iter().all(zero_errors));
    let history = m.terminal.history();
    assert_eq!(history.len(), 3);
    assert!(history[0] == HEADS || history[0] == TAILS);
    assert_eq!(&history[1..], &[0, 0]);
    let expected = if history[0] == HEADS {
        vec![0.5, -0.5]
    } else {
        vec![-0.5, 0.5]
    };
    assert_eq!(results.returns_mean, expected);
}

#[test]
fn simultaneous_node_collects_all_acting_players() {
    init_logger(false);
    let dir = tempfile::tempdir().unwrap();
    let bot = write_bot(dir.path(), "first_action.sh", FIRST_ACTION_BOT);

    let game = Arc::new(MatchingPenniesGame);
    let mut referee = Referee::new(game, vec![bot.clone(), bot], 42, test_settings()).unwrap();
    let results = referee.play_tournament(1).unwrap();

    assert_eq!(results.num_matches(), 1);
    let m = &results.matches[0];
    assert!(m.errors.iter().all(zero_errors));
    assert_eq!(m.terminal.history(), vec![0, 0]);
    assert_eq!(results.returns_mean, vec![1.0, -1.0]);
}

#[test]
fn players_survive_a_manual_restart_cycle() {
    init_logger(false);
    let dir = tempfile::tempdir().unwrap();
    let bot = write_bot(dir.path(), "first_action.sh", FIRST_ACTION_BOT);

    let game = Arc::new(TurnTakingGame { horizon: 2 });
    let mut referee = Referee::new(game, vec![bot.clone(), bot], 42, test_settings()).unwrap();

    let start_ok = referee.start_players().unwrap();
    assert_eq!(start_ok, vec![true, true]);

    referee.shut_down_player(0);
    assert!(referee.start_player(0).unwrap());

    referee.shut_down_players();
}

#[test]
fn missing_bot_file_is_fatal() {
    init_logger(false);
    let game = Arc::new(TurnTakingGame { horizon: 2 });
    let missing = PathBuf::from("/no/such/bot.sh");
    let err = Referee::new(game, vec![missing.clone(), missing], 42, test_settings())
        .err()
        .unwrap();
    assert!(err.to_string().contains("was not found"));
}

#[test]
fn non_executable_bot_file_is_fatal() {
    init_logger(false);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("not_executable.sh");
    fs::write(&path, FIRST_ACTION_BOT).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o644);
    fs::set_permissions(&path, perms).unwrap();

    let game = Arc::new(TurnTakingGame { horizon: 2 });
    let err = Referee::new(game, vec![path.clone(), path], 42, test_settings())
        .err()
        .unwrap();
    assert!(err.to_string().contains("cannot be executed"));
}

#[test]
fn empty_or_mismatched_executables_are_fatal() {
    init_logger(false);
    let dir = tempfile::tempdir().unwrap();
    let bot = write_bot(dir.path(), "first_action.sh", FIRST_ACTION_BOT);

    let game = Arc::new(TurnTakingGame { horizon: 2 });
    assert!(Referee::new(game.clone(), vec![], 42, test_settings()).is_err());
    assert!(Referee::new(game, vec![bot], 42, test_settings()).is_err());
}
