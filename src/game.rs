//! Traits the game engine must implement for the referee to drive it.
//!
//! The referee never knows the rules of the game it officiates. It only
//! classifies the current node (chance, simultaneous, sequential), asks for
//! legal actions and observation tensors, and applies whatever the bots (or
//! the chance sampler) decided.

/// Identifier of a game action, as exchanged with the bots in decimal form.
pub type Action = i64;

/// Sentinel for "no action chosen (yet)".
///
/// Engines must not use this value for a real action.
pub const INVALID_ACTION: Action = -1;

/// What the game engine should implement to be playable by a [`Referee`].
///
/// [`Referee`]: crate::referee::Referee
pub trait Game: Send + Sync {
    /// Canonical name of the game, sent to every bot during the handshake.
    fn name(&self) -> &str;

    /// Number of seats. The referee launches exactly one bot per seat.
    fn num_players(&self) -> usize;

    /// A fresh state at the root of the game tree.
    fn new_initial_state(&self) -> Box<dyn State>;
}

/// A single point of the game tree, advanced in place by the referee.
pub trait State: Send {
    /// True once the match is decided; [`State::returns`] is then valid.
    fn is_terminal(&self) -> bool;

    /// True at nodes where nature moves and every bot only ponders.
    fn is_chance_node(&self) -> bool;

    /// True at nodes where all acting players move at once.
    fn is_simultaneous_node(&self) -> bool;

    /// Whether `player` must submit an action at this node.
    fn is_player_acting(&self, player: usize) -> bool;

    /// The seat to move at a sequential node.
    ///
    /// Only meaningful when the node is neither chance nor simultaneous.
    fn current_player(&self) -> usize;

    /// Actions `player` may legally submit at this node.
    ///
    /// Non-empty for every acting player of a non-terminal node.
    fn legal_actions(&self, player: usize) -> Vec<Action>;

    /// Outcomes and probabilities at a chance node. Probabilities sum to 1.
    fn chance_outcomes(&self) -> Vec<(Action, f64)>;

    /// Advance past a chance or sequential node.
    ///
    /// # Errors
    /// Returned when the engine rejects the action. The referee only ever
    /// submits actions drawn from [`State::legal_actions`] or
    /// [`State::chance_outcomes`], so an error here is fatal.
    fn apply_action(&mut self, action: Action) -> anyhow::Result<()>;

    /// Advance past a simultaneous node with one action per seat.
    ///
    /// Entries for non-acting seats hold [`INVALID_ACTION`].
    ///
    /// # Errors
    /// See [`State::apply_action`].
    fn apply_actions(&mut self, actions: &[Action]) -> anyhow::Result<()>;

    /// Final score per seat. Only valid at terminal states.
    fn returns(&self) -> Vec<f64>;

    /// Every action applied so far, chance outcomes included.
    fn history(&self) -> Vec<Action>;

    /// Compressed public-observation tensor for `player`, shared knowledge
    /// across all seats.
    fn public_observation(&self, player: usize) -> Vec<u8>;

    /// Compressed private-observation tensor for `player`.
    fn private_observation(&self, player: usize) -> Vec<u8>;
}

/// Pick a chance outcome by walking the cumulative distribution with a
/// uniform draw `z` from `[0, 1)`.
pub fn sample_chance_outcome(outcomes: &[(Action, f64)], z: f64) -> (Action, f64) {
    assert!(!outcomes.is_empty(), "chance node without outcomes");
    let mut acc = 0.0;
    for &(action, prob) in outcomes {
        acc += prob;
        if z < acc {
            return (action, prob);
        }
    }
    // Rounding left a sliver of probability mass unassigned.
    *outcomes.last().unwrap()
}
