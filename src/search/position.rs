use crate::Value;
use crate::nn::planes::Plane;

/// the board collaborator. the search core never sees chess rules, only
/// this surface: feature planes in, legal moves and game-end values out,
/// with a flat policy index per move.
///
/// all operations are pure with respect to the position object; `apply`
/// and `undo` must round-trip exactly.
pub trait Position: Clone + Send + Sync {
    type Move: Copy + Eq + std::fmt::Display + Send + Sync;

    /// sparse feature planes for the current board and its history, one
    /// per network input channel
    fn input_planes(&self) -> Vec<Plane>;

    /// every legal move, in a stable order
    fn legal_moves(&self) -> Vec<Self::Move>;

    fn apply(&mut self, mv: Self::Move);
    fn undo(&mut self);

    /// Some(outcome in [0, 1] for the side to move) once the game is
    /// over, including every position with no legal moves
    fn terminal_value(&self) -> Option<Value>;

    /// the move's slot in the flat policy encoding. must be total over
    /// legal moves and within the network's policy width
    fn policy_index(&self, mv: Self::Move) -> usize;
}
