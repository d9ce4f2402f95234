// =============================================================================
// Exit Management Module
// =============================================================================
//
// Post-entry stop management: breakeven, partial take, profit lock and the
// time-stop, evaluated once per 15-minute slot per position.

pub mod trailing;

pub use trailing::{PositionTrailState, StopStage, TrailDecision};
