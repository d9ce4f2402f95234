// =============================================================================
// Technical Indicators
// =============================================================================

pub mod ema;
