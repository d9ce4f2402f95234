// =============================================================================
// Breakout Bot — Donchian breakout signals, per-account execution and trailing
// =============================================================================
//
//   market_data ─▶ hub ─▶ strategy ─▶ router ─▶ session (confirm worker)
//                   │                    │            │
//                   └── 1m candles ─────▶└─ trailing ─┘──▶ exchange gateway
// =============================================================================

pub mod api;
pub mod error;
pub mod exchange;
pub mod exit;
pub mod hub;
pub mod indicators;
pub mod market_data;
pub mod notifier;
pub mod queue;
pub mod risk;
pub mod router;
pub mod runtime_config;
pub mod session;
pub mod settings;
pub mod settings_store;
pub mod strategy;
pub mod types;
