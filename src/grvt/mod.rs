// =============================================================================
// GRVT wire protocol: signed REST client + EIP-712 signing
// =============================================================================

pub mod client;
pub mod signing;
