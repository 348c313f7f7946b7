// =============================================================================
// HTTP surface for the trading core
// =============================================================================

pub mod rest;
