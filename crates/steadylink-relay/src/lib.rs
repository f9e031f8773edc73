/*
[INPUT]:  Crate modules and public type definitions
[OUTPUT]: Public relay library surface used by the binary and tests
[POS]:    Crate root - module wiring
[UPDATE]: When public modules or exports change
*/

pub mod config;
pub mod relay;

pub use config::RelayConfig;
pub use relay::{RelaySummary, run_relay, shutdown_client};
