/*
[INPUT]:  Crate modules and public type definitions
[OUTPUT]: Public steadylink client crate surface
[POS]:    Crate root - module wiring
[UPDATE]: When public modules or exports change
*/

pub mod classifier;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod machine;
pub mod queue;
pub mod retry;
pub mod transport;
pub mod types;

pub use classifier::{FailureSignal, classify, classify_signal};
pub use client::SteadyClient;
pub use config::ClientConfig;
pub use context::Context;
pub use error::{ClientError, Result};
pub use machine::{ConnectionMachine, Effect, MachineEvent};
pub use queue::OutboundQueue;
pub use retry::RetryPolicy;

// Re-export commonly used types from transport
pub use transport::{
    LinkCommand,
    MockConnection,
    MockController,
    MockTransport,
    Transport,
    TransportError,
    TransportEvent,
    TransportLink,
    WsTransport,
};

// Re-export all types
pub use types::*;
