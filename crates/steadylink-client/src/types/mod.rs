/*
[INPUT]:  Connection lifecycle vocabulary shared by every layer
[OUTPUT]: Typed enums, records and events with serde support
[POS]:    Data layer - type definitions for the connection core
[UPDATE]: When states, categories or event shapes change
*/

pub mod enums;
pub mod events;
pub mod models;

pub use enums::*;
pub use events::*;
pub use models::*;
