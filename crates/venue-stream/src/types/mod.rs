/*
[INPUT]:  Venue protocol definitions and serde requirements
[OUTPUT]: Typed Rust structs/enums with serialization support
[POS]:    Data layer - type definitions shared by every layer
[UPDATE]: When the data model changes or new types are added
*/

pub mod enums;
pub mod events;
pub mod models;

pub use enums::*;
pub use events::*;
pub use models::*;
