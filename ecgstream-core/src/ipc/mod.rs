//! Serialisable types handed to presentation collaborators.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them to a UI or print them as JSON lines.

pub mod events;
