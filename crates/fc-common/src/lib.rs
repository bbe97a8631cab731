//! Ambient utilities shared by the rest of the workspace.
//!
//! Kept deliberately small: this crate carries only the concerns every
//! other crate needs regardless of which broker resource it supervises —
//! today that's structured logging.

pub mod logging;
