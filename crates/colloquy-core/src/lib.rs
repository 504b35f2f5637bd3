//! Shared types for the colloquy session engine: identifiers, the
//! persisted data model, bus events and the traits at the seams to model
//! backends, tools, snapshots and permission policies.

pub mod errors;
pub mod events;
pub mod ids;
pub mod message;
pub mod permission;
pub mod provider;
pub mod session;
pub mod snapshot;
pub mod stream;
pub mod tokens;
pub mod tools;
