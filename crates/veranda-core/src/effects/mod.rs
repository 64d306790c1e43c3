//! Effect traits at the engine's external seams.
//!
//! Everything the engine needs from the outside world — the managed data
//! provider and the wall clock — is reached through these traits. The
//! engine itself stays pure enough to run unchanged against production
//! implementations or the testkit's deterministic ones.

pub mod provider;
pub mod time;

pub use provider::{EventSubscription, ProviderEffects, ProviderError};
pub use time::ClockEffects;
