//! Nostr follow-list client.
//!
//! Signs a user in through a [`signer::Signer`], keeps their contact list in
//! sync from their relays, and publishes follow/unfollow updates through a
//! [`relay::RelayPool`].

pub mod action;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod follow_list;
pub mod notify;
pub mod relay;
pub mod session;
pub mod signer;

#[cfg(test)]
mod testing;

pub use action::{ActionOutcome, FollowAction, FollowHandler};
pub use controller::{LoginController, LoginState, SessionState};
pub use error::FollowError;
