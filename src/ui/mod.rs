//! # UI Module
//!
//! Everything the bot says: message texts in [`messages`] and inline
//! keyboards in [`buttons`]. Nothing here talks to the network.

pub mod buttons;
pub mod messages;
