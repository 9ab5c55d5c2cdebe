//! Client core for the Spotify web player's private APIs.
//!
//! * [`session`]: anonymous and authorized access tokens, client tokens and
//!   GraphQL operation hashes scraped from the web player bundle
//! * [`proof`]: time-based proofs required by the token endpoint
//! * [`captcha`]: reCAPTCHA solving through third-party task services
//! * [`auth`]: login, account creation, password reset and interactive
//!   challenges, with session dumps that can be stored and restored
//! * [`dealer`]: the realtime WebSocket channel and device registration
//! * [`events`]: dispatch of pushed state updates to subscribed handlers
//! * [`player`]: remote playback commands for the active device
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod auth;
pub mod captcha;
pub mod config;
pub mod dealer;
pub mod error;
pub mod events;
pub mod http;
pub mod player;
pub mod proof;
pub mod protocol;
pub mod secrets;
pub mod session;
pub mod signal;
pub mod tokens;
pub mod util;
