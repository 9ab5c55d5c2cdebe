//! Wire types for the private web player and accounts APIs.
//!
//! # Submodules
//!
//! * [`token`] - Web player access token endpoint
//! * [`client_token`] - Client token exchange
//! * [`captcha`] - Shared two-phase captcha vendor protocol
//! * [`accounts`] - Login, challenge, signup and password reset
//! * [`dealer`] - Realtime channel frames
//! * [`connect_state`] - Device registration, state snapshots and player commands
//!
//! Responses are validated by deserializing into these types at the trust
//! boundary; anything that does not match is a validation error.

pub mod accounts;
pub mod captcha;
pub mod client_token;
pub mod connect_state;
pub mod dealer;
pub mod token;

use crate::error::Result;
use serde::Deserialize;
use std::fmt::Debug;

/// Parses and logs JSON responses.
///
/// # Arguments
///
/// * `body` - Response body text to parse
/// * `origin` - Description of API endpoint for logging
///
/// # Errors
///
/// Returns error if:
/// * Response body is not valid JSON
/// * JSON structure doesn't match type `T`
///
/// # Logging
///
/// * Success: Logs parsed structure at TRACE level
/// * Parse Error: Logs raw JSON at TRACE level if valid JSON
/// * Invalid JSON: Logs error and raw text at ERROR level
pub fn json<T>(body: &str, origin: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Debug,
{
    match serde_json::from_str(body) {
        Ok(result) => {
            trace!("{origin}: {result:#?}");
            Ok(result)
        }
        Err(e) => {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
                trace!("{origin}: {json:#?}");
            } else {
                error!("{origin}: failed parsing response ({e:?})");
                trace!("{body}");
            }
            Err(e.into())
        }
    }
}
