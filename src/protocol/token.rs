//! Web player access token.
//!
//! ```json
//! {
//!     "clientId": "d8a5ed958d274c2e8ee717e6a4b0971d",
//!     "accessToken": "BQ...",
//!     "accessTokenExpirationTimestampMs": 1700000000000,
//!     "isAnonymous": true
//! }
//! ```

use std::time::SystemTime;

use serde::Deserialize;
use serde_with::{formats::Flexible, serde_as, TimestampMilliSeconds};
use veil::Redact;

use crate::tokens::AccessToken;

#[serde_as]
#[derive(Clone, PartialEq, Eq, Deserialize, Redact)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub client_id: String,

    #[redact]
    pub access_token: String,

    #[serde_as(as = "TimestampMilliSeconds<i64, Flexible>")]
    pub access_token_expiration_timestamp_ms: SystemTime,

    #[serde(default)]
    pub is_anonymous: bool,
}

impl From<TokenResponse> for AccessToken {
    fn from(response: TokenResponse) -> Self {
        Self {
            token: response.access_token,
            client_id: response.client_id,
            expires_at: response.access_token_expiration_timestamp_ms,
            is_anonymous: response.is_anonymous,
        }
    }
}
