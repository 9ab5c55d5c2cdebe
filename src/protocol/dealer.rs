//! Realtime channel frames.
//!
//! The first frame after connecting announces the connection id:
//!
//! ```json
//! {
//!     "headers": {"Spotify-Connection-Id": "NGU0..."},
//!     "method": "PUT",
//!     "type": "message",
//!     "uri": "hm://pusher/v1/connections/NGU0..."
//! }
//! ```
//!
//! Later frames may carry a `payloads` array of state updates, each tagged
//! with an `update_reason`.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

/// Keep-alive frame.
pub const PING: &str = r#"{"type":"ping"}"#;

/// Header of the init frame carrying the connection id.
pub const CONNECTION_ID_HEADER: &str = "Spotify-Connection-Id";

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct Frame {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,

    #[serde(default)]
    pub uri: Option<String>,

    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,

    #[serde(default)]
    pub payloads: Option<Vec<Value>>,
}

impl Frame {
    #[must_use]
    pub fn connection_id(&self) -> Option<&str> {
        self.headers
            .as_ref()?
            .get(CONNECTION_ID_HEADER)
            .map(String::as_str)
    }

    /// Payloads paired with their update reason.
    ///
    /// Payloads that are not objects or lack an `update_reason` are
    /// skipped.
    pub fn updates(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.payloads
            .iter()
            .flatten()
            .filter_map(|payload| {
                let reason = payload.get("update_reason")?.as_str()?;
                Some((reason, payload))
            })
    }
}
