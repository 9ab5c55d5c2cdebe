//! Client token exchange.
//!
//! The request describes the web player build and this installation; the
//! response is a discriminated union of which only the granted variant is
//! accepted.

use serde::{Deserialize, Serialize};
use veil::Redact;

use crate::{
    error::{Error, Result},
    tokens::ClientToken,
};

/// Discriminator of a granted token response.
pub const GRANTED: &str = "RESPONSE_GRANTED_TOKEN_RESPONSE";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Request<'a> {
    pub client_data: ClientData<'a>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClientData<'a> {
    pub client_version: &'a str,
    pub client_id: &'a str,
    pub js_sdk_data: JsSdkData<'a>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JsSdkData<'a> {
    pub device_brand: &'a str,
    pub device_model: &'a str,
    pub os: &'a str,
    pub os_version: &'a str,
    pub device_id: &'a str,
    pub device_type: &'a str,
}

impl<'a> Request<'a> {
    #[must_use]
    pub fn new(client_version: &'a str, client_id: &'a str, device_id: &'a str) -> Self {
        Self {
            client_data: ClientData {
                client_version,
                client_id,
                js_sdk_data: JsSdkData {
                    device_brand: "unknown",
                    device_model: "unknown",
                    os: "windows",
                    os_version: "NT 10.0",
                    device_id,
                    device_type: "computer",
                },
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Response {
    pub response_type: String,
    pub granted_token: Option<GrantedToken>,
}

#[derive(Clone, PartialEq, Eq, Deserialize, Redact)]
pub struct GrantedToken {
    #[redact]
    pub token: String,

    #[serde(default)]
    pub expires_after_seconds: Option<u64>,
}

impl TryFrom<Response> for ClientToken {
    type Error = Error;

    fn try_from(response: Response) -> Result<Self> {
        if response.response_type != GRANTED {
            return Err(Error::session("client token was not granted")
                .with_upstream(response.response_type));
        }

        let granted = response
            .granted_token
            .ok_or_else(|| Error::session("granted response lacks a token"))?;

        Ok(Self {
            token: granted.token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn request_shape() {
        let request = Request::new("1.2.3", "cid", "dev");
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "client_data": {
                    "client_version": "1.2.3",
                    "client_id": "cid",
                    "js_sdk_data": {
                        "device_brand": "unknown",
                        "device_model": "unknown",
                        "os": "windows",
                        "os_version": "NT 10.0",
                        "device_id": "dev",
                        "device_type": "computer",
                    }
                }
            })
        );
    }

    #[test]
    fn only_granted_responses_are_accepted() {
        let granted: Response = serde_json::from_value(json!({
            "response_type": GRANTED,
            "granted_token": {"token": "ct"}
        }))
        .unwrap();
        assert_eq!(ClientToken::try_from(granted).unwrap().token, "ct");

        let challenged: Response = serde_json::from_value(json!({
            "response_type": "RESPONSE_CHALLENGES_RESPONSE",
            "challenges": {}
        }))
        .unwrap();
        let err = ClientToken::try_from(challenged).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Session);
        assert_eq!(err.upstream.as_deref(), Some("RESPONSE_CHALLENGES_RESPONSE"));

        let empty: Response =
            serde_json::from_value(json!({"response_type": GRANTED})).unwrap();
        assert!(ClientToken::try_from(empty).is_err());
    }
}
