use std::{
    fmt,
    time::{Duration, SystemTime},
};

use veil::Redact;

/// Bearer token issued by the web player token endpoint.
#[derive(Clone, Redact, PartialEq, Eq, Hash)]
pub struct AccessToken {
    #[redact(partial)]
    pub token: String,
    pub client_id: String,
    pub expires_at: SystemTime,
    pub is_anonymous: bool,
}

impl AccessToken {
    #[must_use]
    pub fn time_to_live(&self) -> Duration {
        self.expires_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        SystemTime::now() >= self.expires_at
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token)
    }
}

/// Token granted by the client token exchange.
#[derive(Clone, Redact, PartialEq, Eq, Hash)]
pub struct ClientToken {
    #[redact(partial)]
    pub token: String,
}

impl fmt::Display for ClientToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token)
    }
}

/// Progress of the token acquisition state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TokenState {
    Unset,
    HasAccessToken,
    HasClientToken,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_hides_tokens() {
        let token = AccessToken {
            token: "BQDsecretsecretsecret".to_owned(),
            client_id: "client".to_owned(),
            expires_at: SystemTime::now() + Duration::from_secs(3600),
            is_anonymous: true,
        };

        let debug = format!("{token:?}");
        assert!(!debug.contains("BQDsecretsecretsecret"));
        assert!(debug.contains("client"));
        assert!(!token.is_expired());
        assert!(token.time_to_live() > Duration::from_secs(3500));
    }

    #[test]
    fn token_states_are_ordered() {
        assert!(TokenState::Unset < TokenState::HasAccessToken);
        assert!(TokenState::HasAccessToken < TokenState::HasClientToken);
    }
}
