//! Accounts, challenge and signup wire types.

use serde::{Deserialize, Serialize};
use veil::Redact;

/// Answer to a password submission.
///
/// ```json
/// {"result": "redirect_required", "data": {"redirect_url": "https://challenge.spotify.com/c/..."}}
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub result: Option<String>,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub data: Option<LoginData>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct LoginData {
    #[serde(default)]
    pub redirect_url: Option<String>,
}

/// Captcha solution submitted to the challenge service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChallengeCommand<'a> {
    pub session_id: &'a str,
    pub challenge_id: &'a str,
    pub recaptcha_challenge_v1: RecaptchaChallenge<'a>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecaptchaChallenge<'a> {
    pub solve: Solve<'a>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Solve<'a> {
    pub recaptcha_token: &'a str,
}

impl<'a> ChallengeCommand<'a> {
    #[must_use]
    pub fn solve(session_id: &'a str, challenge_id: &'a str, recaptcha_token: &'a str) -> Self {
        Self {
            session_id,
            challenge_id,
            recaptcha_challenge_v1: RecaptchaChallenge {
                solve: Solve { recaptcha_token },
            },
        }
    }
}

/// Answer to a challenge command; login challenges carry `completed`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ChallengeResponse {
    #[serde(default)]
    pub completed: Option<Completed>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Completed {
    pub hash: String,
    pub interaction_reference: String,
}

/// Body of `get-session` and `complete-creation`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChallengeSession<'a> {
    pub session_id: &'a str,
}

/// Account creation request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CreateAccount<'a> {
    pub account_details: AccountDetails<'a>,
    pub callback_uri: String,
    pub client_info: ClientInfo<'a>,
    pub tracking: Tracking,
    pub recaptcha_token: &'a str,
    pub submission_id: &'a str,
    pub flow_id: &'a str,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AccountDetails<'a> {
    pub birthdate: &'a str,
    pub consent_flags: ConsentFlags,
    pub display_name: &'a str,
    pub email_and_password_identifier: EmailAndPassword<'a>,
    pub gender: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ConsentFlags {
    pub eula_agreed: bool,
    pub send_email: bool,
    pub third_party_email: bool,
}

impl Default for ConsentFlags {
    fn default() -> Self {
        Self {
            eula_agreed: true,
            send_email: true,
            third_party_email: false,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Redact)]
pub struct EmailAndPassword<'a> {
    pub email: &'a str,

    #[redact]
    pub password: &'a str,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClientInfo<'a> {
    pub api_key: &'a str,
    pub app_version: &'a str,
    pub capabilities: [u8; 1],
    pub installation_id: &'a str,
    pub platform: &'a str,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Tracking {
    pub creation_flow: String,
    pub creation_point: String,
    pub referrer: String,
}

impl Default for Tracking {
    fn default() -> Self {
        Self {
            creation_flow: String::new(),
            creation_point: "spotify.com".to_owned(),
            referrer: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn challenge_command_shape() {
        let command = ChallengeCommand::solve("SESS", "CHAL", "tok");
        assert_eq!(
            serde_json::to_value(&command).unwrap(),
            json!({
                "session_id": "SESS",
                "challenge_id": "CHAL",
                "recaptcha_challenge_v1": {"solve": {"recaptcha_token": "tok"}}
            })
        );
    }

    #[test]
    fn login_response_tolerates_missing_fields() {
        let response: LoginResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(response, LoginResponse::default());

        let response: LoginResponse = serde_json::from_str(
            r#"{"result":"redirect_required","data":{"redirect_url":"u"}}"#,
        )
        .unwrap();
        assert_eq!(
            response.data.and_then(|data| data.redirect_url).as_deref(),
            Some("u")
        );
    }
}
