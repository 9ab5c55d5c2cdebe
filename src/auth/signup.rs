//! Account creation.
//!
//! Registration scans the signup page for the signup service key, the
//! installation id, the CSRF token and the flow id, solves a v3 captcha and
//! posts the account details. The signup API may answer with an embedded
//! challenge instead of creating the account; the challenge is then solved
//! and the creation completed explicitly.
//!
//! Any detail not set by the caller is randomised.

use std::{fmt, sync::Arc};

use reqwest::Method;
use uuid::Uuid;

use crate::{
    captcha::{CaptchaSolver, ChallengeKind},
    config::{Config, Endpoints},
    error::{Error, ErrorKind, Result},
    http,
    protocol::accounts::{
        AccountDetails, ChallengeSession, ClientInfo, ConsentFlags, CreateAccount,
        EmailAndPassword, Tracking,
    },
    util,
};

use super::{
    challenge::{Challenge, ChallengeContext},
    required_marker, Cookies, SessionDump, CSRF_HEADER, SITE_KEY_V2, SITE_KEY_V3,
};

/// Tokens scanned from the signup page.
#[derive(Clone, Debug, PartialEq, Eq)]
struct SignupPage {
    api_key: String,
    installation_id: String,
    csrf_token: String,
    flow_id: String,
}

pub struct Registration {
    http: Arc<http::Client>,
    endpoints: Endpoints,
    solver: Option<Arc<dyn CaptchaSolver>>,

    email: String,
    password: String,
    display_name: String,
    birthdate: String,
    gender: u8,

    submission_id: Uuid,
    page: Option<SignupPage>,
    registered: bool,
}

impl Registration {
    /// Creates a registration with random account details.
    #[must_use]
    pub fn new(http: Arc<http::Client>, config: &Config) -> Self {
        Self {
            http,
            endpoints: config.endpoints.clone(),
            solver: None,

            email: util::random_email(),
            password: util::random_string(10, true),
            display_name: util::random_string(10, false),
            birthdate: util::random_birthdate(),
            gender: 1,

            submission_id: Uuid::new_v4(),
            page: None,
            registered: false,
        }
    }

    #[must_use]
    pub fn with_solver(mut self, solver: Arc<dyn CaptchaSolver>) -> Self {
        self.solver = Some(solver);
        self
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = email.into();
        self
    }

    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    #[must_use]
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    /// Sets the date of birth, formatted `YYYY-MM-DD`.
    #[must_use]
    pub fn with_birthdate(mut self, birthdate: impl Into<String>) -> Self {
        self.birthdate = birthdate.into();
        self
    }

    #[must_use]
    pub fn with_gender(mut self, gender: u8) -> Self {
        self.gender = gender;
        self
    }

    #[must_use]
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Creates the account.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Auth`] if no solver is set, the signup page lacks
    /// a marker or the account is not created, and
    /// [`ErrorKind::Challenge`] if an embedded challenge fails.
    pub async fn register(&mut self) -> Result<()> {
        let Some(solver) = self.solver.clone() else {
            return Err(Error::auth("solver not set"));
        };
        if self.registered {
            return Err(Error::auth("account already registered"));
        }

        let signup_url = self.endpoints.www.join("ca-en/signup")?;
        let markup = self
            .http
            .text(self.http.get(signup_url.clone(), ""), ErrorKind::Auth)
            .await?;
        self.page = Some(SignupPage {
            api_key: required_marker(&markup, "signupServiceAppKey", Error::auth)?,
            installation_id: required_marker(&markup, "spT", Error::auth)?,
            csrf_token: required_marker(&markup, "csrfToken", Error::auth)?,
            flow_id: required_marker(&markup, "flowId", Error::auth)?,
        });

        debug!("solving signup captcha");
        let token = solver
            .solve_captcha(
                signup_url.as_str(),
                SITE_KEY_V3,
                "website/signup/submit_email",
                ChallengeKind::V3,
            )
            .await?;

        let response = self.create(&token).await?;
        if response.contains("challenge") {
            self.defeat_challenge(&response, solver.as_ref()).await?;
        }

        self.registered = true;
        info!("created account {}", self.email);
        Ok(())
    }

    async fn create(&self, captcha_token: &str) -> Result<String> {
        let Some(page) = &self.page else {
            return Err(Error::auth("signup page not fetched"));
        };

        let submission_id = self.submission_id.to_string();
        let payload = CreateAccount {
            account_details: AccountDetails {
                birthdate: &self.birthdate,
                consent_flags: ConsentFlags::default(),
                display_name: &self.display_name,
                email_and_password_identifier: EmailAndPassword {
                    email: &self.email,
                    password: &self.password,
                },
                gender: self.gender,
            },
            callback_uri: callback_uri(&self.endpoints, &page.flow_id, util::now_from_epoch()),
            client_info: ClientInfo {
                api_key: &page.api_key,
                app_version: "v2",
                capabilities: [1],
                installation_id: &page.installation_id,
                platform: "www",
            },
            tracking: Tracking::default(),
            recaptcha_token: captcha_token,
            submission_id: &submission_id,
            flow_id: &page.flow_id,
        };

        let url = self.endpoints.signup.join("signup/public/v2/account/create")?;
        let mut request = self.http.json(Method::POST, url, &payload)?;
        request
            .headers_mut()
            .insert(CSRF_HEADER, page.csrf_token.parse()?);
        self.http.text(request, ErrorKind::Auth).await
    }

    async fn defeat_challenge(&self, response: &str, solver: &dyn CaptchaSolver) -> Result<()> {
        info!("signup challenge detected, attempting to solve");

        // Compact re-serialisation makes the marker scan independent of the
        // server's formatting.
        let compact = serde_json::from_str::<serde_json::Value>(response)
            .map(|value| value.to_string())
            .unwrap_or_else(|_| response.to_owned());
        let session_id = util::find_marker(&compact, "session_id")
            .ok_or_else(|| Error::challenge("challenge session id missing").with_upstream(response))?
            .to_owned();

        let url = self.endpoints.challenge.join("api/v1/get-session")?;
        let request = self.http.json(
            Method::POST,
            url,
            &ChallengeSession {
                session_id: &session_id,
            },
        )?;
        let session = self.http.text(request, ErrorKind::Challenge).await?;
        let compact = serde_json::from_str::<serde_json::Value>(&session)
            .map(|value| value.to_string())
            .unwrap_or(session);
        let challenge_url = util::find_marker(&compact, "url")
            .ok_or_else(|| Error::challenge("challenge url missing").with_upstream(compact.clone()))?;
        let ctx = ChallengeContext::from_url(challenge_url)?;

        let token = solver
            .solve_captcha(challenge_url, SITE_KEY_V2, "challenge", ChallengeKind::V2)
            .await?;
        Challenge::new(&self.http, &self.endpoints, solver)
            .invoke(&ctx, &token, Some(Challenge::SIGNUP_TRACE_CONTEXT))
            .await?;

        let url = self
            .endpoints
            .signup
            .join("signup/public/v2/account/complete-creation")?;
        let request = self.http.json(
            Method::POST,
            url,
            &ChallengeSession {
                session_id: &session_id,
            },
        )?;
        let completion = self.http.text(request, ErrorKind::Challenge).await?;
        if !completion.contains("success") {
            return Err(Error::challenge("could not complete account creation").with_upstream(completion));
        }

        info!("signup challenge solved");
        Ok(())
    }

    /// Dumps the new account's credentials and cookie jar.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::FailedPrecondition`] before a successful
    /// registration.
    pub fn dump(&self) -> Result<SessionDump> {
        if !self.registered {
            return Err(Error::failed_precondition("account not registered"));
        }

        Ok(SessionDump {
            identifier: self.email.clone(),
            password: self.password.clone(),
            cookies: Cookies::Map(self.http.dump_cookies()?),
        })
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("email", &self.email)
            .field("display_name", &self.display_name)
            .field("birthdate", &self.birthdate)
            .field("registered", &self.registered)
            .finish_non_exhaustive()
    }
}

/// Builds the challenge callback of a registration.
///
/// The flow id and timestamp are joined by a literal `%`.
fn callback_uri(endpoints: &Endpoints, flow_id: &str, unix_time: u64) -> String {
    format!(
        "{}signup/challenge?flow_ctx={flow_id}%{unix_time}&locale=ca-en",
        endpoints.www
    )
}
