//! Password login.
//!
//! # Flow
//!
//! ```text
//! Init -> SessionFetched -> CaptchaSolved -> PasswordSubmitted
//!      -> Authenticated
//!      -> ChallengeRequired -> ChallengeSolved -> Authenticated
//!      -> Failed
//! ```
//!
//! The password submission is interpreted into a [`SubmitOutcome`]; when a
//! challenge is required, [`Login::login`] runs it before declaring the
//! session authenticated. Once authenticated, the cookie jar carries the
//! session and can be dumped with [`Login::dump`].
//!
//! # Example
//!
//! ```rust
//! use spotweb::auth::login::Login;
//!
//! let mut login = Login::new(http, &config, credentials).with_solver(solver);
//! login.login().await?;
//! login.save(&store).await?;
//! ```

use std::{fmt, sync::Arc};

use url::Url;

use crate::{
    captcha::{CaptchaSolver, ChallengeKind},
    config::{Config, Endpoints},
    error::{Error, ErrorKind, Result},
    http,
    proof::SecretCache,
    protocol::{self, accounts::LoginResponse},
    secrets::Credentials,
    session,
};

use super::{
    challenge::{Challenge, ChallengeContext},
    csrf_cookie, required_marker, Cookies, SessionDump, SessionStore, CSRF_HEADER, SITE_KEY_V3,
};

/// Progress of a login attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoginState {
    Init,
    SessionFetched,
    CaptchaSolved,
    PasswordSubmitted,
    ChallengeRequired,
    ChallengeSolved,
    Authenticated,
    Failed,
}

impl fmt::Display for LoginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Interpretation of a password submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Authenticated,
    ChallengeRequired(ChallengeContext),
}

pub struct Login {
    http: Arc<http::Client>,
    endpoints: Endpoints,
    solver: Option<Arc<dyn CaptchaSolver>>,

    /// Proof secrets shared by every session opened for this login.
    secrets: Arc<SecretCache>,

    credentials: Credentials,
    state: LoginState,

    csrf_token: Option<String>,
    flow_id: Option<String>,
}

impl Login {
    #[must_use]
    pub fn new(http: Arc<http::Client>, config: &Config, credentials: Credentials) -> Self {
        let secrets = Arc::new(session::secret_cache(&http, config));
        Self {
            http,
            endpoints: config.endpoints.clone(),
            solver: None,
            secrets,

            credentials,
            state: LoginState::Init,

            csrf_token: None,
            flow_id: None,
        }
    }

    #[must_use]
    pub fn with_solver(mut self, solver: Arc<dyn CaptchaSolver>) -> Self {
        self.solver = Some(solver);
        self
    }

    /// Shares `secrets` with other logins and sessions.
    #[must_use]
    pub fn with_secrets(mut self, secrets: Arc<SecretCache>) -> Self {
        self.secrets = secrets;
        self
    }

    /// Restores an authenticated login from a dump without network access.
    ///
    /// The client's cookie jar is replaced by the dumped cookies, stored for
    /// every host that shares the session.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidArgument`] if the dump has no identifier
    /// or no cookies.
    pub fn from_dump(http: Arc<http::Client>, config: &Config, dump: SessionDump) -> Result<Self> {
        let cookies = dump.cookies.into_map();
        if dump.identifier.is_empty() || cookies.is_empty() {
            return Err(Error::invalid_argument(
                "session dump must contain an identifier and cookies",
            ));
        }

        http.clear_cookies()?;
        for origin in config.endpoints.cookie_origins() {
            for (name, value) in &cookies {
                http.set_cookie(name, value, origin)?;
            }
        }

        let credentials = Credentials {
            identifier: dump.identifier,
            password: dump.password,
        };
        let mut login = Self::new(http, config, credentials);
        login.state = LoginState::Authenticated;

        debug!("restored session of {}", login.identifier());
        Ok(login)
    }

    /// Restores the login stored for `identifier`.
    ///
    /// # Errors
    ///
    /// Returns error if the store has no usable dump for `identifier`.
    pub async fn from_store(
        http: Arc<http::Client>,
        config: &Config,
        store: &dyn SessionStore,
        identifier: &str,
    ) -> Result<Self> {
        let dump = store.load(identifier).await?;
        Self::from_dump(http, config, dump)
    }

    #[must_use]
    pub fn state(&self) -> LoginState {
        self.state
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state == LoginState::Authenticated
    }

    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.credentials.identifier
    }

    #[must_use]
    pub fn http(&self) -> &Arc<http::Client> {
        &self.http
    }

    #[must_use]
    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    #[must_use]
    pub fn secrets(&self) -> &Arc<SecretCache> {
        &self.secrets
    }

    /// CSRF token of the accounts flow, as last set by the server.
    #[must_use]
    pub fn csrf_token(&self) -> Option<&str> {
        self.csrf_token.as_deref()
    }

    /// Dumps the identifier, password and cookie jar.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::FailedPrecondition`] unless authenticated.
    pub fn dump(&self) -> Result<SessionDump> {
        if !self.is_authenticated() {
            return Err(Error::failed_precondition(
                "cannot dump a session that is not logged in",
            ));
        }

        Ok(SessionDump {
            identifier: self.credentials.identifier.clone(),
            password: self.credentials.password.clone(),
            cookies: Cookies::Map(self.http.dump_cookies()?),
        })
    }

    /// Saves the session to `store`.
    ///
    /// # Errors
    ///
    /// Returns error if not authenticated or the store fails.
    pub async fn save(&self, store: &dyn SessionStore) -> Result<()> {
        store.save(&self.dump()?).await
    }

    /// Runs the complete login flow.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Auth`] if already authenticated, if no solver is
    /// set, or if the credentials are rejected. Challenge failures surface
    /// as [`ErrorKind::Challenge`].
    pub async fn login(&mut self) -> Result<()> {
        if self.is_authenticated() {
            return Err(Error::auth("user already logged in"));
        }

        let Some(solver) = self.solver.clone() else {
            return Err(Error::auth("solver not set"));
        };

        match self.run(solver.as_ref()).await {
            Ok(()) => {
                self.state = LoginState::Authenticated;
                info!("logged in as {}", self.identifier());
                Ok(())
            }
            Err(e) => {
                self.state = LoginState::Failed;
                Err(e)
            }
        }
    }

    async fn run(&mut self, solver: &dyn CaptchaSolver) -> Result<()> {
        self.fetch_session().await?;

        debug!("solving login captcha");
        let login_url = self.login_url()?;
        let token = solver
            .solve_captcha(login_url.as_str(), SITE_KEY_V3, "accounts/login", ChallengeKind::V3)
            .await?;
        self.state = LoginState::CaptchaSolved;

        if let SubmitOutcome::ChallengeRequired(mut ctx) = self.submit_password(&token).await? {
            self.state = LoginState::ChallengeRequired;
            Challenge::new(&self.http, &self.endpoints, solver)
                .defeat_login(&mut ctx)
                .await?;
            self.state = LoginState::ChallengeSolved;
        }

        // Follow the continuation to pick up the web player cookies.
        let continuation = self.continuation()?;
        self.http
            .execute_ok(self.http.get(continuation, ""), ErrorKind::Auth)
            .await?;

        Ok(())
    }

    fn login_url(&self) -> Result<Url> {
        self.endpoints.accounts.join("en/login").map_err(Into::into)
    }

    fn continuation(&self) -> Result<Url> {
        let flow_id = self.flow_id.as_deref().unwrap_or_default();
        let mut url = self.endpoints.open.clone();
        url.query_pairs_mut().append_pair("flow_ctx", flow_id);
        Ok(url)
    }

    /// Fetches the login page and synchronises cookies across hosts.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Auth`] if a page cannot be fetched or lacks the
    /// flow context marker.
    pub async fn fetch_session(&mut self) -> Result<()> {
        let login_url = self.login_url()?;
        let response = self
            .http
            .execute_ok(self.http.get(login_url.clone(), ""), ErrorKind::Auth)
            .await?;
        self.update_csrf(&response);
        let markup = response.text().await?;
        self.flow_id = Some(required_marker(&markup, "flowCtx", Error::auth)?);

        let remember: String =
            url::form_urlencoded::byte_serialize(self.credentials.identifier.as_bytes()).collect();
        self.http.set_cookie("remember", &remember, &self.endpoints.accounts)?;

        for url in [
            self.endpoints.open.clone(),
            self.endpoints.pixel.join("v2/sync?ce=1&pp=")?,
        ] {
            self.http
                .execute_ok(self.http.get(url, ""), ErrorKind::Auth)
                .await?;
        }

        // Ask for the password form instead of a one-time code.
        let flow_id = self.flow_id.clone().unwrap_or_default();
        let continuation = self.continuation()?;
        let mut url = login_url;
        url.query_pairs_mut()
            .append_pair("login_hint", &self.credentials.identifier)
            .append_pair("allow_password", "1")
            .append_pair("continue", continuation.as_str())
            .append_pair("flow_ctx", &flow_id);
        let response = self
            .http
            .execute_ok(self.http.get(url, ""), ErrorKind::Auth)
            .await?;
        self.update_csrf(&response);

        self.state = LoginState::SessionFetched;
        Ok(())
    }

    /// Submits the password with a solved captcha token.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Auth`] if the request fails or the credentials
    /// are rejected.
    pub async fn submit_password(&mut self, captcha_token: &str) -> Result<SubmitOutcome> {
        let Some(csrf_token) = self.csrf_token.clone() else {
            return Err(Error::auth("no csrf token issued for login"));
        };

        let flow_id = self.flow_id.clone().unwrap_or_default();
        let continuation = self.continuation()?;
        let url = self.endpoints.accounts.join("login/password")?;
        let mut request = self.http.form(
            url,
            &[
                ("username", self.credentials.identifier.as_str()),
                ("password", self.credentials.password.as_str()),
                ("recaptchaToken", captcha_token),
                ("continue", continuation.as_str()),
                ("flowCtx", flow_id.as_str()),
            ],
        );
        request
            .headers_mut()
            .insert(CSRF_HEADER, csrf_token.parse()?);

        let response = self.http.execute_ok(request, ErrorKind::Auth).await?;
        self.update_csrf(&response);
        self.state = LoginState::PasswordSubmitted;

        let body = response.text().await?;
        let parsed: LoginResponse = protocol::json(&body, "login/password").map_err(|_| {
            Error::auth("unexpected response format").with_upstream(body.clone())
        })?;

        interpret(&parsed)
    }

    fn update_csrf(&mut self, response: &reqwest::Response) {
        if let Some(token) = csrf_cookie(response) {
            trace!("csrf token refreshed");
            self.csrf_token = Some(token);
        }
    }
}

impl fmt::Debug for Login {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Login")
            .field("credentials", &self.credentials)
            .field("state", &self.state)
            .field("flow_id", &self.flow_id)
            .finish_non_exhaustive()
    }
}

/// Maps a password submission answer to an outcome.
///
/// # Errors
///
/// Returns [`ErrorKind::Auth`] for reported errors and for answers that are
/// neither successes nor challenge redirects.
pub fn interpret(response: &LoginResponse) -> Result<SubmitOutcome> {
    match response.result.as_deref() {
        Some("ok") => return Ok(SubmitOutcome::Authenticated),
        Some("redirect_required") => {
            let redirect_url = response
                .data
                .as_ref()
                .and_then(|data| data.redirect_url.as_deref())
                .ok_or_else(|| Error::auth("challenge redirect without url"))?;
            return ChallengeContext::from_url(redirect_url).map(SubmitOutcome::ChallengeRequired);
        }
        _ => {}
    }

    let Some(error) = response.error.as_deref() else {
        return Err(Error::auth("unexpected response format")
            .with_upstream(response.result.clone().unwrap_or_default()));
    };

    let err = match error {
        "errorUnknown" => Error::auth("unknown error, needs retrying"),
        "errorInvalidCredentials" => Error::auth("invalid credentials"),
        _ => Error::auth("unforeseen error"),
    };
    Err(err.with_upstream(error))
}
