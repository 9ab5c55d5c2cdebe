//! Password recovery.
//!
//! Requests a recovery e-mail for an account. There is no challenge branch:
//! the recovery endpoint either accepts the request or fails it.

use std::{fmt, sync::Arc};

use uuid::Uuid;

use crate::{
    captcha::{CaptchaSolver, ChallengeKind},
    config::{Config, Endpoints},
    error::{Error, ErrorKind, Result},
    http,
};

use super::{required_marker, CSRF_HEADER, SITE_KEY_V3};

pub struct PasswordReset {
    http: Arc<http::Client>,
    endpoints: Endpoints,
    solver: Option<Arc<dyn CaptchaSolver>>,

    identifier: String,
    csrf_token: Option<String>,
    flow_id: Option<Uuid>,
}

impl fmt::Debug for PasswordReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordReset")
            .field("identifier", &self.identifier)
            .field("flow_id", &self.flow_id)
            .finish_non_exhaustive()
    }
}

impl PasswordReset {
    /// Creates a recovery request for the account with e-mail address or
    /// username `identifier`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidArgument`] if `identifier` is empty.
    pub fn new(
        http: Arc<http::Client>,
        config: &Config,
        identifier: impl Into<String>,
    ) -> Result<Self> {
        let identifier = identifier.into();
        if identifier.is_empty() {
            return Err(Error::invalid_argument("must provide an email or username"));
        }

        Ok(Self {
            http,
            endpoints: config.endpoints.clone(),
            solver: None,

            identifier,
            csrf_token: None,
            flow_id: None,
        })
    }

    #[must_use]
    pub fn with_solver(mut self, solver: Arc<dyn CaptchaSolver>) -> Self {
        self.solver = Some(solver);
        self
    }

    /// Requests the recovery e-mail.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Auth`] if no solver is set, the reset page lacks
    /// its CSRF marker or the request is rejected.
    pub async fn reset(&mut self) -> Result<()> {
        let Some(solver) = self.solver.clone() else {
            return Err(Error::auth("solver not set"));
        };

        let page_url = self.endpoints.accounts.join("en/password-reset")?;
        let markup = self
            .http
            .text(self.http.get(page_url.clone(), ""), ErrorKind::Auth)
            .await?;
        self.csrf_token = Some(required_marker(&markup, "csrf", Error::auth)?);
        self.flow_id = Some(Uuid::new_v4());

        debug!("solving password reset captcha");
        let token = solver
            .solve_captcha(
                page_url.as_str(),
                SITE_KEY_V3,
                "password_reset_web/recovery",
                ChallengeKind::V3,
            )
            .await?;

        self.submit(&token).await?;
        info!("requested password reset for {}", self.identifier);
        Ok(())
    }

    async fn submit(&self, captcha_token: &str) -> Result<()> {
        let (Some(csrf_token), Some(flow_id)) = (&self.csrf_token, self.flow_id) else {
            return Err(Error::auth("password reset session not fetched"));
        };

        let url = self.endpoints.accounts.join("api/password/recovery")?;
        let flow_id = flow_id.to_string();
        let mut request = self.http.form(
            url,
            &[
                ("captcha", captcha_token),
                ("emailOrUsername", self.identifier.as_str()),
                ("flowId", flow_id.as_str()),
            ],
        );
        request
            .headers_mut()
            .insert(CSRF_HEADER, csrf_token.parse()?);

        self.http.execute_ok(request, ErrorKind::Auth).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::recording_solver;
    use url::Url;
    use wiremock::{
        matchers::{body_string_contains, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn setup(server: &MockServer) -> (Config, Arc<http::Client>) {
        let base = Url::parse(&server.uri()).unwrap();
        let config = Config::with_endpoints(Endpoints::single_origin(&base));
        let http = Arc::new(http::Client::new(&config).unwrap());
        (config, http)
    }

    #[test]
    fn empty_identifier_is_rejected() {
        let config = Config::default();
        let http = Arc::new(http::Client::new(&config).unwrap());
        let err = PasswordReset::new(Arc::clone(&http), &config, "").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        let reset = PasswordReset::new(http, &config, "someone").unwrap();
        assert!(format!("{reset:?}").contains("someone"));
    }

    #[tokio::test]
    async fn requests_recovery_email() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/en/password-reset"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"csrf":"RESET-CSRF","x":1}"#),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/password/recovery"))
            .and(header("x-csrf-token", "RESET-CSRF"))
            .and(body_string_contains("captcha=token-V3"))
            .and(body_string_contains("emailOrUsername=someone"))
            .and(body_string_contains("flowId="))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (config, http) = setup(&server);
        let solver = recording_solver();
        let mut reset = PasswordReset::new(http, &config, "someone")
            .unwrap()
            .with_solver(solver.clone());

        reset.reset().await.unwrap();

        let calls = solver.calls.lock().unwrap();
        assert_eq!(calls[0].2, "password_reset_web/recovery");
        assert!(calls[0].0.ends_with("/en/password-reset"));
    }

    #[tokio::test]
    async fn missing_csrf_marker_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/en/password-reset"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;

        let (config, http) = setup(&server);
        let solver = recording_solver();
        let mut reset = PasswordReset::new(http, &config, "someone")
            .unwrap()
            .with_solver(solver.clone());

        let err = reset.reset().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Auth);
        assert!(solver.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_solver_is_an_error() {
        let config = Config::default();
        let http = Arc::new(http::Client::new(&config).unwrap());
        let mut reset = PasswordReset::new(http, &config, "someone").unwrap();

        let err = reset.reset().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Auth);
    }
}
