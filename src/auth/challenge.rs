//! Interactive reCAPTCHA v2 challenges.
//!
//! The accounts front end may interrupt a login or a registration with a
//! challenge hosted by a separate service. Its URL embeds the identifiers
//! needed to answer it:
//!
//! ```text
//! https://challenge.spotify.com/c/<session_id>/<challenge_id>/recaptcha
//! ```
//!
//! A login challenge ends with a completion redirect on the accounts
//! service; a registration challenge is completed by the signup API.

use reqwest::{header::HeaderValue, Method};
use url::Url;

use crate::{
    captcha::{CaptchaSolver, ChallengeKind},
    config::Endpoints,
    error::{Error, ErrorKind, Result},
    http,
    protocol::{
        self,
        accounts::{ChallengeCommand, ChallengeResponse},
    },
};

use super::SITE_KEY_V2;

/// State of one challenge attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChallengeContext {
    pub challenge_url: Url,
    pub session_id: String,
    pub challenge_id: String,
    pub site_key: String,
    pub interaction_hash: Option<String>,
    pub interaction_reference: Option<String>,
}

impl ChallengeContext {
    /// Parses the session and challenge ids from a challenge URL.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Challenge`] if the URL is malformed or its path
    /// lacks the `c/<session_id>/<challenge_id>` segments.
    pub fn from_url(challenge_url: &str) -> Result<Self> {
        let url = Url::parse(challenge_url)
            .map_err(|e| Error::challenge(format!("invalid challenge url: {e}")))?;

        let (session_id, challenge_id) = url
            .path_segments()
            .and_then(|segments| {
                let mut segments = segments.skip_while(|segment| *segment != "c").skip(1);
                let session_id = segments.next().filter(|id| !id.is_empty())?;
                let challenge_id = segments.next().filter(|id| !id.is_empty())?;
                Some((session_id.to_owned(), challenge_id.to_owned()))
            })
            .ok_or_else(|| {
                Error::challenge("challenge url lacks session and challenge ids")
                    .with_upstream(challenge_url)
            })?;

        Ok(Self {
            challenge_url: url,
            session_id,
            challenge_id,
            site_key: SITE_KEY_V2.to_owned(),
            interaction_hash: None,
            interaction_reference: None,
        })
    }
}

/// Runs challenge steps with the flow's HTTP client and solver.
pub struct Challenge<'a> {
    http: &'a http::Client,
    endpoints: &'a Endpoints,
    solver: &'a dyn CaptchaSolver,
}

impl<'a> Challenge<'a> {
    /// Trace context the signup front end sends with challenge commands.
    pub const SIGNUP_TRACE_CONTEXT: &'static str =
        "000000000000000004ec7cfe60aa92b5/8088460714428896449;o=1";

    #[must_use]
    pub fn new(
        http: &'a http::Client,
        endpoints: &'a Endpoints,
        solver: &'a dyn CaptchaSolver,
    ) -> Self {
        Self {
            http,
            endpoints,
            solver,
        }
    }

    /// Solves a login challenge and follows the completion redirect.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Challenge`] if any step fails.
    pub async fn defeat_login(&self, ctx: &mut ChallengeContext) -> Result<()> {
        info!("login challenge detected, attempting to solve");

        let request = self.http.get(ctx.challenge_url.clone(), "");
        self.http
            .execute_ok(request, ErrorKind::Challenge)
            .await
            .map_err(|e| challenge_error("could not get challenge", e))?;

        // The login challenge is solved against the service origin.
        let captcha_url = self.endpoints.challenge.as_str().trim_end_matches('/');
        let token = self
            .solver
            .solve_captcha(captcha_url, &ctx.site_key, "accounts/login", ChallengeKind::V2)
            .await?;

        let response = self.invoke(ctx, &token, None).await?;
        let completed = response.completed.ok_or_else(|| {
            Error::challenge("challenge response lacks completion details")
        })?;
        ctx.interaction_hash = Some(completed.hash);
        ctx.interaction_reference = Some(completed.interaction_reference);

        self.complete_login(ctx).await?;
        info!("login challenge solved");
        Ok(())
    }

    /// Posts the captcha solution for `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Challenge`] if the command is rejected or the
    /// answer is not JSON.
    pub async fn invoke(
        &self,
        ctx: &ChallengeContext,
        token: &str,
        trace_context: Option<&'static str>,
    ) -> Result<ChallengeResponse> {
        let url = self
            .endpoints
            .challenge
            .join("api/v1/invoke-challenge-command")?;
        let command = ChallengeCommand::solve(&ctx.session_id, &ctx.challenge_id, token);

        let mut request = self.http.json(Method::POST, url, &command)?;
        if let Some(trace_context) = trace_context {
            request.headers_mut().insert(
                "x-cloud-trace-context",
                HeaderValue::from_static(trace_context),
            );
        }

        let body = self
            .http
            .text(request, ErrorKind::Challenge)
            .await
            .map_err(|e| challenge_error("could not submit challenge", e))?;

        protocol::json(&body, "invoke-challenge-command").map_err(|e| {
            Error::challenge(format!("invalid challenge response: {e}")).with_upstream(body)
        })
    }

    async fn complete_login(&self, ctx: &ChallengeContext) -> Result<()> {
        let (Some(hash), Some(reference)) = (&ctx.interaction_hash, &ctx.interaction_reference)
        else {
            return Err(Error::challenge("challenge was not solved"));
        };

        let mut url = self.endpoints.accounts.join("login/challenge-completed")?;
        url.query_pairs_mut()
            .append_pair("sessionId", &ctx.session_id)
            .append_pair("interact_ref", reference)
            .append_pair("hash", hash);

        self.http
            .execute_ok(self.http.get(url, ""), ErrorKind::Challenge)
            .await
            .map_err(|e| challenge_error("could not complete challenge", e))?;
        Ok(())
    }
}

/// Reclassifies a failed challenge step, keeping transport errors.
fn challenge_error(context: &str, e: Error) -> Error {
    if e.kind == ErrorKind::Transport {
        return e;
    }

    Error {
        kind: ErrorKind::Challenge,
        error: format!("{context}: {}", e.error).into(),
        upstream: e.upstream,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{auth::tests::recording_solver, config::Config};
    use wiremock::{
        matchers::{body_json, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    #[test]
    fn ids_are_read_from_the_path() {
        let ctx =
            ChallengeContext::from_url("https://challenge.spotify.com/c/SESS/CHAL/recaptcha")
                .unwrap();
        assert_eq!(ctx.session_id, "SESS");
        assert_eq!(ctx.challenge_id, "CHAL");
        assert_eq!(ctx.site_key, SITE_KEY_V2);
    }

    #[test]
    fn malformed_urls_are_challenge_errors() {
        for url in [
            "not a url",
            "https://challenge.spotify.com/",
            "https://challenge.spotify.com/c/SESS",
            "https://challenge.spotify.com/c//CHAL",
        ] {
            let err = ChallengeContext::from_url(url).unwrap_err();
            assert_eq!(err.kind, ErrorKind::Challenge, "{url}");
        }
    }

    #[tokio::test]
    async fn login_challenge_is_solved_and_completed() {
        let server = MockServer::start().await;
        let base = Url::parse(&server.uri()).unwrap();
        let config = Config::with_endpoints(Endpoints::single_origin(&base));
        let http = http::Client::new(&config).unwrap();

        Mock::given(method("GET"))
            .and(path("/c/SESS/CHAL/recaptcha"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/invoke-challenge-command"))
            .and(body_json(serde_json::json!({
                "session_id": "SESS",
                "challenge_id": "CHAL",
                "recaptcha_challenge_v1": {"solve": {"recaptcha_token": "token-V2"}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"completed":{"hash":"H","interaction_reference":"R"}}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/login/challenge-completed"))
            .and(query_param("sessionId", "SESS"))
            .and(query_param("interact_ref", "R"))
            .and(query_param("hash", "H"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let solver = recording_solver();
        let mut ctx =
            ChallengeContext::from_url(&format!("{}/c/SESS/CHAL/recaptcha", server.uri()))
                .unwrap();
        Challenge::new(&http, &config.endpoints, solver.as_ref())
            .defeat_login(&mut ctx)
            .await
            .unwrap();

        assert_eq!(ctx.interaction_hash.as_deref(), Some("H"));
        let calls = solver.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, SITE_KEY_V2);
        assert_eq!(calls[0].3, ChallengeKind::V2);
    }

    #[tokio::test]
    async fn rejected_commands_are_challenge_errors() {
        let server = MockServer::start().await;
        let base = Url::parse(&server.uri()).unwrap();
        let config = Config::with_endpoints(Endpoints::single_origin(&base));
        let http = http::Client::new(&config).unwrap();

        Mock::given(method("POST"))
            .and(path("/api/v1/invoke-challenge-command"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad token"))
            .mount(&server)
            .await;

        let solver = recording_solver();
        let ctx = ChallengeContext::from_url("https://challenge.spotify.com/c/S/C/x").unwrap();
        let err = Challenge::new(&http, &config.endpoints, solver.as_ref())
            .invoke(&ctx, "t", None)
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Challenge);
        assert_eq!(err.upstream.as_deref(), Some("bad token"));
    }
}
