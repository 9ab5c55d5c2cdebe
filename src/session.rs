//! Credential and session management for the private web player APIs.
//!
//! A [`Session`] obtains everything needed to stamp an outgoing request as
//! coming from an authenticated web player:
//!
//! * an access token and client id, exchanged at the token endpoint for a
//!   time-based proof
//! * a client token, exchanged for the client id, device id and the version
//!   of the current web player build
//! * persisted query hashes, discovered by scanning the web player bundle
//!
//! # Token acquisition
//!
//! Tokens are acquired in order, tracked as a [`TokenState`]:
//!
//! ```text
//! Unset -> HasAccessToken -> HasClientToken
//! ```
//!
//! Every step is idempotent. Callers may ask for any later state at any time
//! and only the missing steps are performed. An expired access token counts
//! as unset. A `401` answer to an authorized request invalidates both tokens.
//!
//! # Example
//!
//! ```rust
//! use spotweb::session::Session;
//!
//! let mut session = Session::new(http, &config);
//! let hash = session.discover_operation_hashes("searchDesktop").await?;
//! let mut request = http.get(url, "");
//! session.authorize(&mut request).await?;
//! ```

use std::{collections::HashMap, sync::Arc};

use regex_lite::Regex;
use reqwest::{
    header::{HeaderValue, ACCEPT, AUTHORIZATION},
    Method, StatusCode,
};
use url::Url;

use crate::{
    config::{Config, Endpoints},
    error::{Error, ErrorKind, Result},
    http,
    proof::{HttpSecretSource, Proof, ProofGenerator, SecretCache},
    protocol::{self, client_token, token::TokenResponse},
    tokens::{AccessToken, ClientToken, TokenState},
    util,
};

/// Cookie carrying the web player device id.
const DEVICE_ID_COOKIE: &str = "sp_t";

/// Route chunks scanned for query hashes in addition to the main bundle.
const ROUTE_CHUNKS: [&str; 2] = ["xpui-routes-search", "xpui-routes-track-v2"];

/// Header carrying the client token.
const CLIENT_TOKEN_HEADER: &str = "client-token";

pub struct Session {
    http: Arc<http::Client>,
    endpoints: Endpoints,
    proof: ProofGenerator,

    access_token: Option<AccessToken>,
    client_token: Option<ClientToken>,
    device_id: Option<String>,
    client_version: Option<String>,

    /// Markup of the web player entry page.
    entry_page: Option<String>,

    /// Concatenated text of the bundle and its route chunks.
    bundle: Option<String>,

    /// Memoised persisted query hashes by operation name.
    operation_hashes: HashMap<String, String>,
}

impl Session {
    /// Creates an empty session with its own proof secret cache, fetching
    /// from the configured secrets endpoint.
    #[must_use]
    pub fn new(http: Arc<http::Client>, config: &Config) -> Self {
        let secrets = Arc::new(secret_cache(&http, config));
        Self::with_secrets(http, config, secrets)
    }

    /// Creates an empty session drawing proof secrets from a cache shared
    /// with other sessions.
    #[must_use]
    pub fn with_secrets(
        http: Arc<http::Client>,
        config: &Config,
        secrets: Arc<SecretCache>,
    ) -> Self {
        Self::with_proof(http, config, ProofGenerator::with_cache(secrets))
    }

    /// Creates an empty session generating proofs with `proof`.
    #[must_use]
    pub fn with_proof(http: Arc<http::Client>, config: &Config, proof: ProofGenerator) -> Self {
        Self {
            http,
            endpoints: config.endpoints.clone(),
            proof,

            access_token: None,
            client_token: None,
            device_id: None,
            client_version: None,

            entry_page: None,
            bundle: None,
            operation_hashes: HashMap::new(),
        }
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
    pub fn access_token(&self) -> Option<&AccessToken> {
        self.access_token.as_ref()
    }

    #[must_use]
    pub fn client_token(&self) -> Option<&ClientToken> {
        self.client_token.as_ref()
    }

    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.access_token.as_ref().map(|token| token.client_id.as_str())
    }

    #[must_use]
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    #[must_use]
    pub fn client_version(&self) -> Option<&str> {
        self.client_version.as_deref()
    }

    /// Seeds the session with a known access token.
    pub fn set_access_token(&mut self, token: AccessToken) {
        self.access_token = Some(token);
    }

    /// Seeds the session with a known client token.
    pub fn set_client_token(&mut self, token: ClientToken) {
        self.client_token = Some(token);
    }

    /// Seeds the session with a known device id.
    pub fn set_device_id(&mut self, device_id: impl Into<String>) {
        self.device_id = Some(device_id.into());
    }

    /// Returns how far token acquisition has progressed.
    #[must_use]
    pub fn token_state(&self) -> TokenState {
        match (&self.access_token, &self.client_token) {
            (Some(access), _) if access.is_expired() => TokenState::Unset,
            (Some(_), Some(_)) => TokenState::HasClientToken,
            (Some(_), None) => TokenState::HasAccessToken,
            (None, _) => TokenState::Unset,
        }
    }

    /// Drops both tokens and the memoised query hashes.
    pub fn invalidate(&mut self) {
        debug!("invalidating session tokens");
        self.access_token = None;
        self.client_token = None;
        self.operation_hashes.clear();
    }

    /// Generates a fresh time-based proof.
    ///
    /// # Errors
    ///
    /// As [`ProofGenerator::generate_proof`].
    pub async fn request_proof(&self) -> Result<Proof> {
        self.proof.generate_proof().await
    }

    /// Obtains an access token and client id, unless a valid one is held.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Session`] if the entry page or the token endpoint
    /// cannot be fetched.
    pub async fn bootstrap_session(&mut self) -> Result<()> {
        if self.token_state() >= TokenState::HasAccessToken {
            return Ok(());
        }

        // An expired access token invalidates the client token as well.
        self.client_token = None;

        let request = self.http.get(self.endpoints.open.clone(), "");
        let markup = self
            .http
            .text(request, ErrorKind::Session)
            .await
            .map_err(|e| session_error("could not get session", e))?;
        self.entry_page = Some(markup);

        if self.device_id.is_none() {
            let device_id = match self.http.cookie(DEVICE_ID_COOKIE)? {
                Some(device_id) => device_id,
                None => util::random_hex(32),
            };
            trace!("device id: {device_id}");
            self.device_id = Some(device_id);
        }

        let proof = self.request_proof().await?;
        let mut url = self.endpoints.open.join("api/token")?;
        url.query_pairs_mut()
            .append_pair("reason", "init")
            .append_pair("productType", "web-player")
            .append_pair("totp", &proof.code)
            .append_pair("totpServer", &proof.code)
            .append_pair("totpVer", &proof.version);

        let body = self
            .http
            .text(self.http.get(url, ""), ErrorKind::Session)
            .await
            .map_err(|e| session_error("could not get access token", e))?;
        let response: TokenResponse = protocol::json(&body, "token")?;

        let token = AccessToken::from(response);
        info!(
            "obtained {} access token, valid for {}s",
            if token.is_anonymous { "anonymous" } else { "user" },
            token.time_to_live().as_secs()
        );
        self.access_token = Some(token);

        Ok(())
    }

    /// Exchanges client id, device id and client version for a client
    /// token, performing whatever bootstrap steps are missing first.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Session`] on fetch failures and on any response
    /// other than a granted token.
    pub async fn acquire_client_token(&mut self) -> Result<()> {
        if self.token_state() == TokenState::HasClientToken {
            return Ok(());
        }

        self.bootstrap_session().await?;
        if self.device_id.is_none() {
            self.device_id = Some(util::random_hex(32));
        }

        if self.client_version.is_none() {
            self.load_bundle().await?;
        }

        let (Some(client_id), Some(device_id), Some(client_version)) =
            (self.client_id(), self.device_id(), self.client_version())
        else {
            return Err(Error::session("bootstrap left session incomplete"));
        };

        let url = self.endpoints.client_token.join("v1/clienttoken")?;
        let body = client_token::Request::new(client_version, client_id, device_id);
        let mut request = self.http.json(Method::POST, url, &body)?;
        request
            .headers_mut()
            .insert(ACCEPT, HeaderValue::from_static("application/json"));

        let text = self
            .http
            .text(request, ErrorKind::Session)
            .await
            .map_err(|e| session_error("could not get client token", e))?;
        let response: client_token::Response = protocol::json(&text, "clienttoken")?;

        self.client_token = Some(ClientToken::try_from(response)?);
        debug!("obtained client token");

        Ok(())
    }

    /// Locates the web player bundle in the entry page markup.
    ///
    /// The primary CDN is searched first and the fallback CDN only when the
    /// primary yields no match. The second match is the bundle.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Validation`] if fewer than two script URLs are
    /// found, and [`ErrorKind::Session`] if the entry page cannot be fetched.
    pub async fn resolve_asset_bundle(&mut self) -> Result<Url> {
        if self.entry_page.is_none() {
            let request = self.http.get(self.endpoints.open.clone(), "");
            let markup = self
                .http
                .text(request, ErrorKind::Session)
                .await
                .map_err(|e| session_error("could not get session", e))?;
            self.entry_page = Some(markup);
        }
        let markup = self.entry_page.as_deref().unwrap_or_default();

        let mut matches = bundle_urls(markup, &self.endpoints.cdn)?;
        if matches.is_empty() {
            matches = bundle_urls(markup, &self.endpoints.cdn_fallback)?;
        }

        let Some(bundle) = matches.get(1) else {
            return Err(Error::validation(format!(
                "expected at least two web player scripts, found {}",
                matches.len()
            )));
        };

        trace!("web player bundle: {bundle}");
        Url::parse(bundle).map_err(Into::into)
    }

    /// Downloads the bundle and its route chunks, recording the client
    /// version and caching the concatenated text.
    async fn load_bundle(&mut self) -> Result<()> {
        let bundle_url = self.resolve_asset_bundle().await?;
        let mut text = self
            .http
            .text(self.http.get(bundle_url, ""), ErrorKind::Session)
            .await
            .map_err(|e| session_error("could not get web player bundle", e))?;

        let client_version = find_client_version(&text)
            .ok_or_else(|| Error::validation("client version missing from bundle"))?
            .to_owned();
        debug!("web player version {client_version}");

        let chunks: Vec<String> = ROUTE_CHUNKS
            .iter()
            .filter_map(|route| {
                let chunk = route_chunk(&text, route);
                if chunk.is_none() {
                    warn!("no chunk found for {route}, its query hashes will be missing");
                }
                chunk
            })
            .collect();

        for chunk in chunks {
            let url = self.endpoints.cdn.join(&chunk)?;
            let chunk_text = self
                .http
                .text(self.http.get(url, ""), ErrorKind::Session)
                .await
                .map_err(|e| session_error("could not get route chunk", e))?;
            text.push_str(&chunk_text);
        }

        self.client_version = Some(client_version);
        self.bundle = Some(text);
        Ok(())
    }

    /// Returns the persisted query hash of `operation_name`.
    ///
    /// The bundle is downloaded once; later lookups reuse its text. When an
    /// operation is declared both as a mutation and as a query, the mutation
    /// hash is returned.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Validation`] if the operation is not declared and
    /// [`ErrorKind::Session`] if the bundle cannot be fetched.
    pub async fn discover_operation_hashes(&mut self, operation_name: &str) -> Result<String> {
        if let Some(hash) = self.operation_hashes.get(operation_name) {
            return Ok(hash.clone());
        }

        if self.bundle.is_none() {
            self.load_bundle().await?;
        }

        let bundle = self.bundle.as_deref().unwrap_or_default();
        let hash = find_operation_hash(bundle, operation_name)
            .ok_or_else(|| {
                Error::validation(format!("operation {operation_name} not found in bundle"))
            })?
            .to_owned();

        self.operation_hashes
            .insert(operation_name.to_owned(), hash.clone());
        Ok(hash)
    }

    /// Stamps `request` with the access and client tokens, acquiring them
    /// first if needed.
    ///
    /// # Errors
    ///
    /// Returns error if the tokens cannot be acquired.
    pub async fn authorize(&mut self, request: &mut reqwest::Request) -> Result<()> {
        self.acquire_client_token().await?;

        let (Some(access), Some(client)) = (&self.access_token, &self.client_token) else {
            return Err(Error::session("tokens missing after acquisition"));
        };

        let headers = request.headers_mut();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", access.token))?,
        );
        headers.insert(CLIENT_TOKEN_HEADER, HeaderValue::from_str(&client.token)?);

        Ok(())
    }

    /// Authorizes and executes `request`.
    ///
    /// A `401` invalidates the session and fails with
    /// [`ErrorKind::Session`]; any other unsuccessful status fails with
    /// `kind`.
    ///
    /// # Errors
    ///
    /// Returns error if authorization, the request or its status fails.
    pub async fn send_authorized(
        &mut self,
        mut request: reqwest::Request,
        kind: ErrorKind,
    ) -> Result<reqwest::Response> {
        self.authorize(&mut request).await?;

        let path = request.url().path().to_owned();
        let response = self.http.execute(request).await?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            self.invalidate();
            return Err(Error::session(format!("{path} rejected the session tokens")));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::new(kind, format!("{path} returned {status}")).with_upstream(body));
        }

        Ok(response)
    }
}

/// Classifies an HTTP failure as a session error, keeping transport errors.
/// Secret cache fetching from the configured secrets endpoint.
#[must_use]
pub fn secret_cache(http: &Arc<http::Client>, config: &Config) -> SecretCache {
    SecretCache::new(HttpSecretSource::new(
        Arc::clone(http),
        config.endpoints.secrets.clone(),
    ))
}

fn session_error(context: &str, e: Error) -> Error {
    match e.kind {
        ErrorKind::Transport | ErrorKind::Validation => e,
        _ => Error {
            kind: ErrorKind::Session,
            error: format!("{context}: {}", e.error).into(),
            upstream: e.upstream,
        },
    }
}

/// All web player script URLs under `cdn` in `markup`.
fn bundle_urls<'a>(markup: &'a str, cdn: &Url) -> Result<Vec<&'a str>> {
    let pattern = format!(r"{}web-player.*?\.js", regex_lite::escape(cdn.as_str()));
    let re = Regex::new(&pattern).map_err(|e| Error::internal(e.to_string()))?;
    Ok(re.find_iter(markup).map(|m| m.as_str()).collect())
}

/// Reads the `clientVersion:"..."` literal from the bundle.
fn find_client_version(bundle: &str) -> Option<&str> {
    const MARKER: &str = "clientVersion:\"";
    let start = bundle.find(MARKER)? + MARKER.len();
    let len = bundle[start..].find('"')?;
    Some(&bundle[start..start + len])
}

/// Resolves the file name of a route chunk from the bundle's chunk maps.
///
/// Webpack emits one map from chunk id to name and one from chunk id to
/// content hash, e.g. `{123:"xpui-routes-search"}` and `{123:"0f3a9c"}`;
/// the file is `xpui-routes-search.0f3a9c.js`.
fn route_chunk(bundle: &str, route: &str) -> Option<String> {
    let name_marker = format!(":\"{route}\"");
    let position = bundle.find(&name_marker)?;
    let id = bundle[..position].rsplit([',', '{']).next()?;
    if id.is_empty() {
        return None;
    }

    let key = format!("{id}:\"");
    let mut values = bundle.match_indices(&key).filter_map(|(index, _)| {
        let preceding = bundle[..index].chars().next_back();
        if !matches!(preceding, Some(',' | '{')) {
            return None;
        }
        let start = index + key.len();
        let len = bundle[start..].find('"')?;
        Some(&bundle[start..start + len])
    });

    let name = values.next()?;
    let hash = values.next()?;
    Some(format!("{name}.{hash}.js"))
}

/// Finds the persisted query hash of `operation_name`, preferring the
/// mutation declaration over the query declaration.
fn find_operation_hash<'a>(bundle: &'a str, operation_name: &str) -> Option<&'a str> {
    ["mutation", "query"].iter().find_map(|discriminator| {
        let marker = format!("\"{operation_name}\",\"{discriminator}\",\"");
        let start = bundle.find(&marker)? + marker.len();
        let len = bundle[start..].find('"')?;
        Some(&bundle[start..start + len])
    })
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::{Duration, SystemTime},
    };

    use super::*;
    use crate::proof::{Secret, SecretSource};
    use wiremock::{
        matchers::{body_partial_json, header, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    fn session(server: &MockServer) -> Session {
        let base = Url::parse(&server.uri()).unwrap();
        let config = Config::with_endpoints(Endpoints::single_origin(&base));
        let http = Arc::new(http::Client::new(&config).unwrap());
        Session::new(http, &config)
    }

    fn entry_page(server: &MockServer) -> String {
        let cdn = format!("{}/cdn/build/web-player/", server.uri());
        format!(
            r#"<html><script src="{cdn}web-player.vendor.js"></script><script src="{cdn}web-player.abc123.js"></script></html>"#
        )
    }

    const BUNDLE: &str = concat!(
        r#"var e={clientVersion:"1.2.50.100.g123abc",x:1};"#,
        r#"n.u=e=>({41:"xpui-routes-search",77:"xpui-routes-track-v2"}[e]+"."+{41:"aaa111",77:"bbb222"}[e]+".js");"#,
        r#"const a=new s.l("searchDesktop","query","q-hash",null);"#,
    );

    async fn mount_bootstrap(server: &MockServer, expected: u64) {
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("set-cookie", "sp_t=device-from-cookie; Path=/")
                    .set_body_string(entry_page(server)),
            )
            .expect(expected)
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/token"))
            .and(query_param("reason", "init"))
            .and(query_param("productType", "web-player"))
            .and(query_param("totpVer", "61"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"clientId":"cid","accessToken":"at","accessTokenExpirationTimestampMs":4102444800000,"isAnonymous":true}"#,
            ))
            .expect(expected)
            .mount(server)
            .await;
    }

    async fn mount_bundle(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/cdn/build/web-player/web-player.abc123.js"))
            .respond_with(ResponseTemplate::new(200).set_body_string(BUNDLE))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cdn/build/web-player/xpui-routes-search.aaa111.js"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"new s.l("searchDesktop","mutation","m-hash");"#,
            ))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cdn/build/web-player/xpui-routes-track-v2.bbb222.js"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"new s.l("getTrack","query","t-hash");"#,
            ))
            .expect(1)
            .mount(server)
            .await;
    }

    #[test]
    fn mutation_hash_wins_over_query_hash() {
        let corpus = r#"("fetchPlaylist","query","111");("fetchPlaylist","mutation","222");"#;
        assert_eq!(find_operation_hash(corpus, "fetchPlaylist"), Some("222"));

        let corpus = r#"("fetchPlaylist","mutation","222");("fetchPlaylist","query","111");"#;
        assert_eq!(find_operation_hash(corpus, "fetchPlaylist"), Some("222"));

        let corpus = r#"("fetchPlaylist","query","111");"#;
        assert_eq!(find_operation_hash(corpus, "fetchPlaylist"), Some("111"));
        assert_eq!(find_operation_hash(corpus, "addToPlaylist"), None);
    }

    #[test]
    fn route_chunks_resolve_from_chunk_maps() {
        assert_eq!(
            route_chunk(BUNDLE, "xpui-routes-search").as_deref(),
            Some("xpui-routes-search.aaa111.js")
        );
        assert_eq!(
            route_chunk(BUNDLE, "xpui-routes-track-v2").as_deref(),
            Some("xpui-routes-track-v2.bbb222.js")
        );
        assert_eq!(route_chunk(BUNDLE, "xpui-routes-album"), None);
    }

    #[test]
    fn client_version_literal() {
        assert_eq!(find_client_version(BUNDLE), Some("1.2.50.100.g123abc"));
    }

    #[test]
    fn second_bundle_match_is_used_with_fallback_domain() {
        let cdn = Url::parse("https://open.spotifycdn.com/cdn/build/web-player/").unwrap();
        let exp = Url::parse("https://open-exp.spotifycdn.com/cdn/build/web-player/").unwrap();
        let markup = r#"<script src="https://open-exp.spotifycdn.com/cdn/build/web-player/web-player.a.js"></script>
<script src="https://open-exp.spotifycdn.com/cdn/build/web-player/web-player.b.js"></script>"#;

        assert!(bundle_urls(markup, &cdn).unwrap().is_empty());
        let urls = bundle_urls(markup, &exp).unwrap();
        assert_eq!(
            urls[1],
            "https://open-exp.spotifycdn.com/cdn/build/web-player/web-player.b.js"
        );
    }

    #[tokio::test]
    async fn single_bundle_match_is_a_validation_error() {
        let server = MockServer::start().await;
        let cdn = format!("{}/cdn/build/web-player/", server.uri());
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(format!(r#"<script src="{cdn}web-player.only.js">"#)),
            )
            .mount(&server)
            .await;

        let err = session(&server).resolve_asset_bundle().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn bootstrap_is_idempotent() {
        let server = MockServer::start().await;
        mount_bootstrap(&server, 1).await;

        let mut session = session(&server);
        assert_eq!(session.token_state(), TokenState::Unset);

        session.bootstrap_session().await.unwrap();
        assert_eq!(session.token_state(), TokenState::HasAccessToken);
        assert_eq!(session.client_id(), Some("cid"));
        assert_eq!(session.device_id(), Some("device-from-cookie"));

        // Mocks expect exactly one call each.
        session.bootstrap_session().await.unwrap();
    }

    struct CountingSource {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl SecretSource for CountingSource {
        async fn fetch(&self) -> Result<Secret> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Secret {
                version: "61".to_owned(),
                bytes: vec![7, 8, 9],
            })
        }
    }

    #[tokio::test]
    async fn sessions_share_one_secret_cache() {
        let server = MockServer::start().await;
        mount_bootstrap(&server, 2).await;

        let base = Url::parse(&server.uri()).unwrap();
        let config = Config::with_endpoints(Endpoints::single_origin(&base));
        let http = Arc::new(http::Client::new(&config).unwrap());

        let calls = Arc::new(AtomicUsize::new(0));
        let secrets = Arc::new(SecretCache::new(CountingSource {
            calls: Arc::clone(&calls),
        }));

        let mut first = Session::with_secrets(Arc::clone(&http), &config, Arc::clone(&secrets));
        let mut second = Session::with_secrets(http, &config, secrets);
        first.bootstrap_session().await.unwrap();
        second.bootstrap_session().await.unwrap();

        assert_eq!(first.client_id(), Some("cid"));
        assert_eq!(second.client_id(), Some("cid"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bundle_without_chunk_maps_still_loads() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(entry_page(&server)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cdn/build/web-player/web-player.abc123.js"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"var e={clientVersion:"1.2.3"};new s.l("searchDesktop","query","q-hash");"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let mut session = session(&server);
        assert_eq!(
            session.discover_operation_hashes("searchDesktop").await.unwrap(),
            "q-hash"
        );
        assert_eq!(session.client_version(), Some("1.2.3"));

        let err = session.discover_operation_hashes("getTrack").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn populated_session_skips_network() {
        let server = MockServer::start().await;
        mount_bootstrap(&server, 0).await;

        let mut session = session(&server);
        session.set_access_token(AccessToken {
            token: "at".to_owned(),
            client_id: "cid".to_owned(),
            expires_at: SystemTime::now() + Duration::from_secs(3600),
            is_anonymous: false,
        });
        session.bootstrap_session().await.unwrap();
    }

    #[tokio::test]
    async fn failed_entry_page_is_a_session_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = session(&server).bootstrap_session().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Session);
    }

    #[tokio::test]
    async fn acquires_client_token_and_discovers_hashes() {
        let server = MockServer::start().await;
        mount_bootstrap(&server, 1).await;
        mount_bundle(&server).await;
        Mock::given(method("POST"))
            .and(path("/v1/clienttoken"))
            .and(body_partial_json(serde_json::json!({
                "client_data": {
                    "client_version": "1.2.50.100.g123abc",
                    "client_id": "cid",
                    "js_sdk_data": {"device_id": "device-from-cookie"}
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"response_type":"RESPONSE_GRANTED_TOKEN_RESPONSE","granted_token":{"token":"ct","expires_after_seconds":1209600}}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let mut session = session(&server);
        session.acquire_client_token().await.unwrap();
        assert_eq!(session.token_state(), TokenState::HasClientToken);
        assert_eq!(session.client_version(), Some("1.2.50.100.g123abc"));

        // The cached bundle text answers both lookups.
        assert_eq!(
            session.discover_operation_hashes("searchDesktop").await.unwrap(),
            "m-hash"
        );
        assert_eq!(
            session.discover_operation_hashes("getTrack").await.unwrap(),
            "t-hash"
        );
        let err = session
            .discover_operation_hashes("unknownOperation")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);

        // Already granted: no further exchange.
        session.acquire_client_token().await.unwrap();
    }

    #[tokio::test]
    async fn unauthorized_responses_invalidate_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/private"))
            .and(header("authorization", "Bearer at"))
            .and(header("client-token", "ct"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let mut session = session(&server);
        session.set_access_token(AccessToken {
            token: "at".to_owned(),
            client_id: "cid".to_owned(),
            expires_at: SystemTime::now() + Duration::from_secs(3600),
            is_anonymous: false,
        });
        session.set_device_id("dev");
        session.client_version = Some("1.2.3".to_owned());
        session.client_token = Some(ClientToken {
            token: "ct".to_owned(),
        });

        let url = Url::parse(&server.uri()).unwrap().join("private").unwrap();
        let request = session.http().get(url, "");
        let err = session
            .send_authorized(request, ErrorKind::Player)
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Session);
        assert_eq!(session.token_state(), TokenState::Unset);
    }
}
