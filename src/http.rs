//! HTTP client with pacing, retries and a persistable cookie jar.
//!
//! This module provides a wrapper around `reqwest::Client` that adds:
//! * Request pacing so bursts of bootstrap calls stay polite
//! * A fixed number of transparent retries for requests that fail in transit
//! * A cookie jar that can be dumped and restored by an external store
//! * Consistent timeouts and browser-like headers
//!
//! # Retries
//!
//! Only transport failures are retried; any response the remote side
//! produced, including error statuses, is returned to the caller. There is
//! no backoff between attempts. When all attempts fail the last transport
//! error surfaces as [`ErrorKind::Transport`].
//!
//! # Example
//!
//! ```rust
//! use spotweb::http::Client;
//!
//! let client = Client::new(&config)?;
//! let request = client.get(url, "");
//! let response = client.execute(request).await?;
//! ```

use std::{collections::BTreeMap, num::NonZeroU32, sync::Arc, time::Duration};

use cookie_store::{CookieStore, RawCookie};
use governor::{DefaultDirectRateLimiter, Quota};
use reqwest::{
    header::{HeaderValue, ACCEPT_LANGUAGE, CONTENT_TYPE},
    Body, Method, StatusCode, Url,
};
use reqwest_cookie_store::CookieStoreMutex;
use serde::Serialize;

use crate::{
    config::Config,
    error::{Error, ErrorKind, Result},
};

/// HTTP client with built-in pacing, retries and cookie support.
pub struct Client {
    /// Unpaced request client for special cases.
    pub unlimited: reqwest::Client,

    /// Pacing for outgoing requests.
    rate_limiter: DefaultDirectRateLimiter,

    /// Cookie storage shared with `unlimited`.
    cookie_jar: Arc<CookieStoreMutex>,

    /// Number of additional attempts after a failed first attempt.
    retries: u32,
}

impl Client {
    /// Interval of the pacing window.
    const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(5);

    /// Maximum number of requests per pacing window.
    const RATE_LIMIT_CALLS_PER_INTERVAL: u8 = 50;

    /// Duration to keep idle connections alive.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Duration to wait for individual network reads.
    ///
    /// Bundle downloads are several megabytes, but each read is small.
    const READ_TIMEOUT: Duration = Duration::from_secs(10);

    /// Duration to wait for a connection to be established.
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates a new client with an empty cookie jar.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_cookie_store(config, CookieStore::default())
    }

    /// Creates a new client on top of an existing cookie store.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    ///
    /// # Panics
    ///
    /// Panics if rate limit parameters are zero.
    pub fn with_cookie_store(config: &Config, store: CookieStore) -> Result<Self> {
        // Not having `Accept-Language` set is non-fatal.
        let mut headers = reqwest::header::HeaderMap::new();
        if let Ok(lang) = HeaderValue::from_str(&config.app_lang) {
            headers.insert(ACCEPT_LANGUAGE, lang);
        }

        let cookie_jar = Arc::new(CookieStoreMutex::new(store));

        let http_client = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .read_timeout(Self::READ_TIMEOUT)
            .connect_timeout(Self::CONNECT_TIMEOUT)
            .default_headers(headers)
            .user_agent(&config.user_agent)
            .cookie_provider(Arc::clone(&cookie_jar));

        let replenish_interval =
            Self::RATE_LIMIT_INTERVAL / u32::from(Self::RATE_LIMIT_CALLS_PER_INTERVAL);
        let quota = Quota::with_period(replenish_interval)
            .expect("quota time interval is zero")
            .allow_burst(
                NonZeroU32::new(Self::RATE_LIMIT_CALLS_PER_INTERVAL.into())
                    .expect("calls per interval is zero"),
            );

        Ok(Self {
            unlimited: http_client.build()?,
            rate_limiter: governor::RateLimiter::direct(quota),
            cookie_jar,
            retries: config.http_retries,
        })
    }

    /// Builds a request with specified method, URL and body.
    pub fn request<U, T>(&self, method: Method, url: U, body: T) -> reqwest::Request
    where
        U: Into<Url>,
        T: Into<Body>,
    {
        let mut request = reqwest::Request::new(method, url.into());
        let body_mut = request.body_mut();
        *body_mut = Some(body.into());

        request
    }

    /// Builds a GET request.
    pub fn get<U, T>(&self, url: U, body: T) -> reqwest::Request
    where
        U: Into<Url>,
        T: Into<Body>,
    {
        self.request(Method::GET, url, body)
    }

    /// Builds a POST request.
    pub fn post<U, T>(&self, url: U, body: T) -> reqwest::Request
    where
        U: Into<Url>,
        T: Into<Body>,
    {
        self.request(Method::POST, url, body)
    }

    /// Builds a request carrying a JSON body.
    ///
    /// # Errors
    ///
    /// Returns error if `body` cannot be serialized.
    pub fn json<U, T>(&self, method: Method, url: U, body: &T) -> Result<reqwest::Request>
    where
        U: Into<Url>,
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(body)?;
        let mut request = self.request(method, url, body);
        request
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(request)
    }

    /// Builds a POST request carrying an `application/x-www-form-urlencoded`
    /// body.
    pub fn form<U, K, V>(&self, url: U, fields: &[(K, V)]) -> reqwest::Request
    where
        U: Into<Url>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields.iter().map(|(k, v)| (k.as_ref(), v.as_ref())))
            .finish();
        let mut request = self.post(url, body);
        request.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        request
    }

    /// Executes a request with pacing and transparent retries.
    ///
    /// Each attempt waits for the rate limiter. Requests whose body cannot
    /// be cloned are attempted once.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Transport`] when every attempt failed in transit.
    pub async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        let method = request.method().clone();
        let url = request.url().clone();

        let mut pending = Some(request);
        let mut attempt = 0;
        loop {
            let Some(current) = pending.take() else {
                return Err(Error::internal("request consumed without a response"));
            };

            if attempt < self.retries {
                pending = current.try_clone();
            }

            self.rate_limiter.until_ready().await;
            match self.unlimited.execute(current).await {
                Ok(response) => {
                    trace!("{method} {url}: {}", response.status());
                    return Ok(response);
                }
                Err(e) => {
                    attempt += 1;
                    if pending.is_none() {
                        return Err(Error::transport(format!(
                            "{method} {url} kept failing after {attempt} attempt(s): {e}"
                        )));
                    }
                    debug!("{method} {url}: attempt {attempt} failed: {e}");
                }
            }
        }
    }

    /// Executes a request and requires a successful status.
    ///
    /// Non-success statuses are classified as `kind`, with the response body
    /// attached as the upstream error.
    ///
    /// # Errors
    ///
    /// Returns error if the request fails in transit or the status is not a
    /// success.
    pub async fn execute_ok(
        &self,
        request: reqwest::Request,
        kind: ErrorKind,
    ) -> Result<reqwest::Response> {
        let url = request.url().clone();
        let response = self.execute(request).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(Self::status_error(kind, &url, status).with_upstream(body))
    }

    /// Executes a request and returns its body as text.
    ///
    /// # Errors
    ///
    /// Returns error under the same conditions as [`execute_ok`](Self::execute_ok),
    /// or when the body cannot be read.
    pub async fn text(&self, request: reqwest::Request, kind: ErrorKind) -> Result<String> {
        let response = self.execute_ok(request, kind).await?;
        response
            .text()
            .await
            .map_err(|e| Error::new(kind, e.to_string()))
    }

    fn status_error(kind: ErrorKind, url: &Url, status: StatusCode) -> Error {
        let path = url.path();
        Error::new(kind, format!("{path} returned {status}"))
    }

    /// Returns the value of the first unexpired cookie named `name`.
    ///
    /// # Errors
    ///
    /// Returns error if the cookie jar lock is poisoned.
    pub fn cookie(&self, name: &str) -> Result<Option<String>> {
        let store = self.cookie_jar.lock()?;
        let value = store
            .iter_unexpired()
            .find(|cookie| cookie.name() == name)
            .map(|cookie| cookie.value().to_owned());
        Ok(value)
    }

    /// Stores a host-only cookie for the host of `url`, path `/`.
    ///
    /// # Errors
    ///
    /// Returns error if the cookie is rejected or the lock is poisoned.
    pub fn set_cookie(&self, name: &str, value: &str, url: &Url) -> Result<()> {
        let mut cookie = RawCookie::new(name.to_owned(), value.to_owned());
        cookie.set_path("/");

        let mut store = self.cookie_jar.lock()?;
        store.insert_raw(&cookie, url)?;
        Ok(())
    }

    /// Removes every cookie from the jar.
    ///
    /// # Errors
    ///
    /// Returns error if the lock is poisoned.
    pub fn clear_cookies(&self) -> Result<()> {
        self.cookie_jar.lock()?.clear();
        Ok(())
    }

    /// Returns all unexpired cookies as a name to value map.
    ///
    /// Later cookies with the same name overwrite earlier ones.
    ///
    /// # Errors
    ///
    /// Returns error if the lock is poisoned.
    pub fn dump_cookies(&self) -> Result<BTreeMap<String, String>> {
        let store = self.cookie_jar.lock()?;
        let cookies = store
            .iter_unexpired()
            .map(|cookie| (cookie.name().to_owned(), cookie.value().to_owned()))
            .collect();
        Ok(cookies)
    }
}
