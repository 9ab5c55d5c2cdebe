//! Captcha solving.
//!
//! Authentication flows need reCAPTCHA Enterprise tokens. They obtain them
//! through the [`CaptchaSolver`] trait, so any backend can be plugged in.
//! [`TaskSolver`] implements the two-phase task protocol shared by the
//! supported vendors:
//!
//! 1. `createTask` describes the page and returns a task id
//! 2. `getTaskResult` is polled until the task is `ready`
//!
//! Polling is bounded: after `max_polls` unanswered polls the solve fails
//! with [`ErrorKind::CaptchaTimeout`], for which creating a fresh task may
//! help. A vendor error code fails with [`ErrorKind::CaptchaTask`].
//!
//! # Example
//!
//! ```rust
//! use spotweb::captcha::{CaptchaSolver, ChallengeKind, TaskSolver, Vendor};
//!
//! let solver = TaskSolver::new(http, Vendor::CapSolver, api_key)?
//!     .with_max_polls(60);
//! let token = solver
//!     .solve_captcha(url, site_key, "accounts/login", ChallengeKind::V3)
//!     .await?;
//! ```
//!
//! [`ErrorKind::CaptchaTimeout`]: crate::error::ErrorKind::CaptchaTimeout
//! [`ErrorKind::CaptchaTask`]: crate::error::ErrorKind::CaptchaTask

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::Method;
use serde::Serialize;
use url::Url;

use crate::{
    error::{Error, ErrorKind, Result},
    http,
    protocol::{
        self,
        captcha::{Authenticated, CreateTask, GetBalance, GetTaskResult, Response, Task, TaskId},
    },
};

/// reCAPTCHA flavour requested by a flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChallengeKind {
    /// Checkbox challenge, used by interactive challenges.
    V2,

    /// Score-based, used by the login, signup and reset pages.
    V3,
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V2 => write!(f, "V2"),
            Self::V3 => write!(f, "V3"),
        }
    }
}

/// Anything that can turn a captcha description into a solution token.
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    /// Solves the captcha at `url` protected by `site_key`.
    ///
    /// # Errors
    ///
    /// Returns error if no solution can be obtained.
    async fn solve_captcha(
        &self,
        url: &str,
        site_key: &str,
        action: &str,
        kind: ChallengeKind,
    ) -> Result<String>;
}

/// Supported captcha vendors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Vendor {
    CapMonster,
    CapSolver,
}

impl Vendor {
    /// Production API origin of the vendor.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Internal`] if the origin does not parse.
    pub fn base_url(self) -> Result<Url> {
        let url = match self {
            Self::CapMonster => "https://api.capmonster.cloud/",
            Self::CapSolver => "https://api.capsolver.com/",
        };
        Url::parse(url).map_err(Error::internal)
    }

    /// Extracts the vendor-specific error string from a response.
    fn upstream_error(self, response: &Response) -> String {
        let error = match self {
            Self::CapMonster => response.error_code.as_deref(),
            Self::CapSolver => response.error_description.as_deref(),
        };
        error.unwrap_or("unknown error").to_owned()
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapMonster => write!(f, "CapMonster"),
            Self::CapSolver => write!(f, "CapSolver"),
        }
    }
}

/// Solver for vendors speaking the shared task protocol.
pub struct TaskSolver {
    http: Arc<http::Client>,
    vendor: Vendor,
    api_key: String,
    base_url: Url,
    proxy: Option<String>,

    max_polls: u32,
    poll_interval: Duration,
}

impl fmt::Debug for TaskSolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSolver")
            .field("vendor", &self.vendor)
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url.as_str())
            .field("proxy", &self.proxy.as_ref().map(|_| "<redacted>"))
            .field("max_polls", &self.max_polls)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl TaskSolver {
    /// Default number of `getTaskResult` polls before giving up.
    pub const DEFAULT_MAX_POLLS: u32 = 120;

    /// Default delay between polls.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

    /// Creates a solver for the production API of `vendor`.
    ///
    /// # Errors
    ///
    /// As [`Vendor::base_url`].
    pub fn new(http: Arc<http::Client>, vendor: Vendor, api_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http,
            vendor,
            api_key: api_key.into(),
            base_url: vendor.base_url()?,
            proxy: None,
            max_polls: Self::DEFAULT_MAX_POLLS,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        })
    }

    /// Routes solving through `proxy`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidArgument`] for CapMonster, which only
    /// supports proxyless tasks.
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Result<Self> {
        if self.vendor == Vendor::CapMonster {
            return Err(Error::invalid_argument(
                "only proxyless mode is supported with CapMonster",
            ));
        }
        self.proxy = Some(proxy.into());
        Ok(self)
    }

    #[must_use]
    pub fn with_max_polls(mut self, max_polls: u32) -> Self {
        self.max_polls = max_polls;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Talks to `base_url` instead of the vendor's production API.
    #[must_use]
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    #[must_use]
    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    /// Calls a vendor method, failing on transport errors, error statuses
    /// and non-zero `errorId`.
    async fn call<T>(&self, method: &str, body: T) -> Result<Response>
    where
        T: Serialize + Send,
    {
        let url = self.base_url.join(method)?;
        let body = Authenticated {
            client_key: &self.api_key,
            body,
        };

        let request = self.http.json(Method::POST, url, &body)?;
        let text = self.http.text(request, ErrorKind::CaptchaTask).await?;
        let response: Response = protocol::json(&text, method)?;

        if response.error_id != 0 {
            let upstream = self.vendor.upstream_error(&response);
            return Err(Error::captcha_task(format!("{} {method} failed", self.vendor))
                .with_upstream(upstream));
        }

        Ok(response)
    }

    /// Returns the account balance.
    ///
    /// # Errors
    ///
    /// Returns error if the vendor call fails or carries no balance.
    pub async fn balance(&self) -> Result<f64> {
        let response = self.call("getBalance", GetBalance {}).await?;
        response
            .balance
            .ok_or_else(|| Error::validation("balance missing from response"))
    }

    async fn create_task(
        &self,
        url: &str,
        site_key: &str,
        action: &str,
        kind: ChallengeKind,
    ) -> Result<TaskId> {
        let suffix = if self.proxy.is_some() { "" } else { "ProxyLess" };
        let is_invisible = match (self.vendor, kind) {
            (Vendor::CapSolver, ChallengeKind::V2) => Some(true),
            _ => None,
        };

        let task = Task {
            kind: format!("ReCaptcha{kind}EnterpriseTask{suffix}"),
            website_url: url,
            website_key: site_key,
            page_action: action,
            is_invisible,
            proxy: self.proxy.as_deref(),
        };

        let response = self.call("createTask", CreateTask { task }).await?;
        response
            .task_id
            .ok_or_else(|| Error::validation("task id missing from response"))
    }

    async fn poll_result(&self, task_id: &TaskId) -> Result<String> {
        for poll in 1..=self.max_polls {
            let response = self
                .call("getTaskResult", GetTaskResult { task_id })
                .await?;

            if response.is_ready() {
                let solution = response
                    .solution
                    .ok_or_else(|| Error::validation("ready task has no solution"))?;
                debug!("task {task_id} solved after {poll} poll(s)");
                return Ok(solution.g_recaptcha_response);
            }

            trace!("task {task_id} not ready after {poll} poll(s)");
            if poll < self.max_polls {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        Err(
            Error::captcha_timeout(format!("task {task_id} not solved in time"))
                .with_upstream(format!("{} polls exhausted", self.max_polls)),
        )
    }
}

#[async_trait]
impl CaptchaSolver for TaskSolver {
    async fn solve_captcha(
        &self,
        url: &str,
        site_key: &str,
        action: &str,
        kind: ChallengeKind,
    ) -> Result<String> {
        info!("solving {kind} captcha for {action} with {}", self.vendor);
        let task_id = self.create_task(url, site_key, action, kind).await?;
        self.poll_result(&task_id).await
    }
}
