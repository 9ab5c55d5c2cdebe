//! Shared two-phase captcha vendor protocol.
//!
//! Vendors expose `createTask`, `getTaskResult` and `getBalance`, each taking
//! a JSON body with the account `clientKey` and answering with an envelope
//! whose `errorId` is zero on success.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, PickFirst};
use veil::Redact;

/// Any request body, carrying the vendor account key.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Authenticated<'a, T> {
    pub client_key: &'a str,

    #[serde(flatten)]
    pub body: T,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CreateTask<'a> {
    pub task: Task<'a>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task<'a> {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(rename = "websiteURL")]
    pub website_url: &'a str,

    pub website_key: &'a str,

    pub page_action: &'a str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_invisible: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<&'a str>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTaskResult<'a> {
    pub task_id: &'a TaskId,
}

/// Empty body for `getBalance`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct GetBalance {}

/// Task identifier, numeric or textual depending on the vendor.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TaskId {
    Number(u64),
    Text(String),
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Response envelope shared by every vendor call.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    #[serde(default)]
    pub error_id: i64,

    #[serde(default)]
    pub error_code: Option<String>,

    #[serde(default)]
    pub error_description: Option<String>,

    #[serde(default)]
    pub task_id: Option<TaskId>,

    #[serde(default)]
    pub status: Option<String>,

    #[serde(default)]
    pub solution: Option<Solution>,

    #[serde(default)]
    pub balance: Option<f64>,
}

impl Response {
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status.as_deref() == Some("ready")
    }
}

#[derive(Clone, PartialEq, Eq, Deserialize, Redact)]
pub struct Solution {
    #[serde(rename = "gRecaptchaResponse")]
    #[redact(partial)]
    pub g_recaptcha_response: String,
}
