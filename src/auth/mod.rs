//! Authentication flows against the accounts front end.
//!
//! Every flow has the same shape:
//!
//! 1. fetch the flow's page and scan its markup for tokens
//! 2. solve a reCAPTCHA for the page
//! 3. submit the form or JSON payload
//! 4. interpret the answer, running an interactive challenge if asked to
//!
//! # Submodules
//!
//! * [`login`] - Password login and session persistence
//! * [`challenge`] - Interactive reCAPTCHA v2 challenges
//! * [`signup`] - Account creation
//! * [`password`] - Password recovery
//!
//! # Persistence
//!
//! An authenticated login can be dumped to a [`SessionDump`] holding the
//! identifier, password and cookie jar. Restoring a dump is the only way to
//! resume a session without authenticating again. Backends implement
//! [`SessionStore`]; [`JsonFileStore`] keeps dumps in a local JSON file.

pub mod challenge;
pub mod login;
pub mod password;
pub mod signup;

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use veil::Redact;

use crate::{
    error::{Error, Result},
    util,
};

/// reCAPTCHA v3 site key of the login, signup and password reset pages.
pub const SITE_KEY_V3: &str = "6LfCVLAUAAAAALFwwRnnCJ12DalriUGbj8FW_J39";

/// reCAPTCHA v2 site key of the challenge service.
pub const SITE_KEY_V2: &str = "6LeO36obAAAAALSBZrY6RYM1hcAY7RLvpDDcJLy3";

/// Cookie holding the accounts CSRF token.
const CSRF_COOKIE: &str = "sp_sso_csrf_token";

/// Header echoing the CSRF token.
const CSRF_HEADER: &str = "x-csrf-token";

/// Persisted state of an authenticated session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Redact)]
pub struct SessionDump {
    pub identifier: String,

    #[redact]
    #[serde(default)]
    pub password: String,

    #[redact]
    pub cookies: Cookies,
}

/// Cookie jar contents, either as a map or as a `Cookie` header string.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cookies {
    Map(BTreeMap<String, String>),
    Header(String),
}

impl Cookies {
    /// Returns the cookies as a name to value map.
    ///
    /// Header strings are split on `;` and then on the first `=`, after
    /// removing all spaces. Pairs without `=` are skipped.
    #[must_use]
    pub fn into_map(self) -> BTreeMap<String, String> {
        match self {
            Self::Map(map) => map,
            Self::Header(header) => header
                .replace(' ', "")
                .split(';')
                .filter_map(|pair| pair.split_once('='))
                .map(|(name, value)| (name.to_owned(), value.to_owned()))
                .collect(),
        }
    }
}

/// Backend persisting session dumps by identifier.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Stores `dump`, replacing any dump with the same identifier.
    ///
    /// # Errors
    ///
    /// Returns error if the dump cannot be persisted.
    async fn save(&self, dump: &SessionDump) -> Result<()>;

    /// Loads the dump stored for `identifier`.
    ///
    /// # Errors
    ///
    /// Returns error if no dump is stored for `identifier` or it cannot be
    /// read.
    async fn load(&self, identifier: &str) -> Result<SessionDump>;
}

/// Session store keeping every dump in one JSON file.
///
/// The file holds an array of dumps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    #[must_use]
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn read_all(&self) -> Result<Vec<SessionDump>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&contents).map_err(Into::into)
    }
}

#[async_trait]
impl SessionStore for JsonFileStore {
    async fn save(&self, dump: &SessionDump) -> Result<()> {
        let mut dumps = self.read_all()?;
        dumps.retain(|existing| existing.identifier != dump.identifier);
        dumps.push(dump.clone());

        fs::write(&self.path, serde_json::to_vec_pretty(&dumps)?)?;
        debug!("saved session of {} to {}", dump.identifier, self.path.display());
        Ok(())
    }

    async fn load(&self, identifier: &str) -> Result<SessionDump> {
        self.read_all()?
            .into_iter()
            .find(|dump| dump.identifier == identifier)
            .ok_or_else(|| {
                Error::invalid_argument(format!(
                    "no session stored for {identifier} in {}",
                    self.path.display()
                ))
            })
    }
}

/// Reads a marker from page markup, failing the flow when it is absent.
fn required_marker(markup: &str, key: &str, err: fn(String) -> Error) -> Result<String> {
    util::find_marker(markup, key)
        .map(ToOwned::to_owned)
        .ok_or_else(|| err(format!("{key} missing from page")))
}

/// Returns the CSRF token set by `response`, if any.
fn csrf_cookie(response: &reqwest::Response) -> Option<String> {
    response
        .cookies()
        .find(|cookie| cookie.name() == CSRF_COOKIE)
        .map(|cookie| cookie.value().to_owned())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::captcha::{CaptchaSolver, ChallengeKind};

    /// Solver recording every request and answering with a fixed token.
    #[derive(Default)]
    pub struct RecordingSolver {
        pub calls: Mutex<Vec<(String, String, String, ChallengeKind)>>,
    }

    #[async_trait]
    impl CaptchaSolver for RecordingSolver {
        async fn solve_captcha(
            &self,
            url: &str,
            site_key: &str,
            action: &str,
            kind: ChallengeKind,
        ) -> Result<String> {
            self.calls.lock().unwrap().push((
                url.to_owned(),
                site_key.to_owned(),
                action.to_owned(),
                kind,
            ));
            Ok(format!("token-{kind}"))
        }
    }

    pub fn recording_solver() -> Arc<RecordingSolver> {
        Arc::new(RecordingSolver::default())
    }

    #[test]
    fn header_cookies_are_split_on_first_equals() {
        let cookies = Cookies::Header("sp_dc=abc; sp_key=a=b;broken; sp_t = x".to_owned());
        let map = cookies.into_map();

        assert_eq!(map.len(), 3);
        assert_eq!(map["sp_dc"], "abc");
        assert_eq!(map["sp_key"], "a=b");
        assert_eq!(map["sp_t"], "x");
    }

    #[test]
    fn dumps_accept_both_cookie_forms() {
        let dump: SessionDump = serde_json::from_str(
            r#"{"identifier":"someone","password":"pw","cookies":{"sp_dc":"abc"}}"#,
        )
        .unwrap();
        assert_eq!(dump.cookies.into_map()["sp_dc"], "abc");

        let dump: SessionDump =
            serde_json::from_str(r#"{"identifier":"someone","cookies":"sp_dc=abc"}"#).unwrap();
        assert!(dump.password.is_empty());
        assert_eq!(dump.cookies.into_map()["sp_dc"], "abc");
    }

    #[test]
    fn dump_debug_hides_secrets() {
        let dump = SessionDump {
            identifier: "someone".to_owned(),
            password: "hunter2".to_owned(),
            cookies: Cookies::Header("sp_dc=secretcookie".to_owned()),
        };
        let debug = format!("{dump:?}");
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("secretcookie"));
    }

    #[tokio::test]
    async fn file_store_replaces_by_identifier() {
        let path = std::env::temp_dir().join(format!("spotweb-store-{}.json", std::process::id()));
        let store = JsonFileStore::new(&path);

        let mut dump = SessionDump {
            identifier: "someone".to_owned(),
            password: "old".to_owned(),
            cookies: Cookies::Map(BTreeMap::new()),
        };
        store.save(&dump).await.unwrap();
        dump.password = "new".to_owned();
        store.save(&dump).await.unwrap();

        let loaded = store.load("someone").await.unwrap();
        let missing = store.load("nobody").await.unwrap_err();
        fs::remove_file(&path).unwrap();

        assert_eq!(loaded.password, "new");
        assert_eq!(missing.kind, crate::error::ErrorKind::InvalidArgument);
    }
}
