//! Time-based proofs for the web player token endpoint.
//!
//! The token endpoint only hands out access tokens to callers that present a
//! TOTP code derived from a rotating secret. Secrets are published as a
//! versioned map and fetched through a [`SecretSource`]; a [`SecretCache`]
//! keeps the newest one for a bounded window. One cache is meant to be
//! shared by every session of a process, see [`ProofGenerator::with_cache`].
//!
//! Fetching secrets never fails from the caller's point of view: when the
//! source is unreachable or returns garbage, an embedded secret is used.
//!
//! # Example
//!
//! ```rust
//! use spotweb::proof::{HttpSecretSource, ProofGenerator};
//!
//! let generator = ProofGenerator::new(HttpSecretSource::new(http, url));
//! let proof = generator.generate_proof().await?;
//! println!("totp={} totpVer={}", proof.code, proof.version);
//! ```

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use tokio::sync::Mutex;
use url::Url;
use veil::Redact;

use crate::{
    error::{Error, ErrorKind, Result},
    http, protocol,
};

/// Version of the embedded fallback secret.
const FALLBACK_VERSION: &str = "61";

/// Embedded fallback secret, used when no secret can be fetched.
const FALLBACK_SECRET: [u8; 26] = [
    44, 55, 47, 42, 70, 40, 34, 114, 76, 74, 50, 111, 120, 97, 75, 76, 94, 102, 43, 69, 49, 120,
    118, 80, 64, 78,
];

/// Length of one TOTP time step.
const TIME_STEP: u64 = 30;

/// Number of digits in a proof.
const DIGITS: u32 = 6;

/// A versioned proof secret.
#[derive(Clone, PartialEq, Eq, Redact)]
pub struct Secret {
    pub version: String,

    #[redact]
    pub bytes: Vec<u8>,
}

impl Secret {
    #[must_use]
    pub fn fallback() -> Self {
        Self {
            version: FALLBACK_VERSION.to_owned(),
            bytes: FALLBACK_SECRET.to_vec(),
        }
    }
}

/// A one-time proof and the version of the secret it was derived from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Proof {
    pub code: String,
    pub version: String,
}

/// Provider of the newest proof secret.
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Fetches the newest secret.
    ///
    /// # Errors
    ///
    /// Returns error if the secret cannot be fetched or parsed.
    async fn fetch(&self) -> Result<Secret>;
}

/// Fetches secrets from a JSON map `{version: [byte, ...]}` over HTTP.
pub struct HttpSecretSource {
    http: Arc<http::Client>,
    url: Url,
}

impl HttpSecretSource {
    #[must_use]
    pub fn new(http: Arc<http::Client>, url: Url) -> Self {
        Self { http, url }
    }
}

#[async_trait]
impl SecretSource for HttpSecretSource {
    async fn fetch(&self) -> Result<Secret> {
        let request = self.http.get(self.url.clone(), "");
        let body = self.http.text(request, ErrorKind::Validation).await?;

        let secrets: HashMap<String, Vec<u8>> = protocol::json(&body, "secrets")?;
        newest(secrets).ok_or_else(|| Error::validation("no versioned secret published"))
    }
}

/// Picks the entry with the highest numeric version.
fn newest(secrets: HashMap<String, Vec<u8>>) -> Option<Secret> {
    secrets
        .into_iter()
        .filter(|(_, bytes)| !bytes.is_empty())
        .filter_map(|(version, bytes)| {
            let number = version.parse::<u64>().ok()?;
            Some((number, Secret { version, bytes }))
        })
        .max_by_key(|(number, _)| *number)
        .map(|(_, secret)| secret)
}

/// Caches the newest secret for a bounded window.
pub struct SecretCache {
    source: Box<dyn SecretSource>,
    ttl: Duration,
    cached: Mutex<Option<(Secret, SystemTime)>>,
}

impl SecretCache {
    /// How long a fetched secret is reused.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);

    #[must_use]
    pub fn new<S>(source: S) -> Self
    where
        S: SecretSource + 'static,
    {
        Self::with_ttl(source, Self::DEFAULT_TTL)
    }

    #[must_use]
    pub fn with_ttl<S>(source: S, ttl: Duration) -> Self
    where
        S: SecretSource + 'static,
    {
        Self {
            source: Box::new(source),
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// Returns the cached secret, refreshing it when expired at `now`.
    ///
    /// Concurrent callers wait for a single refresh and observe the same
    /// secret. A failed refresh yields the embedded fallback secret, which is
    /// not cached, so the next call tries again.
    pub async fn get_or_refresh(&self, now: SystemTime) -> Secret {
        let mut cached = self.cached.lock().await;
        if let Some((secret, expires_at)) = cached.as_ref() {
            if now < *expires_at {
                return secret.clone();
            }
        }

        match self.source.fetch().await {
            Ok(secret) => {
                debug!("using proof secret version {}", secret.version);
                *cached = Some((secret.clone(), now + self.ttl));
                secret
            }
            Err(e) => {
                warn!("falling back to embedded proof secret: {e}");
                Secret::fallback()
            }
        }
    }
}

/// Generates proofs from cached secrets.
#[derive(Clone)]
pub struct ProofGenerator {
    cache: Arc<SecretCache>,
}

impl ProofGenerator {
    #[must_use]
    pub fn new<S>(source: S) -> Self
    where
        S: SecretSource + 'static,
    {
        Self::with_cache(Arc::new(SecretCache::new(source)))
    }

    /// Creates a generator drawing secrets from a shared `cache`.
    #[must_use]
    pub fn with_cache(cache: Arc<SecretCache>) -> Self {
        Self { cache }
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<SecretCache> {
        &self.cache
    }

    /// Generates a proof for the current time.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Internal`] if the HMAC cannot be keyed.
    pub async fn generate_proof(&self) -> Result<Proof> {
        self.generate_proof_at(SystemTime::now()).await
    }

    /// Generates a proof for `now`.
    ///
    /// # Errors
    ///
    /// As [`generate_proof`](Self::generate_proof).
    pub async fn generate_proof_at(&self, now: SystemTime) -> Result<Proof> {
        let secret = self.cache.get_or_refresh(now).await;
        let unix_secs = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();

        Ok(Proof {
            code: totp(&derive_key(&secret.bytes), unix_secs, DIGITS)?,
            version: secret.version,
        })
    }
}

/// Derives the HMAC key from published secret bytes.
///
/// Each byte is XORed with `(index % 33) + 9`; the decimal forms are
/// concatenated and the ASCII bytes of the result are the key.
#[must_use]
pub fn derive_key(secret: &[u8]) -> Vec<u8> {
    secret
        .iter()
        .enumerate()
        .map(|(i, byte)| {
            // `(i % 33) + 9` is at most 41.
            #[expect(clippy::cast_possible_truncation)]
            let mask = ((i % 33) + 9) as u8;
            (byte ^ mask).to_string()
        })
        .collect::<String>()
        .into_bytes()
}

/// RFC 6238 TOTP with HMAC-SHA1 and a 30 second step.
///
/// # Errors
///
/// Returns [`ErrorKind::Internal`] if the HMAC rejects `key`.
pub fn totp(key: &[u8], unix_secs: u64, digits: u32) -> Result<String> {
    let counter = unix_secs / TIME_STEP;

    let mut mac = Hmac::<Sha1>::new_from_slice(key).map_err(|e| Error::internal(e.to_string()))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = usize::from(digest[digest.len() - 1] & 0x0f);
    let binary = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);

    let code = binary % 10_u32.pow(digits);
    Ok(format!("{code:0width$}", width = digits as usize))
}
