//! HMAC-SHA256 request signing.
//!
//! A request is signed over the canonical string
//! `METHOD:PATH:TIMESTAMP:BODY`, where the method is upper-cased, the path is
//! taken verbatim (leading slash, no query string), the timestamp is decimal
//! Unix seconds and the body is the raw UTF-8 request body (empty when there
//! is none). The signature is the lowercase hex HMAC of that string.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-api-signature";
pub const TIMESTAMP_HEADER: &str = "x-api-timestamp";

/// Accepted clock skew between signer and verifier, in seconds.
pub const DEFAULT_WINDOW_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing headers")]
    MissingHeaders,

    #[error("bad timestamp")]
    BadTimestamp,

    #[error("expired")]
    Expired,

    #[error("bad signature")]
    BadSignature,

    #[error("replayed")]
    Replayed,
}

/// What a signature is computed over.
#[derive(Debug, Clone, Copy)]
pub struct SignatureContext<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub timestamp: i64,
    pub body: &'a str,
}

impl SignatureContext<'_> {
    pub fn canonical_string(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.method.to_uppercase(),
            self.path,
            self.timestamp,
            self.body
        )
    }
}

/// Authentication headers as received, before any parsing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureHeaders<'a> {
    pub signature: Option<&'a [u8]>,
    pub timestamp: Option<&'a str>,
}

/// Remembers signatures already accepted inside the window.
pub trait ReplayGuard: Send + Sync {
    /// Returns `false` if `signature` was already seen and is still inside
    /// the window; otherwise records it and returns `true`.
    fn check_and_record(&self, signature: &str, timestamp: i64, now: i64) -> bool;
}

/// In-process seen-set. Only effective with a single API instance.
pub struct SeenSignatures {
    window_secs: u64,
    seen: Mutex<HashMap<String, i64>>,
}

impl SeenSignatures {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window_secs,
            seen: Mutex::new(HashMap::new()),
        }
    }
}

impl ReplayGuard for SeenSignatures {
    fn check_and_record(&self, signature: &str, timestamp: i64, now: i64) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let window = self.window_secs;
        seen.retain(|_, ts| now.abs_diff(*ts) <= window);

        if seen.contains_key(signature) {
            return false;
        }
        seen.insert(signature.to_string(), timestamp);
        true
    }
}

pub struct RequestAuthenticator {
    secret: Vec<u8>,
    window_secs: u64,
    exempt_paths: HashSet<String>,
    replay_guard: Option<Arc<dyn ReplayGuard>>,
}

impl RequestAuthenticator {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            window_secs: DEFAULT_WINDOW_SECS,
            exempt_paths: HashSet::new(),
            replay_guard: None,
        }
    }

    pub fn with_window(mut self, window_secs: u64) -> Self {
        self.window_secs = window_secs;
        self
    }

    pub fn with_exempt_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exempt_paths.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn with_replay_guard(mut self, guard: Arc<dyn ReplayGuard>) -> Self {
        self.replay_guard = Some(guard);
        self
    }

    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.contains(path)
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length, including empty ones.
        match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC-SHA256 accepts keys of any length"),
        }
    }

    /// Lowercase hex HMAC-SHA256 of the canonical string.
    pub fn sign(&self, ctx: &SignatureContext<'_>) -> String {
        let mut mac = self.mac();
        mac.update(ctx.canonical_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Signs with the current time, returning `(signature, timestamp)`.
    pub fn sign_now(&self, method: &str, path: &str, body: &str) -> (String, i64) {
        let timestamp = chrono::Utc::now().timestamp();
        let signature = self.sign(&SignatureContext {
            method,
            path,
            timestamp,
            body,
        });
        (signature, timestamp)
    }

    /// Constant-time comparison of a provided signature against the expected one.
    pub fn signature_matches(&self, provided: &[u8], ctx: &SignatureContext<'_>) -> bool {
        let expected = self.sign(ctx);
        expected.as_bytes().ct_eq(provided).into()
    }

    pub fn verify(
        &self,
        method: &str,
        path: &str,
        headers: SignatureHeaders<'_>,
        body: &str,
    ) -> Result<(), AuthError> {
        self.verify_at(method, path, headers, body, chrono::Utc::now().timestamp())
    }

    /// Verification against an explicit server clock.
    pub fn verify_at(
        &self,
        method: &str,
        path: &str,
        headers: SignatureHeaders<'_>,
        body: &str,
        now: i64,
    ) -> Result<(), AuthError> {
        if self.is_exempt(path) {
            return Ok(());
        }

        let (Some(signature), Some(timestamp)) = (headers.signature, headers.timestamp) else {
            return Err(AuthError::MissingHeaders);
        };

        let timestamp: i64 = timestamp.parse().map_err(|_| AuthError::BadTimestamp)?;

        if now.abs_diff(timestamp) > self.window_secs {
            return Err(AuthError::Expired);
        }

        let ctx = SignatureContext {
            method,
            path,
            timestamp,
            body,
        };
        if !self.signature_matches(signature, &ctx) {
            return Err(AuthError::BadSignature);
        }

        if let Some(guard) = &self.replay_guard {
            let signature = String::from_utf8_lossy(signature);
            if !guard.check_and_record(&signature, timestamp, now) {
                return Err(AuthError::Replayed);
            }
        }

        Ok(())
    }
}
