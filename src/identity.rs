//! Read-only introspection of the stored credential token.
//!
//! The token is never verified here; the user id only labels telemetry.

use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use log::{debug, warn};
use serde_json::Value;

pub const GUEST_USER: &str = "guest_user";
pub const UNKNOWN_USER: &str = "unknown_user";

/// Claim names searched, in order, for a user identifier.
pub const USER_ID_CLAIMS: [&str; 5] = ["userId", "user_id", "id", "_id", "sub"];

const SCHEME_PREFIXES: [&str; 2] = ["Bearer ", "bearer "];

/// Supplies the locally stored credential token, if any.
pub trait CredentialProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// Fixed token, mostly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials(pub Option<String>);

impl CredentialProvider for StaticCredentials {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Token stored in a single file under the data directory.
#[derive(Debug, Clone)]
pub struct FileCredentials {
    path: PathBuf,
}

impl FileCredentials {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialProvider for FileCredentials {
    fn token(&self) -> Option<String> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Some(contents.trim().to_string()),
            Err(err) => {
                debug!("No credential at {}: {err}", self.path.display());
                None
            }
        }
    }
}

/// Token taken from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    var: String,
}

impl EnvCredentials {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl CredentialProvider for EnvCredentials {
    fn token(&self) -> Option<String> {
        std::env::var(&self.var).ok()
    }
}

/// First provider with a non-empty token wins.
#[derive(Default)]
pub struct CredentialChain {
    providers: Vec<Box<dyn CredentialProvider>>,
}

impl CredentialChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: impl CredentialProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }
}

impl CredentialProvider for CredentialChain {
    fn token(&self) -> Option<String> {
        self.providers
            .iter()
            .filter_map(|provider| provider.token())
            .find(|token| !token.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    User(String),
    /// No token stored.
    Guest,
    /// Token decoded but carried none of the recognised claims.
    Unknown,
    /// Token present but undecodable; treated as a guest.
    Invalid(String),
}

impl Identity {
    pub fn user_id(&self) -> &str {
        match self {
            Identity::User(id) => id,
            Identity::Guest | Identity::Invalid(_) => GUEST_USER,
            Identity::Unknown => UNKNOWN_USER,
        }
    }
}

#[derive(Clone)]
pub struct IdentityResolver {
    provider: Arc<dyn CredentialProvider>,
}

impl IdentityResolver {
    pub fn new(provider: Arc<dyn CredentialProvider>) -> Self {
        Self { provider }
    }

    /// Never fails; every decode problem degrades to a sentinel identity.
    pub fn resolve(&self) -> Identity {
        let Some(token) = self.provider.token() else {
            return Identity::Guest;
        };
        if token.trim().is_empty() {
            return Identity::Guest;
        }

        match decode_claims(&token) {
            Ok(claims) => match find_user_id(&claims) {
                Some(id) => Identity::User(id),
                None => Identity::Unknown,
            },
            Err(err) => {
                warn!("Ignoring unreadable credential token: {err:#}");
                Identity::Invalid(err.to_string())
            }
        }
    }
}

fn strip_scheme(token: &str) -> &str {
    let token = token.trim();
    SCHEME_PREFIXES
        .iter()
        .find_map(|prefix| token.strip_prefix(prefix))
        .unwrap_or(token)
        .trim()
}

/// Decode the payload segment of a `header.payload.signature` token.
pub fn decode_claims(token: &str) -> Result<Value> {
    let token = strip_scheme(token);
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        bail!("expected 3 token segments, found {}", segments.len());
    }

    let payload = URL_SAFE_NO_PAD
        .decode(segments[1].trim_end_matches('='))
        .context("token payload is not base64url")?;
    let claims: Value =
        serde_json::from_slice(&payload).context("token payload is not JSON")?;
    if !claims.is_object() {
        return Err(anyhow!("token payload is not a JSON object"));
    }
    Ok(claims)
}

fn claim_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn find_user_id(claims: &Value) -> Option<String> {
    let top_level = USER_ID_CLAIMS
        .iter()
        .find_map(|name| claims.get(name).and_then(claim_as_id));
    if top_level.is_some() {
        return top_level;
    }

    // Express auth handlers commonly sign `{ user: { id } }`.
    let nested = claims.get("user")?;
    USER_ID_CLAIMS
        .iter()
        .find_map(|name| nested.get(name).and_then(claim_as_id))
}
