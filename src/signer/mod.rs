//! Request signing for the VDC API
//!
//! Every call to the provider carries an `apiKey`, the `command` name and a
//! `signature` computed as base64(HMAC-SHA1(secret, canonical form)). SHA-1 is
//! mandated by the provider's verification scheme; it is reproduced here for
//! wire compatibility only.
//!
//! ```
//! use vdcfleet::signer::{Credential, Params, sign};
//!
//! let credential = Credential::new("https://api.example.com/api/", "key", "secret");
//! let params = Params::new().with("region", "Europe");
//! let signed = sign("listZones", &params, &credential).unwrap();
//! assert!(signed.query.ends_with(&format!("signature={}", signed.signature)));
//! ```

mod encoding;

pub use encoding::{canonical_form, encode_value};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha1::Sha1;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

type HmacSha1 = Hmac<Sha1>;

/// Signature version marker sent alongside `expires`
const SIGNATURE_VERSION: &str = "3";

/// Parameters the signer sets itself; caller values for these are replaced
const SIGNER_OWNED_KEYS: &[&str] = &[
    "apikey",
    "command",
    "response",
    "expires",
    "signatureversion",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignerError {
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("missing credential field: {0}")]
    MissingCredential(&'static str),
}

pub type Result<T> = std::result::Result<T, SignerError>;

/// API endpoint and key pair
///
/// Built once from configuration and shared read-only by the client.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    endpoint: String,
    api_key: String,
    secret_key: String,
}

impl Credential {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            secret_key: secret_key.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(SignerError::MissingCredential("endpoint"));
        }
        if self.api_key.is_empty() {
            return Err(SignerError::MissingCredential("api_key"));
        }
        if self.secret_key.is_empty() {
            return Err(SignerError::MissingCredential("secret_key"));
        }
        Ok(())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// A single request parameter value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Str(s) => f.write_str(s),
            ParamValue::Int(i) => write!(f, "{}", i),
            // Lower-case, as the API documents its boolean flags
            ParamValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Str(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Str(value)
    }
}

impl From<&String> for ParamValue {
    fn from(value: &String) -> Self {
        ParamValue::Str(value.clone())
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Int(value.into())
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        ParamValue::Int(value.into())
    }
}

impl From<u16> for ParamValue {
    fn from(value: u16) -> Self {
        ParamValue::Int(value.into())
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

/// Ordered parameter set for one API call
///
/// Setting an existing key replaces its value. Insertion order is kept for
/// inspection but has no effect on the signed output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    entries: Vec<(String, ParamValue)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Build parameters from a JSON object, e.g. `{"region":"asia"}`
    ///
    /// Strings, numbers and booleans are accepted. Nested objects, arrays and
    /// nulls cannot be stringified and are rejected.
    pub fn from_json(object: &serde_json::Map<String, Value>) -> Result<Self> {
        let mut params = Params::new();
        for (key, value) in object {
            let value = match value {
                Value::String(s) => ParamValue::Str(s.clone()),
                Value::Bool(b) => ParamValue::Bool(*b),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => ParamValue::Int(i),
                    None => ParamValue::Str(n.to_string()),
                },
                other => {
                    return Err(SignerError::InvalidParameter {
                        name: key.clone(),
                        reason: format!("cannot be rendered as a string: {}", other),
                    });
                }
            };
            params.insert(key.clone(), value);
        }
        Ok(params)
    }
}

impl<K, V> FromIterator<(K, V)> for Params
where
    K: Into<String>,
    V: Into<ParamValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Params::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

/// Signing options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignOptions {
    /// Value of the `response` parameter
    pub response_format: String,
    /// When set, the request carries `expires` (now + window) and
    /// `signatureVersion=3`
    pub expiry: Option<Duration>,
}

impl Default for SignOptions {
    fn default() -> Self {
        Self {
            response_format: "json".to_string(),
            expiry: None,
        }
    }
}

/// Output of signing: ready to send as URL query or POST body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    pub command: String,
    endpoint: String,
    /// Wire query, signature included as the final pair
    pub query: String,
    /// Percent-encoded base64 signature
    pub signature: String,
    /// Canonical form the HMAC was computed over
    pub hash_input: String,
    /// `expires` value when an expiry window was requested
    pub expires: Option<String>,
}

impl SignedRequest {
    /// Runnable GET URL
    pub fn url(&self) -> String {
        format!("{}?{}", self.endpoint, self.query)
    }

    /// Endpoint for POST submission
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Form body for POST submission
    pub fn body(&self) -> &str {
        &self.query
    }
}

/// Sign with default options (JSON response, no expiry)
pub fn sign(command: &str, params: &Params, credential: &Credential) -> Result<SignedRequest> {
    sign_at(
        command,
        params,
        credential,
        &SignOptions::default(),
        OffsetDateTime::UNIX_EPOCH,
    )
}

/// Sign at an explicit instant
///
/// `now` is only read when `options.expiry` is set; without an expiry window
/// the output depends on nothing but the inputs.
pub fn sign_at(
    command: &str,
    params: &Params,
    credential: &Credential,
    options: &SignOptions,
    now: OffsetDateTime,
) -> Result<SignedRequest> {
    credential.validate()?;

    if command.trim().is_empty() {
        return Err(SignerError::InvalidParameter {
            name: "command".to_string(),
            reason: "command name must not be empty".to_string(),
        });
    }

    let mut pairs: Vec<(String, String)> = Vec::with_capacity(params.len() + 5);
    for (key, value) in params.iter() {
        if key.is_empty() {
            return Err(SignerError::InvalidParameter {
                name: key.to_string(),
                reason: "parameter name must not be empty".to_string(),
            });
        }
        if key.eq_ignore_ascii_case("signature") {
            return Err(SignerError::InvalidParameter {
                name: key.to_string(),
                reason: "the signature is computed, not supplied".to_string(),
            });
        }
        if SIGNER_OWNED_KEYS.contains(&key.to_lowercase().as_str()) {
            continue;
        }
        pairs.push((key.to_string(), value.to_string()));
    }

    pairs.push(("apiKey".to_string(), credential.api_key.clone()));
    pairs.push(("command".to_string(), command.to_string()));
    pairs.push(("response".to_string(), options.response_format.clone()));

    let expires = match options.expiry {
        Some(window) => {
            let expires = format_expires(now + window)?;
            pairs.push(("expires".to_string(), expires.clone()));
            pairs.push((
                "signatureVersion".to_string(),
                SIGNATURE_VERSION.to_string(),
            ));
            Some(expires)
        }
        None => None,
    };

    encoding::sort_params(&mut pairs);

    let hash_input = encoding::canonical_form(&pairs);
    let signature = compute_signature(&hash_input, &credential.secret_key)?;
    let query = format!("{}&signature={}", encoding::wire_query(&pairs), signature);

    Ok(SignedRequest {
        command: command.to_string(),
        endpoint: credential.endpoint.clone(),
        query,
        signature,
        hash_input,
        expires,
    })
}

fn compute_signature(hash_input: &str, secret: &str) -> Result<String> {
    let mut mac =
        HmacSha1::new_from_slice(secret.as_bytes()).map_err(|e| SignerError::InvalidParameter {
            name: "secret_key".to_string(),
            reason: e.to_string(),
        })?;
    mac.update(hash_input.as_bytes());
    let digest = mac.finalize().into_bytes();
    Ok(encode_value(&STANDARD.encode(digest)))
}

/// `YYYY-MM-DDTHH:MM:SS+0000`, always rendered in UTC
fn format_expires(at: OffsetDateTime) -> Result<String> {
    let at = at.to_offset(UtcOffset::UTC);
    let formatted = at
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second]"
        ))
        .map_err(|e| SignerError::InvalidParameter {
            name: "expires".to_string(),
            reason: e.to_string(),
        })?;
    Ok(format!("{}+0000", formatted))
}

/// Signer bound to one credential and option set
#[derive(Debug, Clone)]
pub struct RequestSigner {
    credential: Credential,
    options: SignOptions,
}

impl RequestSigner {
    pub fn new(credential: Credential, options: SignOptions) -> Self {
        Self {
            credential,
            options,
        }
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn options(&self) -> &SignOptions {
        &self.options
    }

    pub fn sign(&self, command: &str, params: &Params) -> Result<SignedRequest> {
        sign_at(
            command,
            params,
            &self.credential,
            &self.options,
            OffsetDateTime::now_utc(),
        )
    }
}
