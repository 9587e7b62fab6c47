//! Request signing.
//!
//! Storage endpoints usually demand authenticated requests. The dispatcher itself is agnostic to
//! the scheme: it asks a [`Signer`] for headers and refuses to issue a request unless those
//! headers carry a non-empty `Authorization` entry.

use std::fmt;
use std::time::Duration;

use jsonwebtoken::{EncodingKey, Header, encode, get_current_timestamp};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::request::Method;

const DEFAULT_EXPIRY: Duration = Duration::from_secs(300);

/// The parts of a request that a signature covers.
#[derive(Clone, Copy, Debug)]
pub struct SigningRequest<'a> {
    /// The HTTP method.
    pub method: Method,
    /// The path of the request, `/bucket/object`.
    pub canonical_uri: &'a str,
    /// The query string without leading `?`, empty if there is none.
    pub query: &'a str,
    /// The request body. Empty for requests without body.
    pub body: &'a [u8],
}

/// Turns a request into the headers that authorize it.
pub trait Signer: fmt::Debug + Send + Sync {
    /// Produces the headers to attach to the request, including `Authorization`.
    fn sign(&self, request: &SigningRequest<'_>) -> Result<HeaderMap>;
}

/// Signs the request and checks that it carries authorization.
///
/// Fails with [`Error::SigningFailed`] if the signer errors or leaves the `Authorization` header
/// missing or empty.
pub fn signed_headers(
    signer: &dyn Signer,
    uri: &str,
    request: &SigningRequest<'_>,
) -> Result<HeaderMap> {
    let headers = signer.sign(request).map_err(|err| match err {
        Error::SigningFailed { .. } => err,
        other => Error::SigningFailed {
            uri: uri.to_owned(),
            reason: other.to_string(),
        },
    })?;

    let authorized = headers
        .get(AUTHORIZATION)
        .is_some_and(|value| !value.as_bytes().is_empty());

    if !authorized {
        return Err(Error::SigningFailed {
            uri: uri.to_owned(),
            reason: "no authorization header produced".to_owned(),
        });
    }

    Ok(headers)
}

#[derive(Debug, Deserialize, Serialize)]
struct Claims {
    exp: u64,
    method: String,
    uri: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    query: String,
    content_md5: String,
}

/// Signs requests with an HS256 bearer token bound to method, URI and body digest.
pub struct JwtSigner {
    encoding_key: EncodingKey,
    expiry: Duration,
}

impl JwtSigner {
    /// Creates a signer using a shared secret.
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            expiry: DEFAULT_EXPIRY,
        }
    }

    /// Sets how long issued tokens stay valid.
    pub fn expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }
}

impl fmt::Debug for JwtSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtSigner")
            .field("encoding_key", &"[redacted]")
            .field("expiry", &self.expiry)
            .finish()
    }
}

impl Signer for JwtSigner {
    fn sign(&self, request: &SigningRequest<'_>) -> Result<HeaderMap> {
        let claims = Claims {
            exp: get_current_timestamp() + self.expiry.as_secs(),
            method: request.method.to_string(),
            uri: request.canonical_uri.to_owned(),
            query: request.query.to_owned(),
            content_md5: format!("{:x}", md5::compute(request.body)),
        };

        let failed = |reason: String| Error::SigningFailed {
            uri: request.canonical_uri.to_owned(),
            reason,
        };

        let token = encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|err| failed(err.to_string()))?;
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|err| failed(err.to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value);
        Ok(headers)
    }
}
