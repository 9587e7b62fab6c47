//! Executes single requests and classifies their outcome.
//!
//! Only the network call is timed: the request is fully built before the timer starts, and the
//! checksum of a downloaded body is computed after it stopped.

use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{ETAG, HeaderMap};
use serde::Serialize;

use crate::error::Result;
use crate::payload::Checksum;
use crate::request::{Method, RequestDescriptor};
use crate::session::{AsyncSession, BlockingSession};
use crate::timer::Timer;

/// Why a request failed to reach a successful response.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, thiserror::Error)]
pub enum TransportError {
    /// The server answered with a non-2xx status.
    #[error("unexpected status {0}")]
    Status(#[serde(serialize_with = "serialize_status")] StatusCode),
    /// Connecting, sending or receiving failed, or the request timed out.
    #[error("request failed: {0}")]
    Request(String),
    /// The request was never carried out, or its worker ended without reporting back.
    #[error("request aborted: {0}")]
    Aborted(String),
}

fn serialize_status<S: serde::Serializer>(status: &StatusCode, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u16(status.as_u16())
}

/// Classification of a completed request.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outcome {
    /// A 2xx response whose integrity token, if any, matched the payload.
    Success,
    /// The request did not produce a successful response.
    TransportFailure {
        /// What went wrong.
        error: TransportError,
    },
    /// The response was successful, but its contents disagree with the payload.
    IntegrityMismatch {
        /// Checksum of the payload that was sent or expected.
        expected: Checksum,
        /// The mismatching `ETag` or checksum of the received body.
        returned: String,
    },
}

/// The timed result of one [`RequestDescriptor`].
#[derive(Clone, Debug, Serialize)]
pub struct RequestResult {
    /// Index of the request within its run.
    pub index: u64,
    /// HTTP status of the response, if one was received.
    #[serde(serialize_with = "serialize_opt_status")]
    pub status: Option<StatusCode>,
    /// The `ETag` returned by the server, quotes stripped.
    pub etag: Option<String>,
    /// Duration of the network call in milliseconds.
    pub elapsed_ms: u64,
    /// Number of payload bytes moved by this request.
    pub bytes: u64,
    /// How the request ended.
    pub outcome: Outcome,
}

fn serialize_opt_status<S: serde::Serializer>(
    status: &Option<StatusCode>,
    s: S,
) -> Result<S::Ok, S::Error> {
    match status {
        Some(status) => s.serialize_some(&status.as_u16()),
        None => s.serialize_none(),
    }
}

impl RequestResult {
    /// A result for a request that never completed.
    pub fn aborted(index: u64, reason: impl Into<String>) -> Self {
        Self {
            index,
            status: None,
            etag: None,
            elapsed_ms: 0,
            bytes: 0,
            outcome: Outcome::TransportFailure {
                error: TransportError::Aborted(reason.into()),
            },
        }
    }

    /// Returns `true` if the request succeeded and passed verification.
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

/// The parts of a response needed to judge it.
struct Response {
    status: StatusCode,
    etag: Option<String>,
    body: Option<Bytes>,
}

impl Response {
    fn new(status: StatusCode, headers: &HeaderMap) -> Self {
        Self {
            status,
            etag: etag(headers),
            body: None,
        }
    }
}

/// Extracts the `ETag` header value with surrounding quotes removed.
///
/// Header names are matched case-insensitively, so `ETag`, `Etag` and `etag` are all found.
/// Returns `None` only if the header is absent. Bytes that are not valid UTF-8 are replaced, so
/// such a token can never equal a hex checksum.
pub fn etag(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(ETAG)?.as_bytes().trim_ascii();
    let value = value.strip_prefix(b"\"").unwrap_or(value);
    let value = value.strip_suffix(b"\"").unwrap_or(value);
    Some(String::from_utf8_lossy(value).into_owned())
}

/// Compares a successful response against the expected payload checksum.
///
/// A returned `ETag` must match the checksum byte for byte. If the body was downloaded, its
/// checksum must match as well. A response without `ETag` is accepted when there is nothing
/// else to compare.
pub fn verify(expected: &Checksum, etag: Option<&str>, body: Option<&Checksum>) -> Outcome {
    if let Some(etag) = etag
        && etag != expected.as_str()
    {
        return Outcome::IntegrityMismatch {
            expected: expected.clone(),
            returned: etag.to_owned(),
        };
    }

    if let Some(body) = body
        && body != expected
    {
        return Outcome::IntegrityMismatch {
            expected: expected.clone(),
            returned: body.to_string(),
        };
    }

    Outcome::Success
}

/// Sends the request over an async session and returns its timed result.
///
/// Per-request failures are part of the returned [`RequestResult`]. An error is only returned
/// when the session or timer is misused.
pub async fn execute(
    session: &AsyncSession,
    descriptor: &RequestDescriptor,
) -> Result<RequestResult> {
    let mut request = session
        .client()
        .request(descriptor.method.into(), &descriptor.uri)
        .headers(descriptor.headers.clone());
    if descriptor.method.sends_body() {
        request = request.body(descriptor.payload.data().clone());
    }
    let read_body = descriptor.method == Method::Get;

    let mut timer = Timer::new();
    timer.start();
    let connection = session.connection().await?;
    let response = match request.send().await {
        Ok(response) => {
            let mut received = Response::new(response.status(), response.headers());
            if read_body && received.status.is_success() {
                response.bytes().await.map(|body| {
                    received.body = Some(body);
                    received
                })
            } else {
                Ok(received)
            }
        }
        Err(err) => Err(err),
    };
    drop(connection);
    timer.stop()?;

    Ok(complete(descriptor, timer.elapsed_ms()?, response))
}

/// Sends the request over a blocking session and returns its timed result.
///
/// Blocks the calling thread. Must not be called from async code.
pub fn execute_blocking(
    session: &BlockingSession,
    descriptor: &RequestDescriptor,
) -> Result<RequestResult> {
    let mut request = session
        .client()?
        .request(descriptor.method.into(), &descriptor.uri)
        .headers(descriptor.headers.clone());
    if descriptor.method.sends_body() {
        request = request.body(descriptor.payload.data().clone());
    }
    let read_body = descriptor.method == Method::Get;

    let mut timer = Timer::new();
    timer.start();
    let connection = session.connection()?;
    let response = request.send().and_then(|response| {
        let mut received = Response::new(response.status(), response.headers());
        if read_body && received.status.is_success() {
            received.body = Some(response.bytes()?);
        }
        Ok(received)
    });
    drop(connection);
    timer.stop()?;

    Ok(complete(descriptor, timer.elapsed_ms()?, response))
}

fn complete(
    descriptor: &RequestDescriptor,
    elapsed_ms: u64,
    response: Result<Response, reqwest::Error>,
) -> RequestResult {
    let mut result = RequestResult {
        index: descriptor.index,
        status: None,
        etag: None,
        elapsed_ms,
        bytes: descriptor.transfer_size(),
        outcome: Outcome::Success,
    };

    let response = match response {
        Ok(response) => response,
        Err(err) => {
            tracing::debug!(uri = %descriptor.uri, error = %err, "request failed");
            result.status = err.status();
            result.outcome = Outcome::TransportFailure {
                error: TransportError::Request(err.to_string()),
            };
            return result;
        }
    };

    result.status = Some(response.status);
    result.etag = response.etag;

    if !response.status.is_success() {
        tracing::debug!(uri = %descriptor.uri, status = %response.status, "unexpected status");
        result.outcome = Outcome::TransportFailure {
            error: TransportError::Status(response.status),
        };
        return result;
    }

    let body_checksum = response.body.as_deref().map(Checksum::of);
    result.outcome = verify(
        descriptor.payload.checksum(),
        result.etag.as_deref(),
        body_checksum.as_ref(),
    );

    if let Outcome::IntegrityMismatch { expected, returned } = &result.outcome {
        tracing::warn!(
            uri = %descriptor.uri,
            %expected,
            %returned,
            "integrity check failed"
        );
    } else if result.etag.is_none() && body_checksum.is_none() {
        tracing::debug!(uri = %descriptor.uri, "response carried no integrity token");
    } else {
        tracing::trace!(uri = %descriptor.uri, elapsed_ms, "request completed");
    }

    result
}
