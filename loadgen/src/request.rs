//! Descriptions of the individual requests making up a run.

use std::fmt;

use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::payload::Payload;

/// The HTTP methods a run can issue.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Uploads the payload and verifies the returned `ETag`.
    #[default]
    Put,
    /// Downloads the object and verifies both `ETag` and body against the payload.
    Get,
}

impl Method {
    /// Returns `true` if requests of this method send the payload as body.
    pub fn sends_body(self) -> bool {
        matches!(self, Self::Put)
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Put => reqwest::Method::PUT,
            Method::Get => reqwest::Method::GET,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Put => f.write_str("PUT"),
            Self::Get => f.write_str("GET"),
        }
    }
}

/// One logical request of a run.
///
/// Created by the [`RunCoordinator`](crate::RunCoordinator), consumed when its result has been
/// recorded.
#[derive(Debug)]
pub struct RequestDescriptor {
    /// Position of the request within the run, starting at zero.
    pub index: u64,
    /// Full target URI, `scheme://host[:port]/bucket/object`.
    pub uri: String,
    /// The method to issue.
    pub method: Method,
    /// The payload sent by a PUT, or expected back from a GET.
    pub payload: Payload,
    /// Additional headers, including the signer's `Authorization`.
    pub headers: HeaderMap,
}

impl RequestDescriptor {
    /// Number of payload bytes this request moves over the wire.
    pub fn transfer_size(&self) -> u64 {
        self.payload.len() as u64
    }
}
