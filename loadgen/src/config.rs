use std::time::Duration;

use bytesize::ByteSize;
use loadgen::{BackendKind, ConcurrencyPolicy, Method};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub endpoint: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_object_prefix")]
    pub object_prefix: String,

    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,

    #[serde(default)]
    pub signer: Option<SignerConfig>,

    pub runs: Vec<Run>,
}

#[derive(Debug, Deserialize)]
pub struct SignerConfig {
    pub secret: String,
    #[serde(default, with = "humantime_serde")]
    pub expiry: Option<Duration>,
}

#[derive(Debug, Deserialize)]
pub struct Run {
    pub label: String,
    #[serde(default)]
    pub method: Method,
    pub total_count: usize,
    pub object_size: ByteSize,
    #[serde(default)]
    pub unique_payloads: bool,
    #[serde(default)]
    pub backend: BackendKind,
    pub mode: ConcurrencyPolicy,
}

fn default_bucket() -> String {
    "sourcebucket".to_owned()
}

fn default_object_prefix() -> String {
    "test_object_".to_owned()
}
