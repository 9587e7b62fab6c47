//! Drives a complete run: payload, descriptors, session, gate and report.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::HeaderMap;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::gate::{ConcurrencyGate, ConcurrencyPolicy};
use crate::payload::{Payload, PayloadSource};
use crate::report::{ReportAggregator, RunReport};
use crate::request::{Method, RequestDescriptor};
use crate::session::{BackendKind, ClientSession, SessionConfig};
use crate::signer::{Signer, SigningRequest, signed_headers};

/// A builder for creating a [`RunCoordinator`].
#[derive(Debug)]
pub struct RunCoordinatorBuilder {
    label: String,
    endpoint: String,
    bucket: String,
    object_prefix: String,
    method: Method,
    object_size: usize,
    unique_payloads: bool,
    backend: BackendKind,
    timeout: Option<Duration>,
    signer: Option<Arc<dyn Signer>>,
    cancel: CancellationToken,
}

impl RunCoordinatorBuilder {
    /// The bucket objects are written to or read from.
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    /// Prefix of the generated object names.
    pub fn object_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.object_prefix = prefix.into();
        self
    }

    /// The method every request of the run issues.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Size of each object in bytes.
    pub fn object_size(mut self, size: usize) -> Self {
        self.object_size = size;
        self
    }

    /// Gives each object distinct contents instead of sharing one payload.
    pub fn unique_payloads(mut self, unique: bool) -> Self {
        self.unique_payloads = unique;
        self
    }

    /// The execution model carrying the requests.
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Timeout for each request.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Signs every request. Without a signer, requests are sent anonymously.
    pub fn signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// A token that stops the run from releasing further waves once cancelled.
    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Creates the coordinator.
    pub fn build(self) -> RunCoordinator {
        RunCoordinator {
            label: self.label,
            endpoint: self.endpoint.trim_end_matches('/').to_owned(),
            bucket: self.bucket,
            object_prefix: self.object_prefix,
            method: self.method,
            object_size: self.object_size,
            unique_payloads: self.unique_payloads,
            backend: self.backend,
            timeout: self.timeout,
            signer: self.signer,
            cancel: self.cancel,
            payloads: PayloadSource::default(),
        }
    }
}

/// Runs a fixed number of requests against one endpoint and reports on them.
#[derive(Debug)]
pub struct RunCoordinator {
    label: String,
    endpoint: String,
    bucket: String,
    object_prefix: String,
    method: Method,
    object_size: usize,
    unique_payloads: bool,
    backend: BackendKind,
    timeout: Option<Duration>,
    signer: Option<Arc<dyn Signer>>,
    cancel: CancellationToken,
    payloads: PayloadSource,
}

impl RunCoordinator {
    /// Constructs a new builder for a run named `label` against `endpoint`.
    pub fn builder(label: impl Into<String>, endpoint: impl Into<String>) -> RunCoordinatorBuilder {
        RunCoordinatorBuilder {
            label: label.into(),
            endpoint: endpoint.into(),
            bucket: "sourcebucket".to_owned(),
            object_prefix: "test_object_".to_owned(),
            method: Method::Put,
            object_size: 1024 * 1024,
            unique_payloads: false,
            backend: BackendKind::Async,
            timeout: None,
            signer: None,
            cancel: CancellationToken::new(),
        }
    }

    /// The name of the run.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Name of the object addressed by the request at `index`.
    pub fn object_name(&self, index: u64) -> String {
        format!("{}{index}_sz{}", self.object_prefix, self.object_size)
    }

    /// The payload the request at `index` sends or expects.
    pub fn payload(&self, index: u64) -> Result<Payload> {
        if self.unique_payloads {
            Ok(Payload::unique(index, self.object_size))
        } else {
            self.payloads.create(self.object_size).cloned()
        }
    }

    /// Performs `total_count` requests under the given policy.
    ///
    /// Individual request failures are counted in the report and never abort the run. Failing
    /// to sign a request or to open the session does abort it. Requests are built and signed
    /// wave by wave, so tokens are fresh when they are sent and unique payloads only exist while
    /// their wave is in flight.
    pub async fn run(&self, total_count: usize, policy: ConcurrencyPolicy) -> Result<RunReport> {
        policy.validate(total_count)?;

        tracing::info!(
            label = %self.label,
            method = %self.method,
            total_count,
            ?policy,
            backend = ?self.backend,
            "starting run"
        );

        // A signer that cannot authorize requests fails the run before the session opens.
        self.descriptor(0)?;

        let config = SessionConfig {
            max_connections: policy.max_in_flight(),
            timeout: self.timeout,
        };
        let session = ClientSession::open(self.backend, &config).await?;

        let mut aggregator = ReportAggregator::new(&self.label, self.method, total_count as u64);
        let gate = ConcurrencyGate::new(policy);

        let start = Instant::now();
        let dispatched = gate
            .dispatch(
                &session,
                total_count,
                &self.cancel,
                |index| self.descriptor(index),
                |result| aggregator.record(result),
            )
            .await;
        let wall_time = start.elapsed();
        session.close();

        let stats = dispatched?;
        aggregator.record_not_started(stats.not_started);
        aggregator.finish(stats.waves, wall_time);

        tracing::info!(
            label = %self.label,
            recorded = aggregator.recorded(),
            not_started = stats.not_started,
            waves = stats.waves,
            ?wall_time,
            "run finished"
        );

        aggregator.summary()
    }

    fn descriptor(&self, index: u64) -> Result<RequestDescriptor> {
        let payload = self.payload(index)?;
        let canonical_uri = format!("/{}/{}", self.bucket, self.object_name(index));
        let uri = format!("{}{canonical_uri}", self.endpoint);

        let headers = match &self.signer {
            Some(signer) => {
                let body: &[u8] = if self.method.sends_body() {
                    payload.data()
                } else {
                    &[]
                };
                let request = SigningRequest {
                    method: self.method,
                    canonical_uri: &canonical_uri,
                    query: "",
                    body,
                };
                signed_headers(signer.as_ref(), &uri, &request)?
            }
            None => HeaderMap::new(),
        };

        Ok(RequestDescriptor {
            index,
            uri,
            method: self.method,
            payload,
            headers,
        })
    }
}
