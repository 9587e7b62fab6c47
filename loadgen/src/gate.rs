//! Bounds how many requests are outstanding and releases them in waves.
//!
//! The [`ConcurrencyGate`] never touches the network itself. It hands descriptors to a
//! [`Launcher`], which starts them in the background and reports each result over a completion
//! channel. The gate owns the receiving end and acts as a barrier: a wave is over once every
//! request in it has reported back, or its worker has gone away without doing so.
//!
//! Two launchers exist, selected through [`BackendKind`](crate::session::BackendKind):
//! tokio tasks on an [`AsyncSession`], and one OS thread per request on a [`BlockingSession`].

use std::collections::BTreeSet;
use std::thread;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::executor::{self, RequestResult};
use crate::request::RequestDescriptor;
use crate::session::{AsyncSession, BlockingSession, ClientSession};

/// Sending half of the completion channel handed to every launched request.
pub type Completion = mpsc::UnboundedSender<Result<RequestResult>>;

/// Starts a request in the background.
///
/// Implementations must send exactly one message through `done` per launched request, or drop
/// `done` if the request can no longer report.
pub trait Launcher: Send + Sync {
    /// Launches the request and returns immediately.
    fn launch(&self, descriptor: RequestDescriptor, done: Completion);
}

/// The strategy that governs how many requests run simultaneously.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConcurrencyPolicy {
    /// Release every request at once and let the connection limit bound the sockets in use.
    Capacity {
        /// Maximum number of requests on the wire at once.
        max_in_flight: usize,
    },
    /// Release requests in consecutive groups, each fully drained before the next starts.
    Grouped {
        /// Number of requests per group. The last group may be smaller.
        group_size: usize,
        /// Maximum number of requests on the wire at once within a group.
        max_in_flight: usize,
    },
}

impl ConcurrencyPolicy {
    /// Checks the policy against the number of requests of a run.
    pub fn validate(&self, total_count: usize) -> Result<()> {
        if total_count == 0 {
            return Err(Error::InvalidConfig(
                "total count must be at least 1".to_owned(),
            ));
        }
        if self.max_in_flight() == 0 {
            return Err(Error::InvalidConfig(
                "max in flight must be at least 1".to_owned(),
            ));
        }
        if let Self::Grouped { group_size, .. } = *self
            && (group_size == 0 || group_size > total_count)
        {
            return Err(Error::InvalidConfig(format!(
                "group size must be between 1 and {total_count}, got {group_size}"
            )));
        }
        Ok(())
    }

    /// The connection limit of the session.
    pub fn max_in_flight(&self) -> usize {
        match *self {
            Self::Capacity { max_in_flight } | Self::Grouped { max_in_flight, .. } => {
                max_in_flight
            }
        }
    }

    /// Number of requests released together.
    fn wave_size(&self, total_count: usize) -> usize {
        match *self {
            Self::Capacity { .. } => total_count,
            Self::Grouped { group_size, .. } => group_size,
        }
        .max(1)
    }
}

/// Bookkeeping of a finished dispatch.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DispatchStats {
    /// Number of waves released.
    pub waves: u64,
    /// Requests never released because the dispatch was cancelled.
    pub not_started: u64,
}

/// Releases requests according to a [`ConcurrencyPolicy`].
#[derive(Clone, Debug)]
pub struct ConcurrencyGate {
    policy: ConcurrencyPolicy,
}

impl ConcurrencyGate {
    /// Creates a gate for the given policy.
    pub fn new(policy: ConcurrencyPolicy) -> Self {
        Self { policy }
    }

    /// The policy of this gate.
    pub fn policy(&self) -> ConcurrencyPolicy {
        self.policy
    }

    /// Drives `total_count` requests through the launcher and hands every result to `on_result`.
    ///
    /// Descriptors are created through `build` one wave at a time, right before the wave is
    /// released, and dropped once their results are recorded. Waves run strictly in order.
    /// Results within a wave arrive in completion order. Once `cancel` fires, no further wave is
    /// released, but the wave in flight is drained.
    ///
    /// Returns an error if `build` fails, in which case nothing of that wave is launched, or if a
    /// request reports misuse of the session or timer. The wave is drained before the latter is
    /// returned.
    pub async fn dispatch<B, F>(
        &self,
        launcher: &dyn Launcher,
        total_count: usize,
        cancel: &CancellationToken,
        mut build: B,
        mut on_result: F,
    ) -> Result<DispatchStats>
    where
        B: FnMut(u64) -> Result<RequestDescriptor>,
        F: FnMut(RequestResult),
    {
        let wave_size = self.policy.wave_size(total_count);
        let mut stats = DispatchStats::default();
        let mut next = 0;

        while next < total_count {
            if cancel.is_cancelled() {
                stats.not_started = (total_count - next) as u64;
                tracing::warn!(not_started = stats.not_started, "dispatch cancelled");
                break;
            }

            let end = (next + wave_size).min(total_count);
            let wave = (next..end)
                .map(|index| build(index as u64))
                .collect::<Result<Vec<_>>>()?;
            next = end;

            stats.waves += 1;
            tracing::debug!(wave = stats.waves, size = wave.len(), "releasing wave");

            let mut outstanding: BTreeSet<u64> = wave.iter().map(|d| d.index).collect();
            let (done, mut completed) = mpsc::unbounded_channel();
            for descriptor in wave {
                launcher.launch(descriptor, done.clone());
            }
            // Only the launched requests hold senders now, so the channel closes once all of
            // them have finished or gone away.
            drop(done);

            let mut failure = None;
            while !outstanding.is_empty() {
                let Some(completion) = completed.recv().await else {
                    break;
                };
                match completion {
                    Ok(result) => {
                        outstanding.remove(&result.index);
                        on_result(result);
                    }
                    Err(err) => {
                        tracing::error!(error = &err as &dyn std::error::Error, "request misused");
                        failure.get_or_insert(err);
                    }
                }
            }

            for index in outstanding {
                tracing::warn!(index, "request ended without reporting a result");
                on_result(RequestResult::aborted(
                    index,
                    "worker ended without reporting a result",
                ));
            }

            if let Some(err) = failure {
                return Err(err);
            }
        }

        Ok(stats)
    }
}

impl Launcher for AsyncSession {
    fn launch(&self, descriptor: RequestDescriptor, done: Completion) {
        let session = self.clone();
        tokio::spawn(async move {
            let result = executor::execute(&session, &descriptor).await;
            // The gate only stops listening once every sender is gone.
            let _ = done.send(result);
        });
    }
}

impl Launcher for BlockingSession {
    fn launch(&self, descriptor: RequestDescriptor, done: Completion) {
        let index = descriptor.index;
        let session = self.clone();
        let worker_done = done.clone();

        let spawned = thread::Builder::new()
            .name(format!("loadgen-request-{index}"))
            .spawn(move || {
                let result = executor::execute_blocking(&session, &descriptor);
                let _ = worker_done.send(result);
            });

        if let Err(err) = spawned {
            tracing::error!(
                index,
                error = &err as &dyn std::error::Error,
                "failed to spawn request thread"
            );
            let _ = done.send(Ok(RequestResult::aborted(
                index,
                format!("failed to spawn thread: {err}"),
            )));
        }
    }
}

impl Launcher for ClientSession {
    fn launch(&self, descriptor: RequestDescriptor, done: Completion) {
        match self {
            Self::Async(session) => session.launch(descriptor, done),
            Self::Blocking(session) => session.launch(descriptor, done),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use reqwest::header::HeaderMap;

    use super::*;
    use crate::executor::Outcome;
    use crate::payload::Payload;
    use crate::request::Method;

    /// Completes every request after a fixed delay and records when it was launched.
    #[derive(Default)]
    struct FakeLauncher {
        delay: Duration,
        launched: Arc<Mutex<Vec<(u64, Instant)>>>,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Launcher for FakeLauncher {
        fn launch(&self, descriptor: RequestDescriptor, done: Completion) {
            self.launched
                .lock()
                .unwrap()
                .push((descriptor.index, Instant::now()));

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let in_flight = Arc::clone(&self.in_flight);
            let delay = self.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                let _ = done.send(Ok(success(&descriptor, delay)));
            });
        }
    }

    /// Drops every request without reporting, as a panicking worker would.
    struct VanishingLauncher;

    impl Launcher for VanishingLauncher {
        fn launch(&self, _descriptor: RequestDescriptor, done: Completion) {
            tokio::spawn(async move {
                drop(done);
            });
        }
    }

    /// Reports a misuse error for the first request and succeeds for all others.
    #[derive(Default)]
    struct MisusingLauncher {
        launched: AtomicUsize,
    }

    impl Launcher for MisusingLauncher {
        fn launch(&self, descriptor: RequestDescriptor, done: Completion) {
            self.launched.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let completion = if descriptor.index == 0 {
                    Err(Error::InvalidState("timer stopped before it was started"))
                } else {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(success(&descriptor, Duration::ZERO))
                };
                let _ = done.send(completion);
            });
        }
    }

    fn success(descriptor: &RequestDescriptor, elapsed: Duration) -> RequestResult {
        RequestResult {
            index: descriptor.index,
            status: Some(reqwest::StatusCode::OK),
            etag: None,
            elapsed_ms: elapsed.as_millis() as u64,
            bytes: descriptor.transfer_size(),
            outcome: Outcome::Success,
        }
    }

    fn descriptor(index: u64) -> Result<RequestDescriptor> {
        Ok(RequestDescriptor {
            index,
            uri: format!("http://localhost/bucket/object_{index}"),
            method: Method::Put,
            payload: Payload::from_bytes(&b"oh hai!"[..]),
            headers: HeaderMap::new(),
        })
    }

    #[tokio::test]
    async fn grouped_waves_are_barriers() {
        let launcher = FakeLauncher {
            delay: Duration::from_millis(20),
            ..Default::default()
        };
        let gate = ConcurrencyGate::new(ConcurrencyPolicy::Grouped {
            group_size: 2,
            max_in_flight: 2,
        });

        let mut recorded = Vec::new();
        let stats = gate
            .dispatch(&launcher, 4, &CancellationToken::new(), descriptor, |result| {
                recorded.push((result.index, Instant::now()))
            })
            .await
            .unwrap();

        assert_eq!(stats.waves, 2);
        assert_eq!(recorded.len(), 4);
        assert_eq!(launcher.peak.load(Ordering::SeqCst), 2);

        let launched = launcher.launched.lock().unwrap();
        let first_recorded = recorded.iter().filter(|(i, _)| *i < 2).map(|(_, t)| *t);
        let second_launched = launched.iter().filter(|(i, _)| *i >= 2).map(|(_, t)| *t);
        let last_of_first = first_recorded.max().unwrap();
        let first_of_second = second_launched.min().unwrap();
        assert!(last_of_first <= first_of_second);
    }

    #[tokio::test]
    async fn descriptors_are_built_per_wave() {
        let launcher = FakeLauncher {
            delay: Duration::from_millis(5),
            ..Default::default()
        };
        let gate = ConcurrencyGate::new(ConcurrencyPolicy::Grouped {
            group_size: 2,
            max_in_flight: 2,
        });

        // For every built descriptor, the number of results recorded at that time.
        let recorded = AtomicUsize::new(0);
        let mut built = Vec::new();
        gate.dispatch(
            &launcher,
            6,
            &CancellationToken::new(),
            |index| {
                built.push((index, recorded.load(Ordering::SeqCst)));
                descriptor(index)
            },
            |_| {
                recorded.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await
        .unwrap();

        assert_eq!(
            built,
            vec![(0, 0), (1, 0), (2, 2), (3, 2), (4, 4), (5, 4)]
        );
    }

    #[tokio::test]
    async fn build_failure_stops_dispatch() {
        let launcher = FakeLauncher::default();
        let gate = ConcurrencyGate::new(ConcurrencyPolicy::Grouped {
            group_size: 2,
            max_in_flight: 2,
        });

        let mut count = 0;
        let result = gate
            .dispatch(
                &launcher,
                6,
                &CancellationToken::new(),
                |index| {
                    if index == 3 {
                        return Err(Error::SigningFailed {
                            uri: format!("/bucket/object_{index}"),
                            reason: "no key".to_owned(),
                        });
                    }
                    descriptor(index)
                },
                |_| count += 1,
            )
            .await;

        assert!(matches!(result, Err(Error::SigningFailed { .. })));
        assert_eq!(count, 2);
        assert_eq!(launcher.launched.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn misuse_drains_wave_then_fails() {
        let launcher = MisusingLauncher::default();
        let gate = ConcurrencyGate::new(ConcurrencyPolicy::Grouped {
            group_size: 3,
            max_in_flight: 3,
        });

        let mut results = Vec::new();
        let result = gate
            .dispatch(&launcher, 6, &CancellationToken::new(), descriptor, |r| {
                results.push(r)
            })
            .await;

        assert!(matches!(result, Err(Error::InvalidState(_))));
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 3);

        results.sort_by_key(|r| r.index);
        assert_eq!(results.len(), 3);
        assert!(!results[0].is_success());
        assert!(results[1].is_success());
        assert!(results[2].is_success());
    }

    #[tokio::test]
    async fn uneven_last_group() {
        let launcher = FakeLauncher::default();
        let gate = ConcurrencyGate::new(ConcurrencyPolicy::Grouped {
            group_size: 2,
            max_in_flight: 2,
        });

        let mut count = 0;
        let stats = gate
            .dispatch(&launcher, 5, &CancellationToken::new(), descriptor, |_| {
                count += 1
            })
            .await
            .unwrap();

        assert_eq!(stats.waves, 3);
        assert_eq!(count, 5);
    }

    #[tokio::test]
    async fn capacity_releases_everything() {
        let launcher = FakeLauncher {
            delay: Duration::from_millis(20),
            ..Default::default()
        };
        let gate = ConcurrencyGate::new(ConcurrencyPolicy::Capacity { max_in_flight: 3 });

        let mut count = 0;
        let stats = gate
            .dispatch(&launcher, 8, &CancellationToken::new(), descriptor, |_| {
                count += 1
            })
            .await
            .unwrap();

        assert_eq!(stats.waves, 1);
        assert_eq!(count, 8);
        assert_eq!(launcher.peak.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn vanished_workers_do_not_hang() {
        let gate = ConcurrencyGate::new(ConcurrencyPolicy::Grouped {
            group_size: 2,
            max_in_flight: 2,
        });

        let mut results = Vec::new();
        gate.dispatch(
            &VanishingLauncher,
            3,
            &CancellationToken::new(),
            descriptor,
            |r| results.push(r),
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| !r.is_success()));
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let gate = ConcurrencyGate::new(ConcurrencyPolicy::Capacity { max_in_flight: 1 });

        let mut count = 0;
        let stats = gate
            .dispatch(&FakeLauncher::default(), 4, &cancel, descriptor, |_| {
                count += 1
            })
            .await
            .unwrap();

        assert_eq!(count, 0);
        assert_eq!(stats.waves, 0);
        assert_eq!(stats.not_started, 4);
    }

    #[test]
    fn validates_policy() {
        let grouped = |group_size| ConcurrencyPolicy::Grouped {
            group_size,
            max_in_flight: 10,
        };

        assert!(grouped(2).validate(4).is_ok());
        assert!(grouped(4).validate(4).is_ok());
        assert!(grouped(5).validate(4).is_err());
        assert!(grouped(0).validate(4).is_err());
        assert!(grouped(1).validate(0).is_err());

        let capacity = ConcurrencyPolicy::Capacity { max_in_flight: 0 };
        assert!(capacity.validate(4).is_err());
    }
}
