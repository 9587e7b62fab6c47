use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use loadgen::signer::SigningRequest;
use loadgen::{
    BackendKind, ConcurrencyPolicy, Error, JwtSigner, Method, RunCoordinator,
    RunCoordinatorBuilder, Signer,
};
use loadgen_test::server::{ServerOptions, TestServer};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use tokio_util::sync::CancellationToken;

const BUCKET: &str = "sourcebucket";

fn coordinator(server: &TestServer) -> RunCoordinatorBuilder {
    RunCoordinator::builder("test", server.endpoint())
        .object_size(4096)
        .timeout(Some(Duration::from_secs(10)))
}

/// Checks on the server side that no request of a wave started before the previous wave ended.
fn assert_sequential_waves(server: &TestServer, coordinator: &RunCoordinator, group_size: u64) {
    let events = server.events();
    let total = events.len() as u64;
    let wave_of = |key: &str| {
        let index = (0..total)
            .find(|&index| coordinator.object_name(index) == key)
            .unwrap();
        index / group_size
    };

    for wave in 1..total.div_ceil(group_size) {
        let last_finished = events
            .iter()
            .filter(|event| wave_of(&event.key) == wave - 1)
            .map(|event| event.finished)
            .max()
            .unwrap();
        let first_started = events
            .iter()
            .filter(|event| wave_of(&event.key) == wave)
            .map(|event| event.started)
            .min()
            .unwrap();
        assert!(last_finished <= first_started, "wave {wave} overlaps");
    }
}

#[tokio::test]
async fn capacity_respects_connection_limit() {
    loadgen_test::tracing::init();
    let server =
        TestServer::with_options(ServerOptions::default().delay(Duration::from_millis(20))).await;

    let report = coordinator(&server)
        .build()
        .run(12, ConcurrencyPolicy::Capacity { max_in_flight: 3 })
        .await
        .unwrap();

    assert_eq!(report.succeeded, 12);
    assert_eq!(report.waves, 1);
    assert_eq!(report.bytes_transferred, 12 * 4096);
    assert!(report.is_complete());
    assert_eq!(server.events().len(), 12);
    assert!(server.peak_in_flight() <= 3, "{}", server.peak_in_flight());
}

#[tokio::test]
async fn grouped_waves_do_not_overlap() {
    loadgen_test::tracing::init();
    let server =
        TestServer::with_options(ServerOptions::default().delay(Duration::from_millis(20))).await;
    let coordinator = coordinator(&server).build();

    let policy = ConcurrencyPolicy::Grouped {
        group_size: 2,
        max_in_flight: 2,
    };
    let report = coordinator.run(4, policy).await.unwrap();

    assert_eq!(report.succeeded, 4);
    assert_eq!(report.waves, 2);

    assert_sequential_waves(&server, &coordinator, 2);
}

#[tokio::test]
async fn uneven_last_group() {
    let server = TestServer::new().await;

    let policy = ConcurrencyPolicy::Grouped {
        group_size: 2,
        max_in_flight: 2,
    };
    let report = coordinator(&server).build().run(5, policy).await.unwrap();

    assert_eq!(report.succeeded, 5);
    assert_eq!(report.waves, 3);
}

#[tokio::test]
async fn failures_are_kept_apart() {
    loadgen_test::tracing::init();
    let options = ServerOptions::default()
        .fail("test_object_1_sz4096")
        .corrupt_etag("test_object_2_sz4096");
    let server = TestServer::with_options(options).await;

    let report = coordinator(&server)
        .build()
        .run(5, ConcurrencyPolicy::Capacity { max_in_flight: 5 })
        .await
        .unwrap();

    assert_eq!(report.succeeded, 3);
    assert_eq!(report.transport_failed, 1);
    assert_eq!(report.integrity_failed, 1);
    assert_eq!(report.bytes_transferred, 3 * 4096);
    assert!(report.is_complete());
}

#[tokio::test]
async fn missing_etag_is_accepted() {
    let server = TestServer::with_options(ServerOptions::default().omit_etag()).await;

    let report = coordinator(&server)
        .build()
        .run(2, ConcurrencyPolicy::Capacity { max_in_flight: 2 })
        .await
        .unwrap();

    assert_eq!(report.succeeded, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn threaded_capacity() {
    loadgen_test::tracing::init();
    let server =
        TestServer::with_options(ServerOptions::default().delay(Duration::from_millis(10))).await;

    let coordinator = coordinator(&server).backend(BackendKind::Threaded).build();
    let report = coordinator
        .run(6, ConcurrencyPolicy::Capacity { max_in_flight: 2 })
        .await
        .unwrap();

    assert_eq!(report.succeeded, 6);
    assert!(report.is_complete());
    assert!(server.peak_in_flight() <= 2, "{}", server.peak_in_flight());

    let stored = server.object(BUCKET, &coordinator.object_name(5)).unwrap();
    assert_eq!(&stored, coordinator.payload(5).unwrap().data());
}

#[tokio::test(flavor = "multi_thread")]
async fn threaded_grouped_waves_do_not_overlap() {
    loadgen_test::tracing::init();
    let server =
        TestServer::with_options(ServerOptions::default().delay(Duration::from_millis(10))).await;
    let coordinator = coordinator(&server).backend(BackendKind::Threaded).build();

    let policy = ConcurrencyPolicy::Grouped {
        group_size: 3,
        max_in_flight: 3,
    };
    let report = coordinator.run(7, policy).await.unwrap();

    assert_eq!(report.succeeded, 7);
    assert_eq!(report.waves, 3);
    assert_eq!(server.events().len(), 7);
    assert_sequential_waves(&server, &coordinator, 3);
}

#[tokio::test]
async fn unreachable_endpoint_has_no_samples() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let result = RunCoordinator::builder("test", format!("http://127.0.0.1:{port}"))
        .object_size(16)
        .build()
        .run(3, ConcurrencyPolicy::Capacity { max_in_flight: 3 })
        .await;

    assert!(matches!(
        result,
        Err(Error::NoSamples {
            transport_failed: 3,
            integrity_failed: 0,
            not_started: 0,
        })
    ));
}

#[derive(Debug)]
struct Anonymous;

impl Signer for Anonymous {
    fn sign(&self, _request: &SigningRequest<'_>) -> loadgen::Result<HeaderMap> {
        Ok(HeaderMap::new())
    }
}

#[tokio::test]
async fn unsigned_requests_are_never_sent() {
    let server = TestServer::new().await;

    let result = coordinator(&server)
        .signer(Arc::new(Anonymous))
        .build()
        .run(3, ConcurrencyPolicy::Capacity { max_in_flight: 3 })
        .await;

    assert!(matches!(result, Err(Error::SigningFailed { .. })));
    assert!(server.events().is_empty());
}

#[tokio::test]
async fn jwt_authorization_reaches_server() {
    let server = TestServer::new().await;

    let report = coordinator(&server)
        .signer(Arc::new(JwtSigner::new("hunter2")))
        .build()
        .run(3, ConcurrencyPolicy::Capacity { max_in_flight: 3 })
        .await
        .unwrap();

    assert_eq!(report.succeeded, 3);
    let events = server.events();
    assert_eq!(events.len(), 3);
    for event in events {
        let authorization = event.authorization.unwrap();
        assert!(authorization.starts_with("Bearer "), "{authorization}");
    }
}

/// Records how many requests the server had handled whenever it signs one.
#[derive(Debug)]
struct Observing {
    server: Arc<TestServer>,
    handled: Mutex<Vec<usize>>,
}

impl Signer for Observing {
    fn sign(&self, _request: &SigningRequest<'_>) -> loadgen::Result<HeaderMap> {
        self.handled.lock().unwrap().push(self.server.events().len());
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer test"));
        Ok(headers)
    }
}

#[tokio::test]
async fn requests_are_signed_per_wave() {
    let server = Arc::new(TestServer::new().await);
    let signer = Arc::new(Observing {
        server: Arc::clone(&server),
        handled: Mutex::new(Vec::new()),
    });

    let policy = ConcurrencyPolicy::Grouped {
        group_size: 2,
        max_in_flight: 2,
    };
    let report = coordinator(&server)
        .unique_payloads(true)
        .signer(Arc::clone(&signer) as Arc<dyn Signer>)
        .build()
        .run(6, policy)
        .await
        .unwrap();

    assert_eq!(report.succeeded, 6);
    // The first entry is the up-front check before the session opens.
    let handled = signer.handled.lock().unwrap().clone();
    assert_eq!(handled, vec![0, 0, 0, 2, 2, 4, 4]);
}

#[tokio::test]
async fn get_reads_back_objects() {
    loadgen_test::tracing::init();
    let server = TestServer::new().await;
    let policy = ConcurrencyPolicy::Capacity { max_in_flight: 4 };

    let put = coordinator(&server).build();
    put.run(4, policy).await.unwrap();

    // Tamper with one stored object behind the client's back.
    server.insert(BUCKET, &put.object_name(3), &b"oh bye!"[..]);

    let report = coordinator(&server)
        .method(Method::Get)
        .build()
        .run(4, policy)
        .await
        .unwrap();

    assert_eq!(report.method, Method::Get);
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.integrity_failed, 1);
}

#[tokio::test]
async fn get_of_missing_object_fails() {
    let server = TestServer::new().await;

    let result = coordinator(&server)
        .method(Method::Get)
        .build()
        .run(2, ConcurrencyPolicy::Capacity { max_in_flight: 2 })
        .await;

    assert!(matches!(
        result,
        Err(Error::NoSamples {
            transport_failed: 2,
            ..
        })
    ));
}

#[tokio::test]
async fn unique_payloads_are_stored() {
    let server = TestServer::new().await;
    let coordinator = coordinator(&server).unique_payloads(true).build();

    coordinator
        .run(3, ConcurrencyPolicy::Capacity { max_in_flight: 3 })
        .await
        .unwrap();

    for index in 0..3 {
        let stored = server
            .object(BUCKET, &coordinator.object_name(index))
            .unwrap();
        assert_eq!(&stored, coordinator.payload(index).unwrap().data());
    }
    assert_ne!(
        server.object(BUCKET, &coordinator.object_name(0)),
        server.object(BUCKET, &coordinator.object_name(1)),
    );
}

#[tokio::test]
async fn cancellation_stops_further_waves() {
    let server =
        TestServer::with_options(ServerOptions::default().delay(Duration::from_millis(100))).await;
    let cancel = CancellationToken::new();

    let coordinator = coordinator(&server).cancellation(cancel.clone()).build();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
    });

    let policy = ConcurrencyPolicy::Grouped {
        group_size: 2,
        max_in_flight: 2,
    };
    let report = coordinator.run(6, policy).await.unwrap();

    assert_eq!(report.succeeded, 2);
    assert_eq!(report.not_started, 4);
    assert_eq!(report.waves, 1);
    assert!(report.is_complete());
    assert_eq!(server.events().len(), 2);
}
