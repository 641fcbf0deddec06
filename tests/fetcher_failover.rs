use std::collections::HashMap;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use hako2epub::config::{SyncConfig, parse_host};
use hako2epub::error::SyncError;
use hako2epub::fetch::{Fetcher, HostPool, RetryPolicy};
use url::Url;

type Handler = Arc<dyn Fn(&str) -> (u16, String) + Send + Sync>;

struct StubHost {
    base_url: String,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    shutdown: mpsc::Sender<()>,
    handle: thread::JoinHandle<()>,
}

impl StubHost {
    fn start(handler: Handler) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start tiny_http server");
        let base_url = format!("http://{}", server.server_addr());
        let hits = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown, shutdown_rx) = mpsc::channel::<()>();

        let counted = Arc::clone(&hits);
        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }
                let request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };
                let path = request.url().to_string();
                *counted.lock().unwrap().entry(path.clone()).or_insert(0) += 1;
                let (status, body) = handler(&path);
                let response = tiny_http::Response::from_string(body).with_status_code(status);
                let _ = request.respond(response);
            }
        });

        Self {
            base_url,
            hits,
            shutdown,
            handle,
        }
    }

    fn always(status: u16, body: &str) -> Self {
        let body = body.to_string();
        Self::start(Arc::new(move |_: &str| (status, body.clone())))
    }

    fn host(&self) -> Url {
        parse_host(&self.base_url).unwrap()
    }

    fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.join();
    }
}

fn fetcher(hosts: Vec<Url>, max_attempts: u32) -> Fetcher {
    let client = Fetcher::build_client(&SyncConfig::default()).unwrap();
    Fetcher::new(
        client,
        Arc::new(HostPool::from_hosts(hosts)),
        RetryPolicy {
            max_attempts,
            cooldown: Duration::from_millis(5),
        },
    )
}

fn dead_host() -> Url {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    parse_host(&format!("http://{addr}")).unwrap()
}

#[tokio::test]
async fn transient_errors_fail_over_to_the_next_host() {
    let flaky = StubHost::always(503, "busy");
    let healthy = StubHost::always(200, "<p>from mirror</p>");
    let fetcher = fetcher(vec![flaky.host(), healthy.host()], 2);

    let url = flaky.host().join("/truyen/1").unwrap();
    let (final_url, html) = fetcher.fetch_page(&url).await.unwrap();

    assert_eq!(html, "<p>from mirror</p>");
    assert_eq!(final_url.port(), healthy.host().port());
    assert_eq!(flaky.hits("/truyen/1"), 2);
    assert_eq!(healthy.hits("/truyen/1"), 1);

    flaky.stop();
    healthy.stop();
}

#[tokio::test]
async fn not_found_is_final_and_never_retried() {
    let missing = StubHost::always(404, "gone");
    let healthy = StubHost::always(200, "ok");
    let fetcher = fetcher(vec![missing.host(), healthy.host()], 3);

    let url = missing.host().join("/truyen/404").unwrap();
    let err = fetcher.fetch_page(&url).await.unwrap_err();

    assert!(matches!(err, SyncError::NotFound { .. }));
    assert!(err.is_invalid_input());
    assert_eq!(missing.hits("/truyen/404"), 1);
    assert_eq!(healthy.hits("/truyen/404"), 0);

    missing.stop();
    healthy.stop();
}

#[tokio::test]
async fn exhaustion_reports_every_attempt() {
    let a = StubHost::always(500, "boom");
    let b = StubHost::always(502, "bad gateway");
    let fetcher = fetcher(vec![a.host(), b.host()], 2);

    let url = b.host().join("/img/x.png").unwrap();
    let err = fetcher.fetch_bytes(&url).await.unwrap_err();

    match err {
        SyncError::NetworkExhausted { attempts, .. } => assert_eq!(attempts, 4),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(a.hits("/img/x.png"), 2);
    assert_eq!(b.hits("/img/x.png"), 2);

    a.stop();
    b.stop();
}

#[tokio::test]
async fn foreign_urls_are_fetched_as_is() {
    let pool_host = StubHost::always(200, "pool");
    let foreign = StubHost::always(200, "foreign");
    let fetcher = fetcher(vec![pool_host.host()], 1);

    let url = foreign.host().join("/i/abc.jpg").unwrap();
    let bytes = fetcher.fetch_bytes(&url).await.unwrap();

    assert_eq!(bytes, b"foreign");
    assert_eq!(pool_host.hits("/i/abc.jpg"), 0);

    pool_host.stop();
    foreign.stop();
}

#[tokio::test]
async fn probe_drops_unreachable_hosts_and_keeps_order() {
    let first = StubHost::always(200, "home");
    let second = StubHost::always(200, "home");
    let dead = dead_host();
    let client = Fetcher::build_client(&SyncConfig::default()).unwrap();

    let hosts = vec![dead.clone(), first.host(), second.host()];
    let pool = HostPool::probe(&client, &hosts, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(pool.active(), &[first.host(), second.host()]);
    assert_eq!(pool.primary(), Some(&dead));
    assert!(pool.is_known(&dead.join("/truyen/1").unwrap()));

    first.stop();
    second.stop();
}

#[tokio::test]
async fn probe_fails_when_no_host_answers() {
    let client = Fetcher::build_client(&SyncConfig::default()).unwrap();
    let err = HostPool::probe(&client, &[dead_host()], Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NoReachableHost { .. }));
}
