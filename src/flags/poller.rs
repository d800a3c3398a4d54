//! A background poller thread that periodically fetches flag and cohort
//! definitions and replaces the cached copy. The first fetch completes
//! before `start` returns, so flag queries issued right after construction
//! already see cached data.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{RecvTimeoutError, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rand::{thread_rng, Rng};
use reqwest::header::{ACCEPT, AUTHORIZATION, ETAG, IF_NONE_MATCH, USER_AGENT};
use reqwest::{StatusCode, Url};

use super::models::{FlagDefinitions, LocalEvaluationResponse};
use super::store::FlagDefinitionStore;
use crate::config::{Config, OnError};
use crate::error::{Error, Result};
use crate::transport;

/// Randomized slack subtracted from the poll interval so fleets of clients
/// do not synchronize their fetches.
const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(3);

pub(crate) enum FetchOutcome {
    Updated(FlagDefinitions),
    NotModified,
    Failed { status: i32, message: String },
}

/// HTTP client for the local-evaluation endpoint, with ETag revalidation.
pub(crate) struct DefinitionsFetcher {
    runtime: tokio::runtime::Runtime,
    client: reqwest::Client,
    endpoint: Url,
    personal_api_key: String,
    etag: Option<String>,
}

impl DefinitionsFetcher {
    pub fn new(config: &Config, personal_api_key: &str) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let client = reqwest::Client::builder()
            .timeout(config.feature_flag_request_timeout)
            .danger_accept_invalid_certs(config.skip_tls_verification)
            .build()?;
        let endpoint = Url::parse_with_params(
            &format!(
                "{}/api/feature_flag/local_evaluation/",
                config.host.trim_end_matches('/')
            ),
            &[("token", config.api_key.as_str()), ("send_cohorts", "true")],
        )
        .map_err(Error::InvalidHost)?;
        Ok(DefinitionsFetcher {
            runtime,
            client,
            endpoint,
            personal_api_key: personal_api_key.to_owned(),
            etag: None,
        })
    }

    pub fn fetch(&mut self) -> FetchOutcome {
        log::debug!(target: "posthog", "fetching flag definitions");
        let mut request = self
            .client
            .get(self.endpoint.clone())
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, transport::user_agent())
            .header(
                AUTHORIZATION,
                format!("Bearer {}", self.personal_api_key),
            );
        if let Some(etag) = &self.etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = match self.runtime.block_on(async move { request.send().await }) {
            Ok(response) => response,
            Err(err) => {
                return FetchOutcome::Failed {
                    status: -1,
                    message: format!("flag definitions request failed: {err}"),
                }
            }
        };

        let status = response.status();
        match status {
            StatusCode::OK => {
                let etag = response
                    .headers()
                    .get(ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                let body = match self.runtime.block_on(async move { response.text().await }) {
                    Ok(body) => body,
                    Err(err) => {
                        return FetchOutcome::Failed {
                            status: -1,
                            message: format!("cannot read flag definitions: {err}"),
                        }
                    }
                };
                match serde_json::from_str::<LocalEvaluationResponse>(&body) {
                    Ok(parsed) => {
                        self.etag = etag;
                        log::debug!(target: "posthog", "flag definitions updated");
                        FetchOutcome::Updated(parsed.into())
                    }
                    Err(err) => FetchOutcome::Failed {
                        status: -1,
                        message: format!("cannot parse flag definitions: {err}"),
                    },
                }
            }
            StatusCode::NOT_MODIFIED => FetchOutcome::NotModified,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchOutcome::Failed {
                status: status.as_u16() as i32,
                message: "flag definitions request unauthorized, check your personal api key"
                    .to_owned(),
            },
            StatusCode::PAYMENT_REQUIRED => FetchOutcome::Failed {
                status: 402,
                message: "feature flags quota limited, skipping definitions update".to_owned(),
            },
            other => FetchOutcome::Failed {
                status: other.as_u16() as i32,
                message: format!("flag definitions request returned HTTP {other}"),
            },
        }
    }
}

/// The definitions poller thread.
pub(crate) struct DefinitionsPoller {
    fetcher: Arc<Mutex<DefinitionsFetcher>>,
    store: Arc<FlagDefinitionStore>,
    on_error: Option<OnError>,
    stop_sender: SyncSender<()>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl DefinitionsPoller {
    /// Start the poller thread. Blocks until the first fetch attempt has
    /// completed (successfully or not) so callers immediately after see
    /// whatever the server answered.
    pub fn start(
        fetcher: DefinitionsFetcher,
        store: Arc<FlagDefinitionStore>,
        interval: Duration,
        on_error: Option<OnError>,
    ) -> std::io::Result<DefinitionsPoller> {
        // Buffer of 1 is enough: one stop command stops the thread, and
        // try_send ignores the case where another thread already sent one.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);
        let fetcher = Arc::new(Mutex::new(fetcher));
        let running = Arc::new(AtomicBool::new(true));
        let first_fetch = Arc::new((Mutex::new(false), Condvar::new()));

        let join_handle = {
            let fetcher = Arc::clone(&fetcher);
            let store = Arc::clone(&store);
            let on_error = on_error.clone();
            let running = Arc::clone(&running);
            let first_fetch = Arc::clone(&first_fetch);

            std::thread::Builder::new()
                .name("posthog-poller".to_owned())
                .spawn(move || {
                    let result = std::panic::catch_unwind(AssertUnwindSafe(|| loop {
                        poll_cycle(&fetcher, &store, &on_error);

                        {
                            let (done, condvar) = &*first_fetch;
                            let mut done = done.lock().expect("first-fetch lock");
                            if !*done {
                                *done = true;
                                condvar.notify_all();
                            }
                        }

                        match stop_receiver.recv_timeout(jitter(interval)) {
                            Err(RecvTimeoutError::Timeout) => {
                                // Timed out. Loop back to fetch again.
                            }
                            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                                log::debug!(target: "posthog", "poller thread stopping");
                                return;
                            }
                        }
                    }));
                    if result.is_err() {
                        log::error!(target: "posthog", "poller thread panicked");
                    }
                    running.store(false, Ordering::SeqCst);
                })?
        };

        // First fetch is synchronous from the caller's perspective.
        {
            let (done, condvar) = &*first_fetch;
            let mut done = done.lock().expect("first-fetch lock");
            while !*done {
                done = condvar.wait(done).expect("first-fetch lock");
            }
        }

        Ok(DefinitionsPoller {
            fetcher,
            store,
            on_error,
            stop_sender,
            join_handle: Mutex::new(Some(join_handle)),
            running,
        })
    }

    /// Fetch once on the calling thread; used for manual refreshes.
    pub fn poll_once(&self) {
        poll_cycle(&self.fetcher, &self.store, &self.on_error);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the poller thread and block until it exits. Idempotent.
    pub fn stop(&self) {
        // Error means the thread already exited or a stop is pending;
        // both are fine.
        let _ = self.stop_sender.try_send(());
        let handle = self
            .join_handle
            .lock()
            .expect("join-handle lock")
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!(target: "posthog", "poller thread panicked during shutdown");
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

fn poll_cycle(
    fetcher: &Arc<Mutex<DefinitionsFetcher>>,
    store: &Arc<FlagDefinitionStore>,
    on_error: &Option<OnError>,
) {
    let outcome = fetcher.lock().expect("fetcher lock").fetch();
    match outcome {
        FetchOutcome::Updated(definitions) => store.set(definitions),
        FetchOutcome::NotModified => {
            log::debug!(target: "posthog", "flag definitions unchanged");
        }
        FetchOutcome::Failed { status, message } => {
            log::warn!(target: "posthog", "{message}");
            if let Some(on_error) = on_error {
                on_error(status, &message);
            }
        }
    }
}

/// Apply randomized subtractive jitter to `interval`.
fn jitter(interval: Duration) -> Duration {
    let jitter = DEFAULT_POLL_JITTER.min(interval / 2);
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use serde_json::json;

    use super::*;
    use crate::testutil::{ScriptedResponse, ScriptedServer};

    fn definitions_body() -> String {
        json!({
            "flags": [
                {"key": "beta", "active": true, "filters": {"groups": [
                    {"rollout_percentage": 100}
                ]}}
            ],
            "cohorts": {},
            "group_type_mapping": {}
        })
        .to_string()
    }

    fn config_for(url: &str) -> Config {
        Config::from_api_key("phc_test")
            .host(url.to_owned())
            .personal_api_key("phx_personal")
            .feature_flag_poll_interval(Duration::from_secs(60))
    }

    fn error_sink() -> (Arc<StdMutex<Vec<(i32, String)>>>, OnError) {
        let errors = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let on_error: OnError = Arc::new(move |status, msg: &str| {
            sink.lock().unwrap().push((status, msg.to_owned()));
        });
        (errors, on_error)
    }

    #[test]
    fn first_fetch_is_synchronous_and_populates_store() {
        let server = ScriptedServer::start(vec![
            ScriptedResponse::new(200).body(&definitions_body())
        ]);
        let config = config_for(&server.url);
        let fetcher = DefinitionsFetcher::new(&config, "phx_personal").unwrap();
        let store = Arc::new(FlagDefinitionStore::new());

        let poller = DefinitionsPoller::start(
            fetcher,
            store.clone(),
            config.feature_flag_poll_interval,
            None,
        )
        .unwrap();

        // No sleep: the store is already populated when start() returns.
        assert!(store.loaded());
        assert!(store.get().unwrap().flags_by_key.contains_key("beta"));
        assert!(poller.is_running());

        let requests = server.join();
        assert_eq!(requests[0].method, "GET");
        assert!(requests[0].path.starts_with("/api/feature_flag/local_evaluation/"));
        assert!(requests[0].path.contains("token=phc_test"));
        assert!(requests[0].path.contains("send_cohorts"));
        assert_eq!(
            requests[0].header("authorization"),
            Some("Bearer phx_personal")
        );

        poller.stop();
        assert!(!poller.is_running());
    }

    #[test]
    fn etag_revalidation_keeps_cache_on_304() {
        let server = ScriptedServer::start(vec![
            ScriptedResponse::new(200)
                .header("ETag", "\"v1\"")
                .body(&definitions_body()),
            ScriptedResponse::new(304),
            ScriptedResponse::new(304),
            ScriptedResponse::new(200).body(
                &json!({
                    "flags": [
                        {"key": "gamma", "active": true, "filters": {"groups": []}}
                    ]
                })
                .to_string(),
            ),
        ]);
        let config = config_for(&server.url);
        let fetcher = DefinitionsFetcher::new(&config, "phx_personal").unwrap();
        let store = Arc::new(FlagDefinitionStore::new());
        let poller = DefinitionsPoller::start(
            fetcher,
            store.clone(),
            config.feature_flag_poll_interval,
            None,
        )
        .unwrap();

        let snapshot = store.get().unwrap();

        // Two 304s: cache object is untouched.
        poller.poll_once();
        poller.poll_once();
        assert!(Arc::ptr_eq(&snapshot, &store.get().unwrap()));

        // A fresh 200 replaces it.
        poller.poll_once();
        let updated = store.get().unwrap();
        assert!(!Arc::ptr_eq(&snapshot, &updated));
        assert!(updated.flags_by_key.contains_key("gamma"));

        let requests = server.join();
        assert_eq!(requests.len(), 4);
        assert_eq!(requests[0].header("if-none-match"), None);
        assert_eq!(requests[1].header("if-none-match"), Some("\"v1\""));
        assert_eq!(requests[2].header("if-none-match"), Some("\"v1\""));

        poller.stop();
    }

    #[test]
    fn unauthorized_reports_and_keeps_polling() {
        let server = ScriptedServer::start(vec![ScriptedResponse::new(401)]);
        let config = config_for(&server.url);
        let fetcher = DefinitionsFetcher::new(&config, "phx_personal").unwrap();
        let store = Arc::new(FlagDefinitionStore::new());
        let (errors, on_error) = error_sink();

        let poller = DefinitionsPoller::start(
            fetcher,
            store.clone(),
            config.feature_flag_poll_interval,
            Some(on_error),
        )
        .unwrap();

        assert!(!store.loaded());
        assert_eq!(errors.lock().unwrap()[0].0, 401);
        // The cycle was skipped, not the poller.
        assert!(poller.is_running());
        poller.stop();
    }

    #[test]
    fn quota_limit_reports_402() {
        let server = ScriptedServer::start(vec![ScriptedResponse::new(402)]);
        let config = config_for(&server.url);
        let fetcher = DefinitionsFetcher::new(&config, "phx_personal").unwrap();
        let store = Arc::new(FlagDefinitionStore::new());
        let (errors, on_error) = error_sink();

        let poller = DefinitionsPoller::start(
            fetcher,
            store,
            config.feature_flag_poll_interval,
            Some(on_error),
        )
        .unwrap();
        assert_eq!(errors.lock().unwrap()[0].0, 402);
        poller.stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let server = ScriptedServer::start(vec![
            ScriptedResponse::new(200).body(&definitions_body())
        ]);
        let config = config_for(&server.url);
        let fetcher = DefinitionsFetcher::new(&config, "phx_personal").unwrap();
        let store = Arc::new(FlagDefinitionStore::new());
        let poller = DefinitionsPoller::start(
            fetcher,
            store,
            config.feature_flag_poll_interval,
            None,
        )
        .unwrap();

        poller.stop();
        poller.stop();
        assert!(!poller.is_running());
        server.join();
    }

    #[test]
    fn jitter_is_subtractive() {
        let interval = Duration::from_secs(30);
        for _ in 0..20 {
            let result = jitter(interval);
            assert!(result <= interval, "{result:?} must be <= {interval:?}");
            assert!(result >= interval - DEFAULT_POLL_JITTER);
        }
    }
}
