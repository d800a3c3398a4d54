use std::sync::Arc;
use std::time::Duration;

use crate::message::Message;

/// Callback invoked whenever the client drops or fails to deliver a
/// message. The first argument is an HTTP status code, `-1` for failures
/// that never reached the network (validation errors, queue overflow).
pub type OnError = Arc<dyn Fn(i32, &str) + Send + Sync>;

/// Hook invoked with every normalized message before it enters the queue.
/// Returning `None` drops the message; returning `Some` replaces it.
pub type BeforeSend = Arc<dyn Fn(Message) -> Option<Message> + Send + Sync>;

/// Configuration for [`Client`](crate::Client). Immutable once the client
/// is constructed.
///
/// ```
/// # use posthog_rust::Config;
/// let config = Config::from_api_key("phc_test")
///     .host("https://eu.posthog.com")
///     .batch_size(50);
/// ```
pub struct Config {
    pub(crate) api_key: String,
    pub(crate) host: String,
    pub(crate) personal_api_key: Option<String>,
    pub(crate) max_queue_size: usize,
    pub(crate) batch_size: usize,
    pub(crate) request_timeout: Duration,
    pub(crate) skip_tls_verification: bool,
    pub(crate) async_mode: bool,
    pub(crate) test_mode: bool,
    pub(crate) max_retries: u32,
    pub(crate) feature_flag_poll_interval: Duration,
    pub(crate) feature_flag_request_timeout: Duration,
    pub(crate) on_error: Option<OnError>,
    pub(crate) before_send: Option<BeforeSend>,
}

impl Config {
    /// Default ingestion host.
    pub const DEFAULT_HOST: &'static str = "https://app.posthog.com";

    /// Create a default configuration using the specified project API key.
    pub fn from_api_key(api_key: impl Into<String>) -> Self {
        Config {
            api_key: api_key.into(),
            host: Config::DEFAULT_HOST.to_owned(),
            personal_api_key: None,
            max_queue_size: 10_000,
            batch_size: 100,
            request_timeout: Duration::from_secs(10),
            skip_tls_verification: false,
            async_mode: true,
            test_mode: false,
            max_retries: 10,
            feature_flag_poll_interval: Duration::from_secs(30),
            feature_flag_request_timeout: Duration::from_secs(3),
            on_error: None,
            before_send: None,
        }
    }

    /// Override the ingestion host. Clients should use the default setting
    /// in most cases.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the personal API key. Local flag evaluation is enabled iff a
    /// personal API key is present.
    pub fn personal_api_key(mut self, key: impl Into<String>) -> Self {
        self.personal_api_key = Some(key.into());
        self
    }

    /// Maximum number of messages held in the in-memory queue. New messages
    /// are dropped once the queue is full.
    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Maximum number of messages per delivery batch.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Read + connect timeout for ingestion requests.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Disable TLS certificate verification. Only useful against local test
    /// servers.
    pub fn skip_tls_verification(mut self, skip: bool) -> Self {
        self.skip_tls_verification = skip;
        self
    }

    /// When `false`, messages are delivered on the caller's thread instead
    /// of the background worker.
    pub fn async_mode(mut self, async_mode: bool) -> Self {
        self.async_mode = async_mode;
        self
    }

    /// When `true`, messages are validated and normalized but never sent.
    pub fn test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    /// Maximum delivery attempts per batch.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Interval between flag definition fetches.
    pub fn feature_flag_poll_interval(mut self, interval: Duration) -> Self {
        self.feature_flag_poll_interval = interval;
        self
    }

    /// Read + connect timeout for flag requests.
    pub fn feature_flag_request_timeout(mut self, timeout: Duration) -> Self {
        self.feature_flag_request_timeout = timeout;
        self
    }

    /// Set a callback invoked with `(status, message)` whenever a message
    /// is dropped or delivery fails.
    pub fn on_error(mut self, on_error: impl Fn(i32, &str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    /// Set a hook invoked with every normalized message before enqueueing.
    /// `None` drops the message; `Some` replaces it.
    pub fn before_send(
        mut self,
        before_send: impl Fn(Message) -> Option<Message> + Send + Sync + 'static,
    ) -> Self {
        self.before_send = Some(Arc::new(before_send));
        self
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("personal_api_key", &self.personal_api_key.is_some())
            .field("max_queue_size", &self.max_queue_size)
            .field("batch_size", &self.batch_size)
            .field("request_timeout", &self.request_timeout)
            .field("skip_tls_verification", &self.skip_tls_verification)
            .field("async_mode", &self.async_mode)
            .field("test_mode", &self.test_mode)
            .field("max_retries", &self.max_retries)
            .field("feature_flag_poll_interval", &self.feature_flag_poll_interval)
            .finish_non_exhaustive()
    }
}
