use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::Value;

use crate::batch::{BatchAdd, MessageBatch};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::exception;
use crate::flags::{
    flag_called_properties, DefinitionsFetcher, DefinitionsPoller, FeatureFlags, FlagOptions,
    FlagValue,
};
use crate::message::{Message, Properties};
use crate::normalizer;
use crate::transport::{HttpTransport, Transport};
use crate::worker::{Control, Worker};

/// How often `flush` and `shutdown` re-check the queue state.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Optional inputs for [`Client::capture_with_options`].
#[derive(Debug, Clone, Default)]
pub struct CaptureOptions {
    pub properties: Properties,
    /// Group keys by group type; becomes the `$groups` property.
    pub groups: HashMap<String, String>,
    /// Flag values to attach as `$feature/<key>` properties.
    pub feature_variants: Properties,
    /// Caller-chosen event UUID. Ignored unless it is a canonical v4 UUID.
    pub uuid: Option<String>,
}

/// A client for the PostHog API.
///
/// The client owns a background worker thread that batches and delivers
/// events, and, when a personal API key is configured, a poller thread
/// that keeps flag definitions cached for local evaluation.
///
/// Public methods never panic and never return errors: failures surface as
/// `false`/`None` return values and through the configured `on_error`
/// callback.
///
/// # Examples
/// ```no_run
/// # use posthog_rust::{Client, Config};
/// let client = Client::new(Config::from_api_key("phc_key")).unwrap();
/// client.capture("user-1", "signup", Default::default());
/// client.shutdown();
/// ```
pub struct Client {
    config: Config,
    transport: Arc<dyn Transport>,
    message_sender: Option<SyncSender<Message>>,
    control_sender: Option<SyncSender<Control>>,
    queue_depth: Arc<AtomicUsize>,
    in_flight: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    flags: FeatureFlags,
    poller: Option<DefinitionsPoller>,
    shutdown: AtomicBool,
}

impl Client {
    /// Create a new `Client` using the specified configuration. Spawns the
    /// worker thread and, if a personal API key is configured, starts the
    /// definitions poller (whose first fetch completes before this
    /// returns).
    pub fn new(config: Config) -> Result<Client> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        Client::with_transport(config, transport)
    }

    fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Result<Client> {
        if config.api_key.trim().is_empty() {
            return Err(Error::InvalidConfig("api_key must be given".to_owned()));
        }

        let store = Arc::new(crate::flags::FlagDefinitionStore::new());
        let flags = FeatureFlags::new(&config, store.clone())?;
        let queue_depth = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicBool::new(false));

        let (message_sender, control_sender, worker_handle) = if config.async_mode {
            let (message_tx, message_rx) = sync_channel(config.max_queue_size);
            let (control_tx, control_rx) = sync_channel(4);
            let worker = Worker::new(
                message_rx,
                control_rx,
                transport.clone(),
                config.api_key.clone(),
                config.batch_size,
                queue_depth.clone(),
                in_flight.clone(),
                config.on_error.clone(),
            );
            let handle = worker.spawn()?;
            (Some(message_tx), Some(control_tx), Some(handle))
        } else {
            (None, None, None)
        };

        let poller = match &config.personal_api_key {
            Some(personal_api_key) => {
                let fetcher = DefinitionsFetcher::new(&config, personal_api_key)?;
                Some(DefinitionsPoller::start(
                    fetcher,
                    store,
                    config.feature_flag_poll_interval,
                    config.on_error.clone(),
                )?)
            }
            None => None,
        };

        Ok(Client {
            config,
            transport,
            message_sender,
            control_sender,
            queue_depth,
            in_flight,
            worker: Mutex::new(worker_handle),
            flags,
            poller,
            shutdown: AtomicBool::new(false),
        })
    }

    // Ingestion ----------------------------------------------------------

    /// Capture an event. Returns `false` when the message was rejected or
    /// dropped (validation failure, full queue, `before_send` veto).
    pub fn capture(&self, distinct_id: &str, event: &str, properties: Properties) -> bool {
        self.capture_with_options(
            distinct_id,
            event,
            CaptureOptions {
                properties,
                ..CaptureOptions::default()
            },
        )
    }

    /// Capture an event with groups, feature-flag annotations, or a caller
    /// UUID.
    pub fn capture_with_options(
        &self,
        distinct_id: &str,
        event: &str,
        options: CaptureOptions,
    ) -> bool {
        match normalizer::capture(
            distinct_id,
            event,
            options.properties,
            &options.groups,
            &options.feature_variants,
            options.uuid.as_deref(),
        ) {
            Ok(message) => self.deliver(message),
            Err(err) => self.report_rejected(err),
        }
    }

    /// Set person properties for a distinct id.
    pub fn identify(&self, distinct_id: &str, properties: Properties) -> bool {
        match normalizer::identify(distinct_id, properties, None) {
            Ok(message) => self.deliver(message),
            Err(err) => self.report_rejected(err),
        }
    }

    /// Link an anonymous id to a distinct id.
    pub fn alias(&self, distinct_id: &str, alias: &str) -> bool {
        match normalizer::alias(distinct_id, alias, None) {
            Ok(message) => self.deliver(message),
            Err(err) => self.report_rejected(err),
        }
    }

    /// Set properties on a group.
    pub fn group_identify(
        &self,
        group_type: &str,
        group_key: &str,
        properties: Properties,
    ) -> bool {
        match normalizer::group_identify(group_type, group_key, properties, None, None) {
            Ok(message) => self.deliver(message),
            Err(err) => self.report_rejected(err),
        }
    }

    /// Capture an error with the current stack trace.
    pub fn capture_exception<E: std::error::Error>(
        &self,
        distinct_id: &str,
        error: &E,
    ) -> bool {
        let backtrace = std::backtrace::Backtrace::force_capture();
        let exception_type = exception::short_type_name(std::any::type_name::<E>());
        let properties = exception::error_properties(
            exception_type,
            &error.to_string(),
            &backtrace.to_string(),
        );
        match normalizer::exception(distinct_id, properties, None) {
            Ok(message) => self.deliver(message),
            Err(err) => self.report_rejected(err),
        }
    }

    /// Capture a synthetic exception from a plain message. Carries no
    /// stack trace.
    pub fn capture_exception_message(&self, distinct_id: &str, message: &str) -> bool {
        let properties = exception::message_properties(message);
        match normalizer::exception(distinct_id, properties, None) {
            Ok(message) => self.deliver(message),
            Err(err) => self.report_rejected(err),
        }
    }

    // Feature flags ------------------------------------------------------

    /// Whether a flag is enabled for the subject. `None` when no decision
    /// could be produced.
    pub fn flag_enabled(
        &self,
        key: &str,
        distinct_id: &str,
        options: &FlagOptions,
    ) -> Option<bool> {
        self.flag_value(key, distinct_id, options)
            .map(|value| value.is_enabled())
    }

    /// The flag's value for the subject: `true`/`false` or a variant key.
    pub fn flag_value(
        &self,
        key: &str,
        distinct_id: &str,
        options: &FlagOptions,
    ) -> Option<FlagValue> {
        self.flags
            .flag_result(key, distinct_id, options)
            .and_then(|result| result.value)
    }

    /// The payload attached to the flag's decided value.
    pub fn flag_payload(
        &self,
        key: &str,
        distinct_id: &str,
        options: &FlagOptions,
    ) -> Option<Value> {
        self.flags
            .flag_result(key, distinct_id, options)
            .and_then(|result| result.payload)
    }

    /// All decided flag values for the subject.
    pub fn all_flags(
        &self,
        distinct_id: &str,
        options: &FlagOptions,
    ) -> HashMap<String, FlagValue> {
        self.flags
            .all_flag_results(distinct_id, options)
            .into_iter()
            .filter_map(|(key, result)| result.value.map(|value| (key, value)))
            .collect()
    }

    /// All decided flag values and payloads for the subject.
    pub fn all_flags_and_payloads(
        &self,
        distinct_id: &str,
        options: &FlagOptions,
    ) -> (HashMap<String, FlagValue>, HashMap<String, Value>) {
        let results = self.flags.all_flag_results(distinct_id, options);
        let mut values = HashMap::new();
        let mut payloads = HashMap::new();
        for (key, result) in results {
            if let Some(payload) = result.payload {
                payloads.insert(key.clone(), payload);
            }
            if let Some(value) = result.value {
                values.insert(key, value);
            }
        }
        (values, payloads)
    }

    /// Refresh the cached flag definitions immediately. Returns `false`
    /// when no poller is running (no personal API key configured).
    pub fn reload_feature_flags(&self) -> bool {
        match &self.poller {
            Some(poller) => {
                poller.poll_once();
                true
            }
            None => false,
        }
    }

    /// `true` once a personal API key is configured and definitions are
    /// cached.
    pub fn local_evaluation_enabled(&self) -> bool {
        self.flags.local_evaluation_enabled()
    }

    // Lifecycle ----------------------------------------------------------

    /// Number of messages waiting in the queue.
    pub fn queue_size(&self) -> usize {
        self.queue_depth.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Block until the queue is drained and no request is in flight.
    pub fn flush(&self) {
        if let Some(control) = &self.control_sender {
            let _ = control.try_send(Control::Flush);
        }
        while self.queue_size() > 0 || self.in_flight.load(Ordering::SeqCst) {
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    /// Flush pending flag-called telemetry, drain the queue, stop the
    /// worker and poller, and close the transport. Idempotent; the second
    /// call is a no-op.
    pub fn shutdown(&self) {
        // Pending $feature_flag_called events go through the normal
        // pipeline ahead of the shutdown command.
        for event in self.flags.flush_flag_call_events() {
            let properties = flag_called_properties(&event);
            match normalizer::capture(
                &event.distinct_id,
                "$feature_flag_called",
                properties,
                &HashMap::new(),
                &Properties::new(),
                None,
            ) {
                Ok(message) => {
                    self.deliver(message);
                }
                Err(err) => {
                    self.report_rejected(err);
                }
            }
        }

        self.shutdown.store(true, Ordering::SeqCst);

        if let Some(control) = &self.control_sender {
            // An error means the worker is already gone.
            let _ = control.send(Control::Shutdown);
        }
        let handle = self.worker.lock().expect("worker handle lock").take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!(target: "posthog", "worker thread panicked during shutdown");
            }
        }
        self.transport.shutdown();
        if let Some(poller) = &self.poller {
            poller.stop();
        }
    }

    // Internals ----------------------------------------------------------

    fn report_rejected(&self, err: Error) -> bool {
        self.report_error(-1, &err.to_string());
        false
    }

    fn report_error(&self, status: i32, message: &str) {
        log::warn!(target: "posthog", "{message}");
        if let Some(on_error) = &self.config.on_error {
            on_error(status, message);
        }
    }

    /// Run the `before_send` hook and route the message to the queue or
    /// the transport.
    fn deliver(&self, message: Message) -> bool {
        if self.is_shutdown() {
            self.report_error(-1, "client is shut down");
            return false;
        }

        let message = match &self.config.before_send {
            Some(before_send) => match before_send(message) {
                // The hook's return value is authoritative: None drops,
                // Some replaces.
                Some(replacement) => replacement,
                None => {
                    log::debug!(target: "posthog", "message dropped by before_send");
                    return false;
                }
            },
            None => message,
        };

        if self.config.test_mode {
            return true;
        }

        match &self.message_sender {
            Some(sender) => self.enqueue(sender, message),
            None => self.send_now(message),
        }
    }

    /// Non-blocking enqueue with drop-newest overflow.
    fn enqueue(&self, sender: &SyncSender<Message>, message: Message) -> bool {
        if self.queue_size() >= self.config.max_queue_size {
            self.report_error(-1, "queue full");
            return false;
        }
        self.queue_depth.fetch_add(1, Ordering::SeqCst);
        if sender.try_send(message).is_err() {
            self.queue_depth.fetch_sub(1, Ordering::SeqCst);
            self.report_error(-1, "queue full");
            return false;
        }
        true
    }

    /// Synchronous delivery: a one-message batch on the caller's thread.
    fn send_now(&self, message: Message) -> bool {
        let mut batch = MessageBatch::new(1);
        match batch.add(&message) {
            BatchAdd::Added => {
                let response = self.transport.send_batch(&batch.payload(&self.config.api_key));
                if response.success() {
                    true
                } else {
                    self.report_error(response.status, &response.error_message());
                    false
                }
            }
            BatchAdd::MessageTooLarge { bytes } => {
                self.report_error(-1, &format!("message too large: {bytes} bytes"));
                false
            }
            BatchAdd::BatchFull => {
                self.report_error(-1, "message rejected by empty batch");
                false
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if !self.is_shutdown() {
            self.shutdown();
        }
    }
}
