//! Routing layer for flag queries: local evaluation when definitions are
//! cached, remote fallback otherwise, plus deduplicated tracking of
//! `$feature_flag_called` telemetry.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use super::eval::LocalEvaluator;
use super::models::{FlagResult, FlagValue};
use super::remote::RemoteEvaluator;
use super::store::FlagDefinitionStore;
use crate::config::Config;
use crate::error::Result;
use crate::message::{self, Properties};

/// Per-query options for the flag surface.
#[derive(Debug, Clone)]
pub struct FlagOptions {
    /// Group keys by group type, for group-based flags.
    pub groups: HashMap<String, String>,
    pub person_properties: Properties,
    pub group_properties: HashMap<String, Properties>,
    /// Never fall back to the decide endpoint.
    pub only_evaluate_locally: bool,
    /// Record a `$feature_flag_called` event for this query.
    pub send_feature_flag_events: bool,
}

impl Default for FlagOptions {
    fn default() -> Self {
        FlagOptions {
            groups: HashMap::new(),
            person_properties: Properties::new(),
            group_properties: HashMap::new(),
            only_evaluate_locally: false,
            send_feature_flag_events: true,
        }
    }
}

/// One pending `$feature_flag_called` event.
#[derive(Debug, Clone)]
pub(crate) struct FlagCallEvent {
    pub distinct_id: String,
    pub key: String,
    pub result: FlagResult,
    pub evaluated_at: String,
}

#[derive(Default)]
struct CallTracker {
    /// Keys already reported over the client's lifetime.
    seen: HashSet<(String, String, String)>,
    pending: Vec<FlagCallEvent>,
}

pub(crate) struct FeatureFlags {
    local_evaluation_configured: bool,
    store: Arc<FlagDefinitionStore>,
    evaluator: LocalEvaluator,
    remote: RemoteEvaluator,
    calls: Mutex<CallTracker>,
}

impl FeatureFlags {
    pub fn new(config: &Config, store: Arc<FlagDefinitionStore>) -> Result<Self> {
        Ok(FeatureFlags {
            local_evaluation_configured: config.personal_api_key.is_some(),
            evaluator: LocalEvaluator::new(store.clone()),
            store,
            remote: RemoteEvaluator::new(config)?,
            calls: Mutex::new(CallTracker::default()),
        })
    }

    /// Local evaluation is usable once a personal API key is configured
    /// and definitions have been fetched.
    pub fn local_evaluation_enabled(&self) -> bool {
        self.local_evaluation_configured && self.store.loaded()
    }

    /// Decide one flag, local first, remote as fallback. `None` when no
    /// decision could be produced.
    pub fn flag_result(
        &self,
        key: &str,
        distinct_id: &str,
        options: &FlagOptions,
    ) -> Option<FlagResult> {
        let mut result = None;
        if self.local_evaluation_enabled() {
            match self.evaluator.evaluate(
                key,
                distinct_id,
                &options.groups,
                &options.person_properties,
                &options.group_properties,
            ) {
                Ok(local) if local.is_conclusive() => result = Some(local),
                Ok(_) => {}
                Err(err) => {
                    log::debug!(target: "posthog", "flag {key} falls back to remote: {err}");
                }
            }
        }

        if result.is_none() {
            if options.only_evaluate_locally {
                return None;
            }
            let response = self.remote.fetch(
                distinct_id,
                &options.groups,
                &options.person_properties,
                &options.group_properties,
            )?;
            result = response.flag_result(key);
        }

        let result = result?;
        if options.send_feature_flag_events {
            self.track_call(distinct_id, key, &result);
        }
        Some(result)
    }

    /// Decide every known flag. Falls back to one remote call when local
    /// evaluation is unavailable or any flag is inconclusive.
    pub fn all_flag_results(
        &self,
        distinct_id: &str,
        options: &FlagOptions,
    ) -> HashMap<String, FlagResult> {
        let mut results = HashMap::new();
        let mut fallback = !self.local_evaluation_enabled();

        if !fallback {
            if let Some(definitions) = self.store.get() {
                for key in definitions.flags_by_key.keys() {
                    match self.evaluator.evaluate(
                        key,
                        distinct_id,
                        &options.groups,
                        &options.person_properties,
                        &options.group_properties,
                    ) {
                        Ok(local) if local.is_conclusive() => {
                            results.insert(key.clone(), local);
                        }
                        _ => fallback = true,
                    }
                }
            }
        }

        if fallback && !options.only_evaluate_locally {
            if let Some(response) = self.remote.fetch(
                distinct_id,
                &options.groups,
                &options.person_properties,
                &options.group_properties,
            ) {
                if response.errors_while_computing_flags {
                    log::debug!(
                        target: "posthog",
                        "server reported errors while computing flags"
                    );
                }
                let payloads = response.all_payloads();
                for (key, value) in response.all_values() {
                    let payload = payloads.get(&key).cloned();
                    results.insert(
                        key,
                        FlagResult {
                            value: Some(value),
                            payload,
                            request_id: response.request_id.clone(),
                            locally_evaluated: false,
                            ..FlagResult::default()
                        },
                    );
                }
            }
        }

        results
    }

    /// Record a decided flag call, deduplicated per
    /// `(distinct_id, key, value)` over the client's lifetime.
    fn track_call(&self, distinct_id: &str, key: &str, result: &FlagResult) {
        let value_key = result
            .value
            .as_ref()
            .map(FlagValue::payload_key)
            .unwrap_or_else(|| "null".to_owned());
        let dedup_key = (distinct_id.to_owned(), key.to_owned(), value_key);
        let mut calls = self.calls.lock().expect("flag-call lock");
        if calls.seen.contains(&dedup_key) {
            return;
        }
        calls.seen.insert(dedup_key);
        calls.pending.push(FlagCallEvent {
            distinct_id: distinct_id.to_owned(),
            key: key.to_owned(),
            result: result.clone(),
            evaluated_at: message::utc_timestamp(),
        });
    }

    /// Drain the pending call events. The dedup set is retained so the
    /// same call is never reported twice.
    pub fn flush_flag_call_events(&self) -> Vec<FlagCallEvent> {
        let mut calls = self.calls.lock().expect("flag-call lock");
        std::mem::take(&mut calls.pending)
    }
}

/// Properties of a `$feature_flag_called` event.
pub(crate) fn flag_called_properties(event: &FlagCallEvent) -> Properties {
    let mut properties = Properties::new();
    let value = event
        .result
        .value
        .as_ref()
        .map(FlagValue::to_json)
        .unwrap_or(Value::Null);
    properties.insert("$feature_flag".to_owned(), event.key.clone().into());
    properties.insert("$feature_flag_response".to_owned(), value.clone());
    properties.insert(format!("$feature/{}", event.key), value);
    properties.insert(
        "locally_evaluated".to_owned(),
        event.result.locally_evaluated.into(),
    );
    properties.insert(
        "$feature_flag_evaluated_at".to_owned(),
        event.evaluated_at.clone().into(),
    );
    if let Some(payload) = &event.result.payload {
        properties.insert("$feature_flag_payload".to_owned(), payload.clone());
    }
    if let Some(request_id) = &event.result.request_id {
        properties.insert(
            "$feature_flag_request_id".to_owned(),
            request_id.clone().into(),
        );
    }
    if let Some(reason) = &event.result.reason {
        properties.insert("$feature_flag_reason".to_owned(), reason.clone().into());
    }
    if let Some(version) = event.result.flag_version {
        properties.insert("$feature_flag_version".to_owned(), version.into());
    }
    if let Some(id) = event.result.flag_id {
        properties.insert("$feature_flag_id".to_owned(), id.into());
    }
    properties
}
