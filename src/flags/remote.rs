//! Remote flag evaluation against the decide endpoint. Used when local
//! evaluation is unavailable or inconclusive.

use std::collections::HashMap;

use reqwest::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::eval::normalize_payload;
use super::models::{FlagResult, FlagValue};
use crate::config::{Config, OnError};
use crate::error::{Error, Result};
use crate::message::Properties;
use crate::transport;

#[derive(Serialize)]
struct DecideRequest<'a> {
    api_key: &'a str,
    distinct_id: &'a str,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    groups: &'a HashMap<String, String>,
    #[serde(skip_serializing_if = "Properties::is_empty")]
    person_properties: &'a Properties,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    group_properties: &'a HashMap<String, Properties>,
    geoip_disable: bool,
}

/// `quotaLimited` arrives either as a plain flag or as a list of limited
/// scopes.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum QuotaLimited {
    Flag(bool),
    Scopes(Vec<String>),
}

impl QuotaLimited {
    fn limits_feature_flags(&self) -> bool {
        match self {
            QuotaLimited::Flag(limited) => *limited,
            QuotaLimited::Scopes(scopes) => scopes.iter().any(|s| s == "feature_flags"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct RemoteFlagReason {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct RemoteFlagMetadata {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default)]
    pub payload: Option<Value>,
}

/// One entry of the v2 `flags` map.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RemoteFlag {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub reason: Option<RemoteFlagReason>,
    #[serde(default)]
    pub metadata: Option<RemoteFlagMetadata>,
}

impl RemoteFlag {
    fn value(&self) -> FlagValue {
        if !self.enabled {
            return FlagValue::Bool(false);
        }
        match &self.variant {
            Some(variant) => FlagValue::Variant(variant.clone()),
            None => FlagValue::Bool(true),
        }
    }
}

/// Decide-endpoint response. The v2 `flags` map takes precedence over the
/// legacy `featureFlags` + `featureFlagPayloads` pair when both appear.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct FlagsResponse {
    #[serde(default)]
    pub flags: HashMap<String, RemoteFlag>,
    #[serde(default, rename = "featureFlags")]
    pub feature_flags: HashMap<String, FlagValue>,
    #[serde(default, rename = "featureFlagPayloads")]
    pub feature_flag_payloads: HashMap<String, Value>,
    #[serde(default, rename = "errorsWhileComputingFlags")]
    pub errors_while_computing_flags: bool,
    #[serde(default, rename = "quotaLimited")]
    pub quota_limited: Option<QuotaLimited>,
    #[serde(default, rename = "requestId")]
    pub request_id: Option<String>,
}

impl FlagsResponse {
    fn quota_limited_response() -> Self {
        FlagsResponse {
            quota_limited: Some(QuotaLimited::Flag(true)),
            ..FlagsResponse::default()
        }
    }

    pub fn is_quota_limited(&self) -> bool {
        self.quota_limited
            .as_ref()
            .is_some_and(QuotaLimited::limits_feature_flags)
    }

    /// Per-key result. `None` when the response does not mention the key.
    pub fn flag_result(&self, key: &str) -> Option<FlagResult> {
        if self.is_quota_limited() {
            return None;
        }
        if !self.flags.is_empty() {
            let flag = self.flags.get(key)?;
            let value = flag.value();
            return Some(FlagResult {
                payload: flag
                    .metadata
                    .as_ref()
                    .and_then(|m| m.payload.as_ref())
                    .map(normalize_payload),
                reason: flag
                    .reason
                    .as_ref()
                    .and_then(|r| r.description.clone().or_else(|| r.code.clone())),
                flag_id: flag.metadata.as_ref().and_then(|m| m.id),
                flag_version: flag.metadata.as_ref().and_then(|m| m.version),
                request_id: self.request_id.clone(),
                locally_evaluated: false,
                value: Some(value),
            });
        }
        let value = self.feature_flags.get(key)?.clone();
        Some(FlagResult {
            payload: self.feature_flag_payloads.get(key).map(normalize_payload),
            reason: None,
            flag_id: None,
            flag_version: None,
            request_id: self.request_id.clone(),
            locally_evaluated: false,
            value: Some(value),
        })
    }

    /// All decided values keyed by flag.
    pub fn all_values(&self) -> HashMap<String, FlagValue> {
        if self.is_quota_limited() {
            return HashMap::new();
        }
        if !self.flags.is_empty() {
            return self
                .flags
                .iter()
                .map(|(key, flag)| (key.clone(), flag.value()))
                .collect();
        }
        self.feature_flags.clone()
    }

    /// All payloads keyed by flag, JSON-decoded where applicable.
    pub fn all_payloads(&self) -> HashMap<String, Value> {
        if self.is_quota_limited() {
            return HashMap::new();
        }
        if !self.flags.is_empty() {
            return self
                .flags
                .iter()
                .filter_map(|(key, flag)| {
                    let payload = flag.metadata.as_ref()?.payload.as_ref()?;
                    Some((key.clone(), normalize_payload(payload)))
                })
                .collect();
        }
        self.feature_flag_payloads
            .iter()
            .map(|(key, payload)| (key.clone(), normalize_payload(payload)))
            .collect()
    }
}

pub(crate) struct RemoteEvaluator {
    runtime: tokio::runtime::Runtime,
    client: reqwest::Client,
    endpoint: Url,
    api_key: String,
    on_error: Option<OnError>,
}

impl RemoteEvaluator {
    pub fn new(config: &Config) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let client = reqwest::Client::builder()
            .timeout(config.feature_flag_request_timeout)
            .danger_accept_invalid_certs(config.skip_tls_verification)
            .build()?;
        let endpoint = Url::parse(&format!(
            "{}/flags?v=2",
            config.host.trim_end_matches('/')
        ))
        .map_err(Error::InvalidHost)?;
        Ok(RemoteEvaluator {
            runtime,
            client,
            endpoint,
            api_key: config.api_key.clone(),
            on_error: config.on_error.clone(),
        })
    }

    fn report(&self, status: i32, message: &str) {
        log::warn!(target: "posthog", "{message}");
        if let Some(on_error) = &self.on_error {
            on_error(status, message);
        }
    }

    /// POST the subject context to the decide endpoint. Failures are
    /// reported through `on_error` and surface as `None`.
    pub fn fetch(
        &self,
        distinct_id: &str,
        groups: &HashMap<String, String>,
        person_properties: &Properties,
        group_properties: &HashMap<String, Properties>,
    ) -> Option<FlagsResponse> {
        let request = DecideRequest {
            api_key: &self.api_key,
            distinct_id,
            groups,
            person_properties,
            group_properties,
            geoip_disable: true,
        };
        let result = self.runtime.block_on(async {
            self.client
                .post(self.endpoint.clone())
                .header(CONTENT_TYPE, "application/json")
                .header(ACCEPT, "application/json")
                .header(USER_AGENT, transport::user_agent())
                .json(&request)
                .send()
                .await
        });

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                self.report(-1, &format!("flags request failed: {err}"));
                return None;
            }
        };

        let status = response.status().as_u16() as i32;
        match status {
            200..=299 => {
                let body = self.runtime.block_on(response.text()).ok()?;
                match serde_json::from_str::<FlagsResponse>(&body) {
                    Ok(parsed) => Some(parsed),
                    Err(err) => {
                        self.report(-1, &format!("cannot parse flags response: {err}"));
                        None
                    }
                }
            }
            402 => {
                self.report(
                    402,
                    "feature flags quota limited, resolving flags to null",
                );
                Some(FlagsResponse::quota_limited_response())
            }
            401 | 403 => {
                self.report(status, "flags request unauthorized, check your api key");
                None
            }
            _ => {
                self.report(status, &format!("flags request returned HTTP {status}"));
                None
            }
        }
    }
}
