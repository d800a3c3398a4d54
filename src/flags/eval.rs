//! Deterministic local flag evaluation against the cached definitions.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use super::cohorts::match_condition;
use super::hasher::{self, Sha1Hasher};
use super::models::{
    FlagConditionGroup, FlagDefinition, FlagDefinitions, FlagResult, FlagValue,
};
use super::store::FlagDefinitionStore;
use super::FlagError;
use crate::message::Properties;

/// Shared state for one top-level evaluation. Flag dependencies resolved
/// along the way are cached here so the whole evaluation sees one
/// consistent set of answers.
pub(crate) struct EvalContext<'a> {
    pub definitions: &'a FlagDefinitions,
    /// The hashing subject: a distinct id, or a group key for group flags.
    pub subject: &'a str,
    /// The active property bag for this evaluation.
    pub properties: &'a Properties,
    pub hasher: &'a Sha1Hasher,
    flag_values: RefCell<HashMap<String, Option<FlagValue>>>,
}

impl<'a> EvalContext<'a> {
    pub fn new(
        definitions: &'a FlagDefinitions,
        subject: &'a str,
        properties: &'a Properties,
        hasher: &'a Sha1Hasher,
    ) -> Self {
        EvalContext {
            definitions,
            subject,
            properties,
            hasher,
            flag_values: RefCell::new(HashMap::new()),
        }
    }
}

/// Resolve a flag dependency within the current evaluation: same subject,
/// same property bag, no continuity gating. Inactive flags resolve to
/// `false`; a flag that matches nothing resolves to null.
pub(crate) fn resolve_flag_dependency(
    key: &str,
    ctx: &EvalContext,
) -> Result<Option<FlagValue>, FlagError> {
    if let Some(value) = ctx.flag_values.borrow().get(key).cloned() {
        return Ok(value);
    }
    let Some(flag) = ctx.definitions.flags_by_key.get(key) else {
        return Err(FlagError::Inconclusive(format!(
            "dependency flag {key} is not cached"
        )));
    };
    // In-progress marker: a definition cycle that slipped past the
    // dependency-chain sentinel resolves to null instead of recursing
    // forever.
    ctx.flag_values.borrow_mut().insert(key.to_owned(), None);
    let value = if !flag.active {
        Some(FlagValue::Bool(false))
    } else {
        match_flag_conditions(flag, ctx)?
    };
    ctx.flag_values
        .borrow_mut()
        .insert(key.to_owned(), value.clone());
    Ok(value)
}

/// Walk the flag's condition groups in declaration order. Returns the
/// matched value, `None` when no group matched, or the last inconclusive
/// error when one occurred and nothing matched.
pub(crate) fn match_flag_conditions(
    flag: &FlagDefinition,
    ctx: &EvalContext,
) -> Result<Option<FlagValue>, FlagError> {
    let mut last_inconclusive: Option<FlagError> = None;
    for group in &flag.filters.groups {
        match match_condition_group(flag, group, ctx) {
            Ok(true) => return Ok(Some(value_for_match(flag, group, ctx))),
            Ok(false) => {}
            Err(err @ FlagError::RequiresServerEvaluation) => return Err(err),
            Err(err) => last_inconclusive = Some(err),
        }
    }
    match last_inconclusive {
        Some(err) => Err(err),
        None => Ok(None),
    }
}

/// All of the group's conditions must match (AND), then the rollout gate
/// applies.
fn match_condition_group(
    flag: &FlagDefinition,
    group: &FlagConditionGroup,
    ctx: &EvalContext,
) -> Result<bool, FlagError> {
    for condition in &group.properties {
        if !match_condition(condition, ctx)? {
            return Ok(false);
        }
    }
    Ok(match group.rollout_percentage {
        Some(rollout) => hasher::in_rollout(ctx.hasher, &flag.key, ctx.subject, rollout),
        None => true,
    })
}

/// Value for a matched group: the group's variant override when it names a
/// declared variant, otherwise the hashed variant, otherwise `true`.
fn value_for_match(
    flag: &FlagDefinition,
    group: &FlagConditionGroup,
    ctx: &EvalContext,
) -> FlagValue {
    let variants = flag
        .filters
        .multivariate
        .as_ref()
        .map(|m| m.variants.as_slice())
        .unwrap_or_default();
    if let Some(override_key) = &group.variant {
        if variants.iter().any(|v| v.key == *override_key) {
            return FlagValue::Variant(override_key.clone());
        }
    }
    match hasher::matching_variant(ctx.hasher, &flag.key, ctx.subject, variants) {
        Some(variant) => FlagValue::Variant(variant),
        None => FlagValue::Bool(true),
    }
}

/// Payload attached to a decided value. A payload that is itself a
/// JSON-encoded string is unwrapped; anything unparseable stays a string.
pub(crate) fn payload_for(flag: &FlagDefinition, value: &FlagValue) -> Option<Value> {
    let payloads = flag.filters.payloads.as_ref()?;
    payloads.get(&value.payload_key()).map(normalize_payload)
}

pub(crate) fn normalize_payload(raw: &Value) -> Value {
    match raw {
        Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| raw.clone()),
        other => other.clone(),
    }
}

pub(crate) struct LocalEvaluator {
    store: Arc<FlagDefinitionStore>,
    hasher: Sha1Hasher,
}

impl LocalEvaluator {
    pub fn new(store: Arc<FlagDefinitionStore>) -> Self {
        LocalEvaluator {
            store,
            hasher: Sha1Hasher,
        }
    }

    /// Decide `key` for the given subject using cached definitions.
    ///
    /// Returns an inconclusive [`FlagResult`] (no value) when the flag is
    /// unknown or the answer cannot be determined locally, and
    /// [`FlagError::RequiresServerEvaluation`] when the definition demands
    /// the server.
    pub fn evaluate(
        &self,
        key: &str,
        distinct_id: &str,
        groups: &HashMap<String, String>,
        person_properties: &Properties,
        group_properties: &HashMap<String, Properties>,
    ) -> Result<FlagResult, FlagError> {
        let Some(definitions) = self.store.get() else {
            return Ok(inconclusive_result(key, "definitions not loaded"));
        };
        let Some(flag) = definitions.flags_by_key.get(key) else {
            return Ok(inconclusive_result(key, "flag not found in cache"));
        };

        if !flag.active {
            return Ok(decided(flag, FlagValue::Bool(false), "flag is inactive"));
        }
        if flag.ensure_experience_continuity == Some(true) {
            return Err(FlagError::RequiresServerEvaluation);
        }

        // Group flags hash on the group key and read the matching group's
        // properties; person flags use the caller's distinct id.
        let (subject, mut bag) = match flag.filters.aggregation_group_type_index {
            Some(index) => {
                let Some(group_type) = definitions.group_type_mapping.get(&index.to_string())
                else {
                    log::warn!(
                        target: "posthog",
                        "flag {key} references unknown group type index {index}"
                    );
                    return Ok(inconclusive_result(key, "unknown group type index"));
                };
                let Some(group_key) = groups.get(group_type) else {
                    return Ok(inconclusive_result(
                        key,
                        "no group key given for the flag's group type",
                    ));
                };
                let bag = group_properties
                    .get(group_type)
                    .cloned()
                    .unwrap_or_default();
                (group_key.as_str(), bag)
            }
            None => (distinct_id, person_properties.clone()),
        };
        // Conditions keyed on distinct_id evaluate locally even when the
        // caller did not pass it as a property.
        bag.entry("distinct_id".to_owned())
            .or_insert_with(|| distinct_id.into());

        let ctx = EvalContext::new(&definitions, subject, &bag, &self.hasher);
        match match_flag_conditions(flag, &ctx) {
            Ok(Some(value)) => Ok(decided(flag, value, "condition group matched")),
            Ok(None) => Ok(decided(
                flag,
                FlagValue::Bool(false),
                "no condition group matched",
            )),
            Err(err @ FlagError::RequiresServerEvaluation) => Err(err),
            Err(FlagError::Inconclusive(message)) => {
                log::debug!(target: "posthog", "flag {key} inconclusive locally: {message}");
                Ok(inconclusive_result(key, &message))
            }
        }
    }
}

fn decided(flag: &FlagDefinition, value: FlagValue, reason: &str) -> FlagResult {
    FlagResult {
        payload: payload_for(flag, &value),
        value: Some(value),
        reason: Some(reason.to_owned()),
        flag_id: flag.id,
        flag_version: flag.version,
        request_id: None,
        locally_evaluated: true,
    }
}

fn inconclusive_result(_key: &str, reason: &str) -> FlagResult {
    FlagResult {
        value: None,
        reason: Some(reason.to_owned()),
        locally_evaluated: true,
        ..FlagResult::default()
    }
}
