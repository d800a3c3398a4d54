//! Wire models for flag and cohort definitions as served by the
//! local-evaluation endpoint, plus the value/result types surfaced to
//! callers.

use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `TryParse` allows a subfield to fail parsing without failing the parsing
/// of the whole structure.
///
/// Flag definitions evolve server-side; wrapping each flag means one
/// unrecognized definition leaves the rest of the payload usable.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub(crate) enum TryParse<T> {
    Parsed(T),
    ParseFailed(Value),
}

impl<T> TryParse<T> {
    pub fn parsed(self) -> Option<T> {
        match self {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

/// The value a flag evaluates to: a plain on/off flag or a multivariate
/// variant key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, From)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    #[from(ignore)]
    Variant(String),
}

impl From<&str> for FlagValue {
    fn from(value: &str) -> Self {
        FlagValue::Variant(value.to_owned())
    }
}

impl From<String> for FlagValue {
    fn from(value: String) -> Self {
        FlagValue::Variant(value)
    }
}

impl FlagValue {
    /// A flag counts as enabled when it is `true` or any variant.
    pub fn is_enabled(&self) -> bool {
        match self {
            FlagValue::Bool(b) => *b,
            FlagValue::Variant(_) => true,
        }
    }

    /// Key used for payload lookup: the variant name, or `"true"`/`"false"`.
    pub(crate) fn payload_key(&self) -> String {
        match self {
            FlagValue::Bool(b) => b.to_string(),
            FlagValue::Variant(v) => v.clone(),
        }
    }

    pub(crate) fn to_json(&self) -> Value {
        match self {
            FlagValue::Bool(b) => Value::Bool(*b),
            FlagValue::Variant(v) => Value::String(v.clone()),
        }
    }
}

/// Outcome of a flag query. `value` is `None` when no decision could be
/// made (inconclusive locally and no remote answer).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FlagResult {
    pub value: Option<FlagValue>,
    pub reason: Option<String>,
    pub flag_id: Option<i64>,
    pub flag_version: Option<i64>,
    pub payload: Option<Value>,
    pub request_id: Option<String>,
    pub locally_evaluated: bool,
}

impl FlagResult {
    /// A conclusive result carries a decision; inconclusive results make
    /// the facade fall back to remote evaluation.
    pub(crate) fn is_conclusive(&self) -> bool {
        self.value.is_some()
    }
}

/// One feature-flag definition as served by the local-evaluation endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FlagDefinition {
    pub key: String,
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub ensure_experience_continuity: Option<bool>,
    #[serde(default)]
    pub filters: FlagFilters,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct FlagFilters {
    #[serde(default)]
    pub groups: Vec<FlagConditionGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multivariate: Option<MultivariateFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payloads: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation_group_type_index: Option<i64>,
}

/// One condition group: all properties must match, then the rollout gate
/// applies. An optional `variant` overrides hash-based variant assignment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct FlagConditionGroup {
    #[serde(default)]
    pub properties: Vec<PropertyCondition>,
    #[serde(default)]
    pub rollout_percentage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct MultivariateFilter {
    #[serde(default)]
    pub variants: Vec<VariantDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct VariantDefinition {
    pub key: String,
    #[serde(default)]
    pub rollout_percentage: f64,
}

/// Operators understood by the local property matcher. Parsing an unknown
/// operator fails the enclosing flag's `TryParse`, which routes the query
/// to remote evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum PropertyOperator {
    Exact,
    IsNot,
    IsSet,
    IsNotSet,
    Icontains,
    NotIcontains,
    Regex,
    NotRegex,
    Gt,
    Gte,
    Lt,
    Lte,
    IsDateBefore,
    IsDateAfter,
    FlagEvaluatesTo,
}

/// A single property condition. `kind` distinguishes plain property checks
/// from cohort and flag-dependency references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PropertyCondition {
    pub key: String,
    #[serde(default)]
    pub operator: Option<PropertyOperator>,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negation: Option<bool>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Transitive flag dependencies in evaluation order. An empty chain is
    /// the server's marker for a circular dependency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_chain: Option<Vec<String>>,
}

/// Combinator for cohort property groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum GroupCombinator {
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
}

/// A recursive AND/OR group of conditions, as found in cohort definitions.
///
/// Both fields are required so that the untagged [`GroupMember`] never
/// mistakes a leaf condition for a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PropertyGroup {
    #[serde(rename = "type")]
    pub combinator: GroupCombinator,
    pub values: Vec<GroupMember>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum GroupMember {
    Group(PropertyGroup),
    Condition(PropertyCondition),
}

/// Raw response of the local-evaluation endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct LocalEvaluationResponse {
    #[serde(default)]
    pub flags: Vec<TryParse<FlagDefinition>>,
    #[serde(default)]
    pub cohorts: HashMap<String, TryParse<PropertyGroup>>,
    #[serde(default)]
    pub group_type_mapping: HashMap<String, String>,
}

/// Processed, lookup-friendly form of the definitions. Built outside the
/// store's critical section and swapped in whole.
#[derive(Debug, Clone, Default)]
pub(crate) struct FlagDefinitions {
    pub flags_by_key: HashMap<String, FlagDefinition>,
    pub cohorts_by_id: HashMap<String, PropertyGroup>,
    pub group_type_mapping: HashMap<String, String>,
}

impl From<LocalEvaluationResponse> for FlagDefinitions {
    fn from(response: LocalEvaluationResponse) -> Self {
        let mut flags_by_key = HashMap::new();
        for entry in response.flags {
            match entry {
                TryParse::Parsed(flag) => {
                    flags_by_key.insert(flag.key.clone(), flag);
                }
                TryParse::ParseFailed(raw) => {
                    log::warn!(
                        target: "posthog",
                        "ignoring unparseable flag definition: {}",
                        raw.get("key").and_then(Value::as_str).unwrap_or("<unknown>")
                    );
                }
            }
        }
        let cohorts_by_id = response
            .cohorts
            .into_iter()
            .filter_map(|(id, group)| group.parsed().map(|g| (id, g)))
            .collect();
        FlagDefinitions {
            flags_by_key,
            cohorts_by_id,
            group_type_mapping: response.group_type_mapping,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_local_evaluation_response() {
        let response: LocalEvaluationResponse = serde_json::from_value(json!({
            "flags": [
                {
                    "key": "beta",
                    "id": 7,
                    "version": 3,
                    "active": true,
                    "filters": {
                        "groups": [
                            {
                                "properties": [
                                    {"key": "email", "operator": "icontains", "value": "@example.com"}
                                ],
                                "rollout_percentage": 50
                            }
                        ],
                        "multivariate": {
                            "variants": [
                                {"key": "control", "rollout_percentage": 50},
                                {"key": "test", "rollout_percentage": 50}
                            ]
                        },
                        "payloads": {"true": "{\"color\": \"red\"}"}
                    }
                }
            ],
            "cohorts": {
                "42": {
                    "type": "OR",
                    "values": [
                        {"key": "plan", "operator": "exact", "value": "pro"}
                    ]
                }
            },
            "group_type_mapping": {"0": "company"}
        }))
        .unwrap();

        let definitions = FlagDefinitions::from(response);
        let flag = &definitions.flags_by_key["beta"];
        assert_eq!(flag.id, Some(7));
        assert_eq!(flag.version, Some(3));
        assert!(flag.active);
        assert_eq!(flag.filters.groups.len(), 1);
        assert_eq!(flag.filters.groups[0].rollout_percentage, Some(50.0));
        assert_eq!(
            flag.filters.multivariate.as_ref().unwrap().variants.len(),
            2
        );
        assert!(definitions.cohorts_by_id.contains_key("42"));
        assert_eq!(definitions.group_type_mapping["0"], "company");
    }

    #[test]
    fn unknown_operator_fails_only_that_flag() {
        let response: LocalEvaluationResponse = serde_json::from_value(json!({
            "flags": [
                {
                    "key": "broken",
                    "active": true,
                    "filters": {
                        "groups": [
                            {"properties": [
                                {"key": "x", "operator": "future_operator", "value": 1}
                            ]}
                        ]
                    }
                },
                {"key": "fine", "active": true, "filters": {"groups": []}}
            ]
        }))
        .unwrap();

        let definitions = FlagDefinitions::from(response);
        assert!(!definitions.flags_by_key.contains_key("broken"));
        assert!(definitions.flags_by_key.contains_key("fine"));
    }

    #[test]
    fn group_member_disambiguates_nested_groups_from_conditions() {
        let group: PropertyGroup = serde_json::from_value(json!({
            "type": "AND",
            "values": [
                {
                    "type": "OR",
                    "values": [
                        {"key": "plan", "operator": "exact", "value": "pro"}
                    ]
                },
                {"key": "age", "operator": "gte", "value": 18}
            ]
        }))
        .unwrap();

        assert_eq!(group.combinator, GroupCombinator::And);
        assert!(matches!(group.values[0], GroupMember::Group(_)));
        assert!(matches!(group.values[1], GroupMember::Condition(_)));
    }

    #[test]
    fn flag_value_serde_is_untagged() {
        assert_eq!(serde_json::to_value(FlagValue::Bool(true)).unwrap(), json!(true));
        assert_eq!(
            serde_json::to_value(FlagValue::Variant("test".into())).unwrap(),
            json!("test")
        );
        let value: FlagValue = serde_json::from_value(json!("control")).unwrap();
        assert_eq!(value, FlagValue::Variant("control".to_owned()));
        let value: FlagValue = serde_json::from_value(json!(false)).unwrap();
        assert_eq!(value, FlagValue::Bool(false));
    }

    #[test]
    fn payload_keys() {
        assert_eq!(FlagValue::Bool(true).payload_key(), "true");
        assert_eq!(FlagValue::Bool(false).payload_key(), "false");
        assert_eq!(FlagValue::Variant("test".into()).payload_key(), "test");
    }
}
