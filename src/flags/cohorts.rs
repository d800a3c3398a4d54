//! Recursive evaluation of cohort property groups: nested AND/OR groups,
//! cohort references by id, and flag-dependency leaves.

use serde_json::Value;

use super::eval::{resolve_flag_dependency, EvalContext};
use super::matcher::match_property;
use super::models::{
    FlagValue, GroupCombinator, GroupMember, PropertyCondition, PropertyGroup, PropertyOperator,
};
use super::FlagError;

/// Evaluate a property group with AND/OR short-circuit semantics. An
/// inconclusive member only decides the outcome when no conclusive member
/// already did.
pub(crate) fn match_property_group(
    group: &PropertyGroup,
    ctx: &EvalContext,
) -> Result<bool, FlagError> {
    // Empty groups match everything.
    if group.values.is_empty() {
        return Ok(true);
    }
    let is_or = group.combinator == GroupCombinator::Or;
    let mut inconclusive: Option<FlagError> = None;
    for member in &group.values {
        let result = match member {
            GroupMember::Group(inner) => match_property_group(inner, ctx),
            GroupMember::Condition(condition) => match_condition(condition, ctx),
        };
        match result {
            Ok(true) if is_or => return Ok(true),
            Ok(false) if !is_or => return Ok(false),
            Ok(_) => {}
            Err(err @ FlagError::RequiresServerEvaluation) => return Err(err),
            Err(err) => inconclusive = Some(err),
        }
    }
    match inconclusive {
        Some(err) => Err(err),
        // OR exhausted without a match; AND satisfied every member.
        None => Ok(!is_or),
    }
}

/// Evaluate one leaf condition, routing cohort and flag references, and
/// apply its negation.
pub(crate) fn match_condition(
    condition: &PropertyCondition,
    ctx: &EvalContext,
) -> Result<bool, FlagError> {
    let matched = match condition.kind.as_deref() {
        Some("cohort") => match_cohort(condition, ctx)?,
        Some("flag") => match_flag_dependency(condition, ctx)?,
        _ => match_property(condition, ctx.properties)?,
    };
    Ok(matched != condition.negation.unwrap_or(false))
}

fn match_cohort(condition: &PropertyCondition, ctx: &EvalContext) -> Result<bool, FlagError> {
    let cohort_id = match &condition.value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => {
            return Err(FlagError::Inconclusive(
                "cohort condition value must be an id".to_owned(),
            ))
        }
    };
    // An id we never received is likely a static cohort, which only the
    // server can evaluate.
    let Some(group) = ctx.definitions.cohorts_by_id.get(&cohort_id) else {
        return Err(FlagError::RequiresServerEvaluation);
    };
    match_property_group(group, ctx)
}

fn match_flag_dependency(
    condition: &PropertyCondition,
    ctx: &EvalContext,
) -> Result<bool, FlagError> {
    if condition.operator != Some(PropertyOperator::FlagEvaluatesTo) {
        return Err(FlagError::Inconclusive(format!(
            "flag dependency on {} requires the flag_evaluates_to operator",
            condition.key
        )));
    }
    if let Some(chain) = &condition.dependency_chain {
        if chain.is_empty() {
            return Err(FlagError::Inconclusive(format!(
                "circular dependency on flag {}",
                condition.key
            )));
        }
        // Resolve transitive dependencies in chain order so each lookup
        // below hits the per-call cache.
        for dependency in chain {
            resolve_flag_dependency(dependency, ctx)?;
        }
    }
    let actual = resolve_flag_dependency(&condition.key, ctx)?;
    Ok(flag_value_matches(actual.as_ref(), &condition.value))
}

/// `flag_evaluates_to` matching rules.
pub(crate) fn flag_value_matches(actual: Option<&FlagValue>, expected: &Value) -> bool {
    match expected {
        // Any enabled outcome satisfies an expected `true`.
        Value::Bool(true) => match actual {
            Some(FlagValue::Bool(true)) => true,
            Some(FlagValue::Variant(v)) => !v.is_empty(),
            _ => false,
        },
        Value::Bool(false) => matches!(actual, Some(FlagValue::Bool(false)) | None),
        // Variant comparison is case-sensitive.
        Value::String(expected) => {
            matches!(actual, Some(FlagValue::Variant(v)) if v == expected)
        }
        _ => false,
    }
}
