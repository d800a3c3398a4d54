//! Evaluation of a single property condition against a property bag.
//! Returns `true`/`false`, or [`FlagError::Inconclusive`] when the answer
//! cannot be determined locally (missing property, invalid pattern,
//! unparseable date) so the caller can try another condition group or fall
//! back to remote evaluation.

use chrono::{DateTime, Duration, Months, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde_json::Value;

use super::models::{PropertyCondition, PropertyOperator};
use super::FlagError;
use crate::message::Properties;

/// Largest magnitude accepted in the relative-date grammar `-?N[hdwmy]`.
const MAX_RELATIVE_DATE_UNITS: u32 = 10_000;

fn inconclusive(message: impl Into<String>) -> FlagError {
    FlagError::Inconclusive(message.into())
}

/// Stringify a JSON scalar for comparison purposes.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => "null".to_owned(),
        other => other.to_string(),
    }
}

fn eq_case_insensitive(a: &Value, b: &Value) -> bool {
    value_to_string(a).to_lowercase() == value_to_string(b).to_lowercase()
}

/// `exact` semantics: the condition value may be a scalar or a list of
/// admissible values.
fn exact_match(actual: &Value, expected: &Value) -> bool {
    match expected {
        Value::Array(candidates) => candidates.iter().any(|c| eq_case_insensitive(actual, c)),
        scalar => eq_case_insensitive(actual, scalar),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn order_match(operator: PropertyOperator, actual: &Value, expected: &Value) -> bool {
    use std::cmp::Ordering;
    let ordering = match (as_number(actual), as_number(expected)) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        // Either side refuses numeric coercion: compare lexicographically.
        _ => value_to_string(actual).cmp(&value_to_string(expected)),
    };
    match operator {
        PropertyOperator::Gt => ordering == Ordering::Greater,
        PropertyOperator::Gte => ordering != Ordering::Less,
        PropertyOperator::Lt => ordering == Ordering::Less,
        PropertyOperator::Lte => ordering != Ordering::Greater,
        _ => false,
    }
}

fn parse_absolute_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    // Bare datetime without offset is interpreted as UTC.
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|dt| dt.and_utc())
}

/// Parse the relative-date grammar `-?N[hdwmy]`, anchored to the current
/// UTC time. Returns `None` when `raw` is not relative at all, and an
/// error when it is relative but out of bounds.
fn parse_relative_date(raw: &str) -> Result<Option<DateTime<Utc>>, FlagError> {
    let trimmed = raw.trim().strip_prefix('-').unwrap_or(raw.trim());
    let Some(unit) = trimmed.chars().last().filter(|c| "hdwmy".contains(*c)) else {
        return Ok(None);
    };
    let digits = &trimmed[..trimmed.len() - 1];
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Ok(None);
    }
    let count: u32 = digits
        .parse()
        .map_err(|_| inconclusive(format!("relative date out of range: {raw}")))?;
    if count > MAX_RELATIVE_DATE_UNITS {
        return Err(inconclusive(format!(
            "relative date exceeds {MAX_RELATIVE_DATE_UNITS} units: {raw}"
        )));
    }
    let now = Utc::now();
    let anchored = match unit {
        'h' => now.checked_sub_signed(Duration::hours(count as i64)),
        'd' => now.checked_sub_signed(Duration::days(count as i64)),
        'w' => now.checked_sub_signed(Duration::weeks(count as i64)),
        'm' => now.checked_sub_months(Months::new(count)),
        'y' => now.checked_sub_months(Months::new(count.saturating_mul(12))),
        _ => None,
    };
    anchored
        .map(Some)
        .ok_or_else(|| inconclusive(format!("relative date out of range: {raw}")))
}

fn parse_condition_date(value: &Value) -> Result<DateTime<Utc>, FlagError> {
    let Value::String(raw) = value else {
        return Err(inconclusive("date condition value must be a string"));
    };
    if let Some(relative) = parse_relative_date(raw)? {
        return Ok(relative);
    }
    parse_absolute_date(raw).ok_or_else(|| inconclusive(format!("cannot parse date: {raw}")))
}

fn parse_property_date(value: &Value) -> Result<DateTime<Utc>, FlagError> {
    match value {
        // Numeric properties are unix seconds.
        Value::Number(n) => {
            let seconds = n
                .as_f64()
                .ok_or_else(|| inconclusive("cannot parse numeric date property"))?;
            DateTime::from_timestamp(seconds as i64, 0)
                .ok_or_else(|| inconclusive("numeric date property out of range"))
        }
        Value::String(raw) => parse_absolute_date(raw)
            .ok_or_else(|| inconclusive(format!("cannot parse date property: {raw}"))),
        _ => Err(inconclusive("date property must be a string or number")),
    }
}

fn date_match(
    operator: PropertyOperator,
    actual: &Value,
    expected: &Value,
) -> Result<bool, FlagError> {
    let condition_date = parse_condition_date(expected)?;
    let property_date = parse_property_date(actual)?;
    Ok(match operator {
        PropertyOperator::IsDateBefore => property_date < condition_date,
        PropertyOperator::IsDateAfter => property_date > condition_date,
        _ => false,
    })
}

fn contains_case_insensitive(actual: &Value, expected: &Value) -> bool {
    value_to_string(actual)
        .to_lowercase()
        .contains(&value_to_string(expected).to_lowercase())
}

/// Evaluate one condition against the property bag.
pub(crate) fn match_property(
    condition: &PropertyCondition,
    properties: &Properties,
) -> Result<bool, FlagError> {
    let operator = condition.operator.unwrap_or(PropertyOperator::Exact);

    // `is_not_set` is the one operator defined on an absent key.
    if operator == PropertyOperator::IsNotSet {
        return Ok(!properties.contains_key(&condition.key));
    }

    let Some(actual) = properties.get(&condition.key) else {
        return Err(inconclusive(format!(
            "property {} is not set",
            condition.key
        )));
    };

    match operator {
        PropertyOperator::Exact => Ok(exact_match(actual, &condition.value)),
        PropertyOperator::IsNot => Ok(!exact_match(actual, &condition.value)),
        // The key exists, so `is_set` holds by definition.
        PropertyOperator::IsSet => Ok(true),
        PropertyOperator::Icontains => Ok(contains_case_insensitive(actual, &condition.value)),
        PropertyOperator::NotIcontains => {
            Ok(!contains_case_insensitive(actual, &condition.value))
        }
        PropertyOperator::Regex | PropertyOperator::NotRegex => {
            let pattern = value_to_string(&condition.value);
            let regex = Regex::new(&pattern)
                .map_err(|err| inconclusive(format!("invalid regex {pattern:?}: {err}")))?;
            let matched = regex.is_match(&value_to_string(actual));
            Ok(matched == (operator == PropertyOperator::Regex))
        }
        PropertyOperator::Gt
        | PropertyOperator::Gte
        | PropertyOperator::Lt
        | PropertyOperator::Lte => Ok(order_match(operator, actual, &condition.value)),
        PropertyOperator::IsDateBefore | PropertyOperator::IsDateAfter => {
            date_match(operator, actual, &condition.value)
        }
        PropertyOperator::FlagEvaluatesTo => Err(inconclusive(
            "flag_evaluates_to is only valid in flag dependency conditions",
        )),
        PropertyOperator::IsNotSet => unreachable!("handled above"),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn condition(key: &str, operator: PropertyOperator, value: Value) -> PropertyCondition {
        PropertyCondition {
            key: key.to_owned(),
            operator: Some(operator),
            value,
            negation: None,
            kind: None,
            dependency_chain: None,
        }
    }

    fn bag(pairs: &[(&str, Value)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn exact_is_case_insensitive() {
        let c = condition("email", PropertyOperator::Exact, json!("USER@example.com"));
        assert!(match_property(&c, &bag(&[("email", json!("user@EXAMPLE.com"))])).unwrap());
        assert!(!match_property(&c, &bag(&[("email", json!("other@example.com"))])).unwrap());
    }

    #[test]
    fn exact_accepts_value_lists() {
        let c = condition("plan", PropertyOperator::Exact, json!(["free", "PRO"]));
        assert!(match_property(&c, &bag(&[("plan", json!("pro"))])).unwrap());
        assert!(!match_property(&c, &bag(&[("plan", json!("enterprise"))])).unwrap());
    }

    #[test]
    fn exact_coerces_scalar_types() {
        let c = condition("age", PropertyOperator::Exact, json!("42"));
        assert!(match_property(&c, &bag(&[("age", json!(42))])).unwrap());
        let c = condition("active", PropertyOperator::Exact, json!(true));
        assert!(match_property(&c, &bag(&[("active", json!("true"))])).unwrap());
    }

    #[test]
    fn is_not_negates_exact() {
        let c = condition("plan", PropertyOperator::IsNot, json!("pro"));
        assert!(!match_property(&c, &bag(&[("plan", json!("pro"))])).unwrap());
        assert!(match_property(&c, &bag(&[("plan", json!("free"))])).unwrap());
    }

    #[test]
    fn missing_property_is_inconclusive_for_most_operators() {
        let empty = Properties::new();
        for operator in [
            PropertyOperator::Exact,
            PropertyOperator::IsSet,
            PropertyOperator::Icontains,
            PropertyOperator::Regex,
            PropertyOperator::Gt,
            PropertyOperator::IsDateBefore,
        ] {
            let c = condition("missing", operator, json!("x"));
            assert!(
                matches!(match_property(&c, &empty), Err(FlagError::Inconclusive(_))),
                "{operator:?} should be inconclusive on a missing key"
            );
        }
    }

    #[test]
    fn is_not_set_does_not_raise_on_missing_key() {
        let c = condition("missing", PropertyOperator::IsNotSet, Value::Null);
        assert!(match_property(&c, &Properties::new()).unwrap());
        assert!(!match_property(&c, &bag(&[("missing", json!(1))])).unwrap());
    }

    #[test]
    fn is_set_is_true_for_present_key() {
        let c = condition("plan", PropertyOperator::IsSet, Value::Null);
        assert!(match_property(&c, &bag(&[("plan", json!("pro"))])).unwrap());
    }

    #[test]
    fn icontains_is_case_insensitive_substring() {
        let c = condition(
            "email",
            PropertyOperator::Icontains,
            json!("@example.com"),
        );
        assert!(match_property(&c, &bag(&[("email", json!("user@EXAMPLE.com"))])).unwrap());
        assert!(!match_property(&c, &bag(&[("email", json!("user@other.com"))])).unwrap());

        let c = condition(
            "email",
            PropertyOperator::NotIcontains,
            json!("@example.com"),
        );
        assert!(match_property(&c, &bag(&[("email", json!("user@other.com"))])).unwrap());
    }

    #[test]
    fn regex_operators() {
        let c = condition("email", PropertyOperator::Regex, json!(r".+@example\.com$"));
        assert!(match_property(&c, &bag(&[("email", json!("a@example.com"))])).unwrap());
        assert!(!match_property(&c, &bag(&[("email", json!("a@other.com"))])).unwrap());

        let c = condition("email", PropertyOperator::NotRegex, json!(r".+@example\.com$"));
        assert!(match_property(&c, &bag(&[("email", json!("a@other.com"))])).unwrap());
    }

    #[test]
    fn invalid_regex_is_inconclusive() {
        let c = condition("email", PropertyOperator::Regex, json!("("));
        assert!(matches!(
            match_property(&c, &bag(&[("email", json!("a@example.com"))])),
            Err(FlagError::Inconclusive(_))
        ));
    }

    #[test]
    fn numeric_comparisons_coerce_strings() {
        let c = condition("age", PropertyOperator::Gt, json!(18));
        assert!(match_property(&c, &bag(&[("age", json!(19))])).unwrap());
        assert!(match_property(&c, &bag(&[("age", json!("19"))])).unwrap());
        assert!(!match_property(&c, &bag(&[("age", json!(18))])).unwrap());

        let c = condition("age", PropertyOperator::Gte, json!("18"));
        assert!(match_property(&c, &bag(&[("age", json!(18))])).unwrap());
        let c = condition("age", PropertyOperator::Lt, json!(18));
        assert!(match_property(&c, &bag(&[("age", json!(17.5))])).unwrap());
        let c = condition("age", PropertyOperator::Lte, json!(18));
        assert!(match_property(&c, &bag(&[("age", json!(18))])).unwrap());
    }

    #[test]
    fn non_numeric_comparison_falls_back_to_lexicographic() {
        let c = condition("version", PropertyOperator::Gt, json!("alpha"));
        assert!(match_property(&c, &bag(&[("version", json!("beta"))])).unwrap());
        assert!(!match_property(&c, &bag(&[("version", json!("aaa"))])).unwrap());
    }

    #[test]
    fn absolute_date_comparisons() {
        let c = condition(
            "signup",
            PropertyOperator::IsDateBefore,
            json!("2024-06-01"),
        );
        assert!(match_property(&c, &bag(&[("signup", json!("2024-05-31"))])).unwrap());
        assert!(!match_property(&c, &bag(&[("signup", json!("2024-06-02"))])).unwrap());

        let c = condition(
            "signup",
            PropertyOperator::IsDateAfter,
            json!("2024-06-01T12:00:00"),
        );
        assert!(
            match_property(&c, &bag(&[("signup", json!("2024-06-01T13:00:00Z"))])).unwrap()
        );
    }

    #[test]
    fn unix_timestamp_properties_parse_as_dates() {
        // 2024-06-01T00:00:00Z
        let ts = 1_717_200_000;
        let c = condition(
            "signup",
            PropertyOperator::IsDateAfter,
            json!("2024-05-01"),
        );
        assert!(match_property(&c, &bag(&[("signup", json!(ts))])).unwrap());
    }

    #[test]
    fn relative_dates() {
        let c = condition("seen", PropertyOperator::IsDateAfter, json!("-30d"));
        let yesterday = Utc::now() - Duration::days(1);
        let long_ago = Utc::now() - Duration::days(60);
        assert!(match_property(
            &c,
            &bag(&[("seen", json!(yesterday.to_rfc3339()))])
        )
        .unwrap());
        assert!(!match_property(
            &c,
            &bag(&[("seen", json!(long_ago.to_rfc3339()))])
        )
        .unwrap());
    }

    #[test]
    fn relative_date_units() {
        for unit in ["6h", "2w", "3m", "1y"] {
            let c = condition("seen", PropertyOperator::IsDateBefore, json!(unit));
            // A clearly ancient date is before any recent relative anchor.
            assert!(
                match_property(&c, &bag(&[("seen", json!("1999-01-01"))])).unwrap(),
                "unit {unit}"
            );
        }
    }

    #[test]
    fn oversized_relative_date_is_inconclusive() {
        let c = condition("seen", PropertyOperator::IsDateBefore, json!("10001d"));
        assert!(matches!(
            match_property(&c, &bag(&[("seen", json!("2024-01-01"))])),
            Err(FlagError::Inconclusive(_))
        ));
    }

    #[test]
    fn unparseable_dates_are_inconclusive() {
        let c = condition("seen", PropertyOperator::IsDateBefore, json!("soon"));
        assert!(matches!(
            match_property(&c, &bag(&[("seen", json!("2024-01-01"))])),
            Err(FlagError::Inconclusive(_))
        ));

        let c = condition("seen", PropertyOperator::IsDateBefore, json!("2024-01-01"));
        assert!(matches!(
            match_property(&c, &bag(&[("seen", json!("not a date"))])),
            Err(FlagError::Inconclusive(_))
        ));
    }

    #[test]
    fn missing_operator_defaults_to_exact() {
        let c = PropertyCondition {
            key: "plan".to_owned(),
            operator: None,
            value: json!("pro"),
            negation: None,
            kind: None,
            dependency_chain: None,
        };
        assert!(match_property(&c, &bag(&[("plan", json!("pro"))])).unwrap());
    }
}
