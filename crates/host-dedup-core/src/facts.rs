use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::DedupError;

/// Identity facts strong enough to match on alone, highest priority first.
pub const ELEVATED_CANONICAL_FACTS: [&str; 3] =
    ["provider_id", "insights_id", "subscription_manager_id"];

pub const REGULAR_CANONICAL_FACTS: [&str; 5] =
    ["fqdn", "satellite_id", "bios_uuid", "ip_addresses", "mac_addresses"];

pub const MULTI_VALUED_CANONICAL_FACTS: [&str; 2] = ["ip_addresses", "mac_addresses"];

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum FactValue {
    Single(String),
    Many(BTreeSet<String>),
}

impl FactValue {
    /// `""` or `[]`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Single(value) => value.is_empty(),
            Self::Many(values) => values.is_empty(),
        }
    }

    /// JSON containment: scalars must be equal, lists must hold every element.
    #[must_use]
    pub fn is_contained_in(&self, stored: &Value) -> bool {
        match (self, stored) {
            (Self::Single(expected), Value::String(actual)) => expected == actual,
            (Self::Many(expected), Value::Array(items)) => expected
                .iter()
                .all(|wanted| items.iter().any(|item| item.as_str() == Some(wanted.as_str()))),
            _ => false,
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Single(value) => Value::String(value.clone()),
            Self::Many(values) => Value::Array(values.iter().cloned().map(Value::String).collect()),
        }
    }
}

/// Typed view over the canonical facts that take part in matching.
#[derive(Debug, Clone, Default, Serialize, Eq, PartialEq)]
pub struct CanonicalFacts(BTreeMap<String, FactValue>);

impl CanonicalFacts {
    /// Parse the known canonical facts out of a stored mapping; other keys are ignored.
    ///
    /// # Errors
    /// Returns [`DedupError::MalformedFacts`] when a known fact has the wrong type:
    /// scalar facts must be strings, multi-valued facts lists of strings. Empty
    /// values are kept; they are present, unlike a missing key.
    pub fn from_json(raw: &Map<String, Value>) -> Result<Self, DedupError> {
        let mut facts = BTreeMap::new();
        for key in ELEVATED_CANONICAL_FACTS.iter().chain(REGULAR_CANONICAL_FACTS.iter()) {
            let Some(value) = raw.get(*key) else {
                continue;
            };
            let parsed = if MULTI_VALUED_CANONICAL_FACTS.contains(key) {
                parse_many(key, value)?
            } else {
                parse_single(key, value)?
            };
            facts.insert((*key).to_string(), parsed);
        }
        Ok(Self(facts))
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&FactValue> {
        self.0.get(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FactValue)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value))
    }

    fn project(&self, keys: &[&str]) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(key, _)| keys.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        )
    }

    fn without(&self, keys: &[&str]) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(key, _)| !keys.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        )
    }
}

impl FromIterator<(String, FactValue)> for CanonicalFacts {
    fn from_iter<T: IntoIterator<Item = (String, FactValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn parse_single(key: &str, value: &Value) -> Result<FactValue, DedupError> {
    match value {
        Value::String(text) => Ok(FactValue::Single(text.clone())),
        other => Err(DedupError::MalformedFacts(format!(
            "{key} MUST be a string (received {})",
            json_kind(other)
        ))),
    }
}

fn parse_many(key: &str, value: &Value) -> Result<FactValue, DedupError> {
    let Value::Array(items) = value else {
        return Err(DedupError::MalformedFacts(format!(
            "{key} MUST be a list of strings (received {})",
            json_kind(value)
        )));
    };
    let mut values = BTreeSet::new();
    for item in items {
        match item {
            Value::String(text) => {
                values.insert(text.clone());
            }
            other => {
                return Err(DedupError::MalformedFacts(format!(
                    "{key} entries MUST be strings (received {})",
                    json_kind(other)
                )));
            }
        }
    }
    Ok(FactValue::Many(values))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[must_use]
pub fn extract_elevated(facts: &CanonicalFacts) -> CanonicalFacts {
    facts.project(&ELEVATED_CANONICAL_FACTS)
}

#[must_use]
pub fn extract_regular(facts: &CanonicalFacts) -> CanonicalFacts {
    facts.project(&REGULAR_CANONICAL_FACTS)
}

/// Keep only the highest-priority elevated identifiers.
///
/// A non-empty `provider_id` suppresses both other elevated facts; otherwise a
/// non-empty `insights_id` suppresses `subscription_manager_id`. Returns a new mapping.
#[must_use]
pub fn narrow_elevated(elevated: &CanonicalFacts) -> CanonicalFacts {
    let non_empty = |key: &str| elevated.get(key).is_some_and(|value| !value.is_empty());
    if non_empty("provider_id") {
        elevated.without(&["insights_id", "subscription_manager_id"])
    } else if non_empty("insights_id") {
        elevated.without(&["subscription_manager_id"])
    } else {
        elevated.clone()
    }
}

/// Which fact category a host is matched on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MatchBasis {
    Elevated,
    Regular,
}

impl MatchBasis {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Elevated => "elevated",
            Self::Regular => "regular",
        }
    }
}

/// Pick the facts a host is matched on: narrowed elevated facts when any are
/// present, else regular facts, else nothing.
#[must_use]
pub fn identity_facts(facts: &CanonicalFacts) -> Option<(MatchBasis, CanonicalFacts)> {
    let elevated = extract_elevated(facts);
    if !elevated.is_empty() {
        return Some((MatchBasis::Elevated, narrow_elevated(&elevated)));
    }

    let regular = extract_regular(facts);
    if !regular.is_empty() {
        return Some((MatchBasis::Regular, regular));
    }

    None
}

/// Storage-independent candidate predicate.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FactExpr {
    /// Candidate carries `key` and its value contains `value`.
    Contains { key: String, value: FactValue },
    /// Candidate carries `key` but its value does not contain `value`.
    Conflicts { key: String, value: FactValue },
    AnyOf(Vec<FactExpr>),
    NoneOf(Vec<FactExpr>),
    AllOf(Vec<FactExpr>),
}

impl FactExpr {
    #[must_use]
    pub fn evaluate(&self, facts: &Map<String, Value>) -> bool {
        match self {
            Self::Contains { key, value } => {
                facts.get(key).is_some_and(|stored| value.is_contained_in(stored))
            }
            Self::Conflicts { key, value } => {
                facts.get(key).is_some_and(|stored| !value.is_contained_in(stored))
            }
            Self::AnyOf(exprs) => exprs.iter().any(|expr| expr.evaluate(facts)),
            Self::NoneOf(exprs) => !exprs.iter().any(|expr| expr.evaluate(facts)),
            Self::AllOf(exprs) => exprs.iter().all(|expr| expr.evaluate(facts)),
        }
    }
}

/// Build `AnyOf(contains) AND NoneOf(conflicts)` over `facts`; `None` when empty.
#[must_use]
pub fn match_filter(facts: &CanonicalFacts) -> Option<FactExpr> {
    if facts.is_empty() {
        return None;
    }

    let contains = facts
        .iter()
        .map(|(key, value)| FactExpr::Contains { key: key.to_string(), value: value.clone() })
        .collect();
    let conflicts = facts
        .iter()
        .map(|(key, value)| FactExpr::Conflicts { key: key.to_string(), value: value.clone() })
        .collect();

    Some(FactExpr::AllOf(vec![FactExpr::AnyOf(contains), FactExpr::NoneOf(conflicts)]))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn raw(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("fixture must be an object, got {other}"),
        }
    }

    fn parsed(value: Value) -> CanonicalFacts {
        match CanonicalFacts::from_json(&raw(value)) {
            Ok(facts) => facts,
            Err(err) => panic!("fixture facts should parse: {err}"),
        }
    }

    fn filter_for(value: Value) -> FactExpr {
        match match_filter(&parsed(value)) {
            Some(expr) => expr,
            None => panic!("fixture should produce a filter"),
        }
    }

    #[test]
    fn projections_keep_only_present_category_keys() {
        let facts = parsed(json!({
            "provider_id": "p-1",
            "subscription_manager_id": "s-1",
            "fqdn": "a.example.com",
            "mac_addresses": ["aa:bb"],
            "provider_type": "aws"
        }));

        let elevated = extract_elevated(&facts);
        assert_eq!(elevated.len(), 2);
        assert!(elevated.contains_key("provider_id"));
        assert!(!elevated.contains_key("fqdn"));

        let regular = extract_regular(&facts);
        assert_eq!(regular.len(), 2);
        assert!(regular.contains_key("mac_addresses"));
        assert!(!regular.contains_key("provider_type"));
    }

    #[test]
    fn provider_id_suppresses_lower_elevated_facts() {
        let elevated = extract_elevated(&parsed(json!({
            "provider_id": "p-1",
            "insights_id": "i-1",
            "subscription_manager_id": "s-1"
        })));
        let narrowed = narrow_elevated(&elevated);

        assert_eq!(narrowed.len(), 1);
        assert!(narrowed.contains_key("provider_id"));
        assert_eq!(elevated.len(), 3, "input mapping must stay untouched");
    }

    #[test]
    fn insights_id_suppresses_subscription_manager_id() {
        let narrowed = narrow_elevated(&parsed(json!({
            "insights_id": "i-1",
            "subscription_manager_id": "s-1"
        })));
        assert_eq!(narrowed.len(), 1);
        assert!(narrowed.contains_key("insights_id"));

        let alone = narrow_elevated(&parsed(json!({"subscription_manager_id": "s-1"})));
        assert!(alone.contains_key("subscription_manager_id"));
    }

    #[test]
    fn filter_matches_partial_overlap_without_conflicts() {
        let filter = filter_for(json!({"fqdn": "x", "bios_uuid": "b-1"}));

        assert!(filter.evaluate(&raw(json!({"fqdn": "x"}))));
        assert!(filter.evaluate(&raw(json!({"bios_uuid": "b-1", "satellite_id": "sat"}))));
        assert!(!filter.evaluate(&raw(json!({"satellite_id": "sat"}))));
    }

    #[test]
    fn filter_rejects_candidate_with_conflicting_present_key() {
        let filter = filter_for(json!({"fqdn": "x", "bios_uuid": "b-1"}));
        assert!(!filter.evaluate(&raw(json!({"fqdn": "x", "bios_uuid": "b-2"}))));
    }

    #[test]
    fn conflicting_ip_lists_are_not_duplicates() {
        let filter = filter_for(json!({"fqdn": "x", "ip_addresses": ["10.0.0.1"]}));
        assert!(!filter.evaluate(&raw(json!({"fqdn": "x", "ip_addresses": ["10.0.0.2"]}))));
    }

    #[test]
    fn list_facts_match_on_containment_not_equality() {
        let filter = filter_for(json!({"ip_addresses": ["10.0.0.1"]}));
        assert!(filter.evaluate(&raw(json!({"ip_addresses": ["10.0.0.2", "10.0.0.1"]}))));

        let wider = filter_for(json!({"ip_addresses": ["10.0.0.1", "10.0.0.3"]}));
        assert!(!wider.evaluate(&raw(json!({"ip_addresses": ["10.0.0.1"]}))));
    }

    #[test]
    fn wrongly_typed_candidate_value_counts_as_conflict() {
        let filter = filter_for(json!({"fqdn": "x", "ip_addresses": ["10.0.0.1"]}));
        assert!(!filter.evaluate(&raw(json!({"fqdn": "x", "ip_addresses": "10.0.0.1"}))));
        assert!(!filter.evaluate(&raw(json!({"fqdn": "x", "ip_addresses": null}))));
    }

    #[test]
    fn provider_match_ignores_lower_priority_disagreement() {
        let elevated = extract_elevated(&parsed(json!({
            "provider_id": "p-1",
            "insights_id": "i-1"
        })));
        let filter = match match_filter(&narrow_elevated(&elevated)) {
            Some(filter) => filter,
            None => panic!("provider facts should yield a filter"),
        };
        assert!(filter.evaluate(&raw(json!({"provider_id": "p-1", "insights_id": "i-other"}))));
    }

    #[test]
    fn identity_facts_prefer_elevated_over_regular() {
        let facts = parsed(json!({"insights_id": "i-1", "subscription_manager_id": "s-1", "fqdn": "x"}));
        let Some((basis, selected)) = identity_facts(&facts) else {
            panic!("elevated facts should be selected");
        };
        assert_eq!(basis, MatchBasis::Elevated);
        assert_eq!(selected.len(), 1);
        assert!(selected.contains_key("insights_id"));

        let Some((basis, selected)) = identity_facts(&parsed(json!({"fqdn": "x", "bios_uuid": "b"})))
        else {
            panic!("regular facts should be selected");
        };
        assert_eq!(basis, MatchBasis::Regular);
        assert_eq!(selected.len(), 2);

        assert!(identity_facts(&CanonicalFacts::default()).is_none());
    }

    #[test]
    fn empty_facts_yield_no_filter() {
        assert!(match_filter(&CanonicalFacts::default()).is_none());
        assert!(match_filter(&parsed(json!({"provider_type": "aws"}))).is_none());
    }

    #[test]
    fn from_json_rejects_malformed_values() {
        for (value, expected) in [
            (json!({"fqdn": 7}), "fqdn MUST be a string"),
            (json!({"ip_addresses": "10.0.0.1"}), "ip_addresses MUST be a list"),
            (json!({"mac_addresses": ["aa", 1]}), "mac_addresses entries MUST be strings"),
            (json!({"provider_id": null}), "provider_id MUST be a string"),
        ] {
            let err = match CanonicalFacts::from_json(&raw(value)) {
                Ok(facts) => panic!("expected malformed facts error, parsed {facts:?}"),
                Err(err) => err,
            };
            assert!(err.to_string().contains(expected), "`{err}` did not contain `{expected}`");
        }
    }

    #[test]
    fn empty_values_are_present_facts() {
        let facts = parsed(json!({"fqdn": "", "mac_addresses": [], "bios_uuid": "b-1"}));
        assert_eq!(facts.get("fqdn"), Some(&FactValue::Single(String::new())));
        assert_eq!(facts.get("mac_addresses"), Some(&FactValue::Many(BTreeSet::new())));

        let filter = filter_for(json!({"fqdn": ""}));
        assert!(filter.evaluate(&raw(json!({"fqdn": ""}))));
        assert!(!filter.evaluate(&raw(json!({"fqdn": "x"}))));
        assert!(!filter.evaluate(&raw(json!({"satellite_id": "sat"}))));
    }

    #[test]
    fn empty_elevated_ids_do_not_suppress_lower_priority_ids() {
        let narrowed = narrow_elevated(&parsed(json!({
            "provider_id": "",
            "insights_id": "i-1",
            "subscription_manager_id": "s-1"
        })));
        assert!(narrowed.contains_key("provider_id"));
        assert!(narrowed.contains_key("insights_id"));
        assert!(!narrowed.contains_key("subscription_manager_id"));

        let all_empty = narrow_elevated(&parsed(json!({
            "insights_id": "",
            "subscription_manager_id": "s-1"
        })));
        assert_eq!(all_empty.len(), 2);
    }

    #[test]
    fn fact_value_json_round_trip_keeps_shape() {
        let many = FactValue::Many(BTreeSet::from(["b".to_string(), "a".to_string()]));
        assert_eq!(many.to_json(), json!(["a", "b"]));
        assert!(many.is_contained_in(&json!(["a", "c", "b"])));
        assert_eq!(FactValue::Single("x".to_string()).to_json(), json!("x"));
    }
}
