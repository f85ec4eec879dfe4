//! Property-based tests for report key canonicalization
//!
//! # Test Properties
//!
//! 1. **Order Independence**: JSON key order never changes the derived key
//! 2. **Absent Equals Empty**: a missing dimension renders as `""`
//! 3. **Escaped Dimensions**: a glob-escaped value matches only itself
//! 4. **Invalidation Reach**: bulk invalidation patterns match the keys they
//!    target

#![cfg(test)]

use proptest::prelude::*;
use serde_json::{Map, Value};

use super::report::generate_key;
use crate::domain::ReportParams;
use crate::kv::{glob_escape, glob_match};

const FIELDS: [&str; 7] = [
    "from_date",
    "to_date",
    "division_id",
    "section_id",
    "sub_section_id",
    "employee_id",
    "grouping",
];

// =============================================================================
// Property Strategies
// =============================================================================

/// Dimension values, including glob metacharacters.
fn value_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_\\-\\*\\?\\[\\]]{1,12}"
}

/// Optional value per canonical field.
fn params_strategy() -> impl Strategy<Value = Vec<Option<String>>> {
    prop::collection::vec(prop::option::of(value_strategy()), FIELDS.len())
}

fn to_object(values: &[Option<String>], order: &[usize]) -> Value {
    let mut map = Map::new();
    for &i in order {
        if let Some(v) = &values[i] {
            map.insert(FIELDS[i].to_string(), Value::String(v.clone()));
        }
    }
    Value::Object(map)
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: the derived key does not depend on JSON key order.
    #[test]
    fn prop_key_order_independent(
        values in params_strategy(),
        order in Just((0..FIELDS.len()).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let natural: Vec<usize> = (0..FIELDS.len()).collect();
        let a = ReportParams::from_json(&to_object(&values, &natural));
        let b = ReportParams::from_json(&to_object(&values, &order));
        prop_assert_eq!(generate_key("summary", &a), generate_key("summary", &b));
    }

    /// Property: an omitted field and an explicit empty string give one key.
    #[test]
    fn prop_absent_field_is_empty(values in params_strategy(), dropped in 0..FIELDS.len()) {
        let natural: Vec<usize> = (0..FIELDS.len()).collect();
        let mut absent = values.clone();
        absent[dropped] = None;
        let mut empty = values;
        empty[dropped] = Some(String::new());

        let a = ReportParams::from_json(&to_object(&absent, &natural));
        let b = ReportParams::from_json(&to_object(&empty, &natural));
        prop_assert_eq!(generate_key("group", &a), generate_key("group", &b));
    }

    /// Property: the key always has the type plus seven dimensions.
    #[test]
    fn prop_key_shape(values in params_strategy()) {
        let natural: Vec<usize> = (0..FIELDS.len()).collect();
        let params = ReportParams::from_json(&to_object(&values, &natural));
        let key = generate_key("daily", &params);
        prop_assert!(key.starts_with("report:daily:"));
        prop_assert!(key.matches(':').count() >= 8);
    }

    /// Property: an escaped value matches itself and nothing longer.
    #[test]
    fn prop_escaped_value_matches_itself(value in value_strategy(), suffix in "[a-z]{1,3}") {
        let escaped = glob_escape(&value);
        prop_assert!(glob_match(&escaped, &value));
        let longer = format!("{}{}", value, suffix);
        prop_assert!(!glob_match(&escaped, &longer));
    }

    /// Property: the date-range invalidation pattern matches every report of
    /// that range.
    #[test]
    fn prop_date_range_pattern_matches(
        from in "[0-9]{4}-[0-9]{2}-[0-9]{2}",
        to in "[0-9]{4}-[0-9]{2}-[0-9]{2}",
        division in prop::option::of("[A-Z][0-9]{1,3}"),
    ) {
        let mut params = ReportParams::new().date_range(from.clone(), to.clone());
        if let Some(d) = division {
            params = params.division(d);
        }
        let key = generate_key("attendance", &params);
        let pattern = format!("report:*:{}:{}:*", glob_escape(&from), glob_escape(&to));
        prop_assert!(glob_match(&pattern, &key));
    }
}
