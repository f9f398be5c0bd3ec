//! Reusable [`Validator`]s for field handlers.
//!
//! Every validator receives the resolved raw value, or [`None`] if the field
//! did not resolve, and returns the message to report.
use std::{sync::Arc, time::Duration};

use itertools::Itertools as _;
use regex::Regex;
use serde_json::Value;

use super::Validator;

/// The value must be a string matching `regex`.
pub fn pattern(regex: &'static Regex, message: &'static str, required: bool) -> Validator {
    Arc::new(move |value| match value {
        None => required.then(|| message.to_owned()),
        Some(Value::String(text)) if regex.is_match(text) => None,
        Some(_) => Some(message.to_owned()),
    })
}

/// The value must be one of `candidates`.
pub fn one_of(candidates: &'static [&'static str], required: bool) -> Validator {
    Arc::new(move |value| {
        let message = || format!("Must be one of [{}]", candidates.iter().join(", "));
        match value {
            None => required.then(message),
            Some(Value::String(text)) if candidates.contains(&text.as_str()) => None,
            Some(_) => Some(message()),
        }
    })
}

/// The value must be present and contain more than whitespace.
pub fn not_blank(message: &'static str) -> Validator {
    Arc::new(move |value| match value {
        Some(Value::String(text)) if !text.trim().is_empty() => None,
        _ => Some(message.to_owned()),
    })
}

pub fn required(message: &'static str) -> Validator {
    Arc::new(move |value| value.is_none().then(|| message.to_owned()))
}

/// The value must be a string of at most `max` characters.
pub fn length(max: usize, message: &'static str, required: bool) -> Validator {
    Arc::new(move |value| match value {
        None => required.then(|| message.to_owned()),
        Some(Value::String(text)) if text.chars().count() <= max => None,
        Some(_) => Some(message.to_owned()),
    })
}

/// If present, the value must start with `prefix`.
pub fn starts_with(prefix: &'static str, message: &'static str) -> Validator {
    Arc::new(move |value| match value {
        None => None,
        Some(Value::String(text)) if text.starts_with(prefix) => None,
        Some(_) => Some(message.to_owned()),
    })
}

/// Durations longer than this are rejected, they can not be added to a point
/// in time.
pub const MAX_DURATION: Duration = Duration::from_secs(1_000 * 31_557_600);

/// If present, the value must be a duration such as `2d` or `1h 30m`, at most
/// [`MAX_DURATION`] long.
pub fn duration() -> Validator {
    Arc::new(|value| match value {
        None => None,
        Some(Value::String(text)) => match humantime::parse_duration(text) {
            Ok(duration) if duration > MAX_DURATION => {
                Some(format!("'{text}' is longer than the maximum duration of 1000 years"))
            }
            Ok(_) => None,
            Err(error) => Some(format!("'{text}' is not a valid simple duration: {error}")),
        },
        Some(other) => Some(format!("'{other}' is not a valid simple duration")),
    })
}

/// If present, the value must be a JSON boolean.
pub fn boolean() -> Validator {
    Arc::new(|value| match value {
        None | Some(Value::Bool(_)) => None,
        Some(_) => Some("Not a valid boolean value.".to_owned()),
    })
}

/// If present, the value must be a non-negative integer.
pub fn unsigned_int() -> Validator {
    Arc::new(|value| match value {
        None => None,
        Some(Value::Number(number)) if number.is_u64() => None,
        Some(_) => Some("Not a valid integer value.".to_owned()),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::LazyLock;

    use rstest::rstest;
    use serde_json::json;

    use super::*;

    static LOWERCASE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new("^[a-z]+$").expect("failed to compile test regex"));

    #[rstest]
    #[case(None, true, true)]
    #[case(None, false, false)]
    #[case(Some(json!("paas")), true, false)]
    #[case(Some(json!("Paas")), true, true)]
    #[case(Some(json!(42)), false, true)]
    fn pattern_validator(
        #[case] value: Option<Value>,
        #[case] required: bool,
        #[case] fails: bool,
    ) {
        let validator = pattern(&LOWERCASE, "lowercase only", required);
        assert_eq!(validator(value.as_ref()).is_some(), fails);
    }

    #[test]
    fn one_of_lists_candidates() {
        let validator = one_of(&["rolling", "recreate"], true);

        assert_eq!(validator(Some(&json!("rolling"))), None);
        assert_eq!(
            validator(Some(&json!("blue-green"))).as_deref(),
            Some("Must be one of [rolling, recreate]")
        );
        assert!(validator(None).is_some());
    }

    #[rstest]
    #[case(json!("2d"), true)]
    #[case(json!("1h 30m"), true)]
    #[case(json!("100y"), true)]
    #[case(json!("292300000000y"), false)]
    #[case(json!("forever"), false)]
    #[case(json!(5), false)]
    fn duration_validator(#[case] value: Value, #[case] valid: bool) {
        assert_eq!(duration()(Some(&value)).is_none(), valid);
    }

    #[rstest]
    #[case(None, true)]
    #[case(Some(json!(true)), true)]
    #[case(Some(json!("true")), false)]
    fn boolean_validator(#[case] value: Option<Value>, #[case] valid: bool) {
        assert_eq!(boolean()(value.as_ref()).is_none(), valid);
    }

    #[rstest]
    #[case(json!(3), true)]
    #[case(json!(-1), false)]
    #[case(json!("three"), false)]
    fn unsigned_int_validator(#[case] value: Value, #[case] valid: bool) {
        assert_eq!(unsigned_int()(Some(&value)).is_none(), valid);
    }

    #[test]
    fn not_blank_rejects_whitespace() {
        let validator = not_blank("Cluster must be set");
        assert!(validator(Some(&json!("  "))).is_some());
        assert!(validator(None).is_some());
        assert!(validator(Some(&json!("utv"))).is_none());
    }
}
