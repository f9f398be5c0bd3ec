//! `@name@` style placeholders in string values.
use std::collections::BTreeMap;

use serde_json::Value;

use super::Fields;

/// Placeholder values keyed by their name without delimiters.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Placeholders(BTreeMap<String, String>);

impl Placeholders {
    pub fn new(values: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>) -> Self {
        Self(
            values
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Replaces every known `@key@` in `input`. Unknown placeholders are kept.
    pub fn replace(&self, input: &str) -> String {
        if !input.contains('@') {
            return input.to_owned();
        }
        self.0.iter().fold(input.to_owned(), |text, (key, value)| {
            text.replace(&format!("@{key}@"), value)
        })
    }

    /// Substitutes placeholders in every string value, including strings
    /// nested in arrays and objects.
    pub fn apply(&self, fields: &mut Fields) {
        for field in fields.values_mut() {
            self.apply_value(&mut field.value);
        }
    }

    fn apply_value(&self, value: &mut Value) {
        match value {
            Value::String(text) => *text = self.replace(text),
            Value::Array(items) => items.iter_mut().for_each(|item| self.apply_value(item)),
            Value::Object(object) => object.values_mut().for_each(|item| self.apply_value(item)),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn placeholders() -> Placeholders {
        Placeholders::new([("name", "reference"), ("affiliation", "paas"), ("env", "utv")])
    }

    #[rstest]
    #[case("@name@-@affiliation@-@env@", "reference-paas-utv")]
    #[case("no placeholders", "no placeholders")]
    #[case("@segment@-x", "@segment@-x")]
    #[case("mail@example.com", "mail@example.com")]
    fn replaces_known_placeholders(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(placeholders().replace(input), expected);
    }
}
