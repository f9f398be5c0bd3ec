//! Derives handlers for open-ended configuration trees from the documents
//! themselves, e.g. one set of handlers per configured route or database.
use std::collections::BTreeSet;

use serde_json::Value;

use super::{FieldHandler, Validator};
use crate::document::ConfigDocument;

/// The union of object keys found at `/<name>` across `documents`.
pub fn sub_keys(documents: &[ConfigDocument], name: &str) -> BTreeSet<String> {
    let pointer = format!("/{name}");
    documents
        .iter()
        .filter_map(|document| document.at(&pointer).and_then(Value::as_object))
        .flat_map(|object| object.keys().cloned())
        .collect()
}

/// Like [`sub_keys`], but every key is prefixed with `<name>/`.
pub fn sub_keys_expanded(documents: &[ConfigDocument], name: &str) -> Vec<String> {
    sub_keys(documents, name)
        .into_iter()
        .map(|key| format!("{name}/{key}"))
        .collect()
}

/// One handler per key below `prefix`, with a validator chosen per key.
pub fn sub_handlers(
    documents: &[ConfigDocument],
    prefix: &str,
    validator: impl Fn(&str) -> Option<Validator>,
) -> Vec<FieldHandler> {
    sub_keys(documents, prefix)
        .into_iter()
        .map(|key| {
            let handler = FieldHandler::new(format!("{prefix}/{key}"));
            match validator(&key) {
                Some(validator) => handler.with_validator(validator),
                None => handler,
            }
        })
        .collect()
}

/// Handlers for the `config` tree.
///
/// Scalars directly below `config` become `config/<key>` (environment
/// variables), objects become one handler per `config/<file>/<key>`.
pub fn config_field_handlers(documents: &[ConfigDocument]) -> Vec<FieldHandler> {
    sub_keys(documents, "config")
        .into_iter()
        .flat_map(|key| {
            let name = format!("config/{key}");
            let fields = sub_keys(documents, &name);
            if fields.is_empty() {
                vec![FieldHandler::new(name)]
            } else {
                fields
                    .into_iter()
                    .map(|field| FieldHandler::new(format!("{name}/{field}")))
                    .collect()
            }
        })
        .collect()
}

/// Every pointer to a non-object value in `value`. Objects nested deeper than
/// `max_level` are reported as a single pointer.
pub fn all_pointers(value: &Value, max_level: usize) -> Vec<String> {
    fn collect(pointer: &str, value: &Value, level: usize, max_level: usize, out: &mut Vec<String>) {
        match value.as_object() {
            Some(object) if level < max_level => {
                for (key, child) in object {
                    collect(&format!("{pointer}/{key}"), child, level + 1, max_level, out);
                }
            }
            _ => out.push(pointer.to_owned()),
        }
    }

    let mut pointers = Vec::new();
    if let Some(object) = value.as_object() {
        for (key, child) in object {
            collect(&format!("/{key}"), child, 1, max_level, &mut pointers);
        }
    }
    pointers
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn documents() -> Vec<ConfigDocument> {
        vec![
            ConfigDocument::new(
                "reference.json",
                json!({
                    "database": {"REFERENCE": "auto"},
                    "config": {"FOO": "bar", "latest": {"a": 1}},
                }),
            ),
            ConfigDocument::new(
                "utv/reference.json",
                json!({
                    "database": {"OTHER": {"enabled": true}},
                    "config": {"latest": {"b": 2}},
                }),
            ),
        ]
    }

    #[test]
    fn sub_keys_are_merged_across_documents() {
        let keys: Vec<_> = sub_keys(&documents(), "database").into_iter().collect();
        assert_eq!(keys, ["OTHER", "REFERENCE"]);
        assert_eq!(
            sub_keys_expanded(&documents(), "database"),
            ["database/OTHER", "database/REFERENCE"]
        );
    }

    #[test]
    fn config_handlers_distinguish_env_and_files() {
        let names: Vec<_> = config_field_handlers(&documents())
            .into_iter()
            .map(|handler| handler.name)
            .collect();

        assert_eq!(names, ["config/FOO", "config/latest/a", "config/latest/b"]);
    }

    #[test]
    fn sub_handlers_attach_validators() {
        let documents = [ConfigDocument::new(
            "reference.json",
            json!({"route": {"annotations": {"a": "1", "b/c": "2"}}}),
        )];
        let handlers = sub_handlers(&documents, "route/annotations", |key| {
            key.contains('/')
                .then(|| crate::field::validators::required("unused"))
        });

        assert_eq!(handlers.len(), 2);
        assert!(handlers[0].validator.is_none());
        assert_eq!(handlers[1].name, "route/annotations/b/c");
        assert!(handlers[1].validator.is_some());
    }

    #[test]
    fn pointers_stop_at_max_level() {
        let value = json!({
            "name": "reference",
            "route": {"foo": {"annotations": {"x|y": "z"}}},
            "empty": {},
        });

        assert_eq!(
            all_pointers(&value, 3),
            ["/name", "/route/foo/annotations"]
        );
    }
}
