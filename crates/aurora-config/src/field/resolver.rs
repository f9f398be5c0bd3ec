//! Resolves every field handler to exactly one value and the document it came from.
//!
//! Documents are given in ascending precedence order. For each handler the
//! list is walked from the end and the first document holding a value at the
//! handler's path wins. Documents of equal precedence are therefore decided by
//! their position: the later one wins.
use indexmap::IndexMap;
use tracing::debug;

use super::{AuroraConfigField, FieldHandler, FieldSource, Fields};
use crate::document::ConfigDocument;

/// Resolves `handlers` against `documents`.
///
/// Handlers without a matching document fall back to their default. Handlers
/// with neither yield no entry, reporting that is up to the validators.
/// Duplicate handler names are resolved once, using the first declaration.
pub fn resolve<'a>(
    handlers: impl IntoIterator<Item = &'a FieldHandler>,
    documents: &[ConfigDocument],
) -> Fields {
    unique(handlers)
        .into_values()
        .filter_map(|handler| {
            resolve_field(handler, documents).map(|field| (handler.name.clone(), field))
        })
        .collect()
}

/// Keeps the first declaration of every handler name, in declaration order.
pub fn unique<'a>(
    handlers: impl IntoIterator<Item = &'a FieldHandler>,
) -> IndexMap<&'a str, &'a FieldHandler> {
    let mut unique = IndexMap::new();
    for handler in handlers {
        unique.entry(handler.name.as_str()).or_insert(handler);
    }
    unique
}

fn resolve_field(handler: &FieldHandler, documents: &[ConfigDocument]) -> Option<AuroraConfigField> {
    let matched = documents.iter().rev().find_map(|document| {
        let value = handler.value_in(document);
        debug!(
            field = %handler.name,
            document = %document.name,
            found = value.is_some(),
            "looked up field in document"
        );
        value.map(|value| (document, value))
    });

    match matched {
        Some((document, value)) => Some(AuroraConfigField {
            value: value.clone(),
            source: FieldSource::document(document),
            can_be_simplified: handler.can_be_simplified,
        }),
        None => handler.default_value.as_ref().map(|value| AuroraConfigField {
            value: value.clone(),
            source: FieldSource::synthetic(&handler.default_source),
            can_be_simplified: handler.can_be_simplified,
        }),
    }
}
