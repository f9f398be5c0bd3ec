//! Declared configuration fields and their resolved values.
//!
//! A [`FieldHandler`] names one logical configuration field (such as
//! `database/REFERENCE`) together with the JSON pointer it is read from, an
//! optional default and a validator. The [`resolver`] turns a set of handlers
//! and a list of documents into [`Fields`].
use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use serde::Serialize;
use serde_json::Value;
use snafu::{Snafu, ensure};

use crate::document::{ConfigDocument, ConfigFileType};

pub mod discovery;
pub mod placeholder;
pub mod resolver;
pub mod validators;

/// The source name of fields that fell back to their handler's default.
pub const DEFAULT_SOURCE: &str = "default";

/// The source name of fields that are added by the engine itself.
pub const STATIC_SOURCE: &str = "static";

/// Inspects the resolved raw value of a field, [`None`] when the field did not
/// resolve, and returns an error message when the value is not acceptable.
pub type Validator = Arc<dyn Fn(Option<&Value>) -> Option<String> + Send + Sync>;

/// All resolved fields of one request, keyed by handler name.
pub type Fields = BTreeMap<String, AuroraConfigField>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "field handler name {name:?} is malformed, it must be a '/' separated path of non-empty segments"
    ))]
    MalformedName { name: String },
}

/// How a failed validator is reported.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Severity {
    #[default]
    Error,
    Warning,
}

#[derive(Clone)]
pub struct FieldHandler {
    pub name: String,
    pub path: String,
    pub default_value: Option<Value>,
    pub default_source: String,
    pub validator: Option<Validator>,

    /// The field may be configured either as a scalar (`"database": true`) or
    /// as an object of sub fields (`"database": {..}`). Objects never count as
    /// a value for the handler itself.
    pub can_be_simplified: bool,

    /// Restricts the file types the field may be declared in. [`None`] allows all.
    pub allowed_file_types: Option<Vec<ConfigFileType>>,
    pub severity: Severity,
}

impl Debug for FieldHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldHandler")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("default_value", &self.default_value)
            .field("default_source", &self.default_source)
            .field("has_validator", &self.validator.is_some())
            .field("can_be_simplified", &self.can_be_simplified)
            .field("allowed_file_types", &self.allowed_file_types)
            .field("severity", &self.severity)
            .finish()
    }
}

impl FieldHandler {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            path: format!("/{name}"),
            name,
            default_value: None,
            default_source: DEFAULT_SOURCE.to_owned(),
            validator: None,
            can_be_simplified: false,
            allowed_file_types: None,
            severity: Severity::Error,
        }
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn with_default_source(mut self, source: impl Into<String>) -> Self {
        self.default_source = source.into();
        self
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn simplified(mut self) -> Self {
        self.can_be_simplified = true;
        self
    }

    pub fn allowed_in(mut self, file_types: impl IntoIterator<Item = ConfigFileType>) -> Self {
        self.allowed_file_types = Some(file_types.into_iter().collect());
        self
    }

    pub fn as_warning(mut self) -> Self {
        self.severity = Severity::Warning;
        self
    }

    /// Runs the validator, if any.
    pub fn validate(&self, value: Option<&Value>) -> Option<String> {
        self.validator.as_ref().and_then(|validator| validator(value))
    }

    pub fn is_allowed_in(&self, file_type: ConfigFileType) -> bool {
        self.allowed_file_types
            .as_ref()
            .is_none_or(|allowed| file_type == ConfigFileType::Default || allowed.contains(&file_type))
    }

    /// The value this handler reads from `document`, if any.
    pub fn value_in<'a>(&self, document: &'a ConfigDocument) -> Option<&'a Value> {
        document
            .at(&self.path)
            .filter(|value| !(self.can_be_simplified && value.is_object()))
    }

    /// Rejects empty names, empty segments and surrounding whitespace.
    pub fn check_name(&self) -> Result<(), Error> {
        let name = &self.name;
        ensure!(
            !name.is_empty()
                && name.trim() == name
                && name.split('/').all(|segment| !segment.is_empty()),
            MalformedNameSnafu { name }
        );
        Ok(())
    }
}

/// Where a resolved value came from.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSource {
    pub name: String,
    pub file_type: ConfigFileType,
}

impl FieldSource {
    pub fn document(document: &ConfigDocument) -> Self {
        Self {
            name: document.name.clone(),
            file_type: document.file_type,
        }
    }

    pub fn synthetic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file_type: ConfigFileType::Default,
        }
    }

    /// True for defaults and engine supplied values.
    pub fn is_synthetic(&self) -> bool {
        self.file_type == ConfigFileType::Default
    }
}

/// The resolution result of one [`FieldHandler`].
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuroraConfigField {
    pub value: Value,
    pub source: FieldSource,

    #[serde(skip)]
    pub can_be_simplified: bool,
}

impl AuroraConfigField {
    pub fn is_default(&self) -> bool {
        self.source.is_synthetic()
    }

    /// Strings as they are, every other value as JSON.
    pub fn value_as_string(&self) -> String {
        value_as_string(&self.value)
    }
}

pub fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        other => other.to_string(),
    }
}
