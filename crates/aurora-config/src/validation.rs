//! Field level validation and the structured errors it produces.
//!
//! Validation never stops at the first problem. Every handler is checked and
//! all findings are returned together, so that a configuration author can fix
//! everything in one go.
use std::{fmt::Display, sync::LazyLock};

use const_format::concatcp;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use strum::Display as StrumDisplay;

use crate::{
    document::{ApplicationRef, ConfigDocument},
    field::{FieldHandler, Fields, Severity, discovery::all_pointers, resolver::unique},
};

/// Pointers nested deeper than this are checked as a whole.
const MAX_POINTER_LEVEL: usize = 3;

const NAME_FMT: &str = "[a-z][-a-z0-9]{0,38}[a-z0-9]";
pub const NAME_ERROR_MSG: &str = "Name must be alphanumeric and no more than 40 characters";

const AFFILIATION_FMT: &str = "[a-z]{1,10}";
pub const AFFILIATION_ERROR_MSG: &str =
    "Affiliation can only contain letters and must be no longer than 10 characters";

const ENV_NAME_FMT: &str = "[a-z0-9\\-]{0,52}";
pub const ENV_NAME_ERROR_MSG: &str = "Environment must consist of lower case alphanumeric characters or '-'. It must be no longer than 52 characters.";

const VERSION_FMT: &str = "[\\w][\\w.-]{0,127}";
pub const VERSION_ERROR_MSG: &str =
    "Version must be a 128 characters or less, alphanumeric and can contain dots and dashes";

// Lazily initialized regular expressions
pub static NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concatcp!("^", NAME_FMT, "$")).expect("failed to compile name regex")
});

pub static AFFILIATION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concatcp!("^", AFFILIATION_FMT, "$")).expect("failed to compile affiliation regex")
});

pub static ENV_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concatcp!("^", ENV_NAME_FMT, "$"))
        .expect("failed to compile environment name regex")
});

pub static VERSION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concatcp!("^", VERSION_FMT, "$")).expect("failed to compile version regex")
});

/// Fields that may only be set in an `about` file.
const ABOUT_SOURCE_FIELDS: &[&str] = &[
    "affiliation",
    "envName",
    "env/name",
    "env/ttl",
    "env/autoDeploy",
];
const ABOUT_SOURCE_PREFIXES: &[&str] = &["permissions/"];

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, StrumDisplay)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    /// A validator rejected a resolved value.
    Illegal,

    /// A required field did not resolve.
    Missing,

    /// A document contains a pointer that no handler maps.
    Invalid,

    /// A feature rejected a combination of fields.
    Generic,

    /// Reported to the caller but does not fail validation.
    Warning,
}

/// A single finding, attributable to a field and the document it came from.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFieldError {
    pub error_type: ErrorType,
    pub field: Option<String>,
    pub document: Option<String>,
    pub value: Option<Value>,
    pub message: String,
}

impl ConfigFieldError {
    pub fn missing(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: ErrorType::Missing,
            field: Some(field.into()),
            document: None,
            value: None,
            message: message.into(),
        }
    }

    pub fn illegal(
        field: impl Into<String>,
        document: impl Into<String>,
        value: Option<Value>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            error_type: ErrorType::Illegal,
            field: Some(field.into()),
            document: Some(document.into()),
            value,
            message: message.into(),
        }
    }

    pub fn invalid(pointer: impl Into<String>, document: impl Into<String>) -> Self {
        let pointer = pointer.into();
        Self {
            error_type: ErrorType::Invalid,
            message: format!("{pointer} is not a valid config field pointer"),
            field: Some(pointer),
            document: Some(document.into()),
            value: None,
        }
    }

    /// A cross-field error raised by a feature.
    pub fn generic(message: impl Into<String>) -> Self {
        Self {
            error_type: ErrorType::Generic,
            field: None,
            document: None,
            value: None,
            message: message.into(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn into_warning(mut self) -> Self {
        self.error_type = ErrorType::Warning;
        self
    }

    pub fn is_warning(&self) -> bool {
        self.error_type == ErrorType::Warning
    }
}

impl Display for ConfigFieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error_type)?;
        if let Some(field) = &self.field {
            write!(f, " field={field}")?;
        }
        if let Some(document) = &self.document {
            write!(f, " file={document}")?;
        }
        write!(f, " message={}", self.message)
    }
}

/// All errors discovered while validating one application.
#[derive(Debug, PartialEq, Serialize)]
pub struct ValidationErrors {
    pub application: ApplicationRef,
    pub errors: Vec<ConfigFieldError>,
}

impl ValidationErrors {
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Config for application {} in environment {} contains errors:",
            self.application.application, self.application.environment
        )?;
        for error in &self.errors {
            write!(f, "\n{error}")?;
        }
        Ok(())
    }
}
impl std::error::Error for ValidationErrors {}

fn requires_about_source(field: &str) -> bool {
    ABOUT_SOURCE_FIELDS.contains(&field)
        || ABOUT_SOURCE_PREFIXES
            .iter()
            .any(|prefix| field.starts_with(prefix))
}

fn is_about_source(name: &str) -> bool {
    name.rsplit('/')
        .next()
        .is_some_and(|file| file.starts_with("about"))
}

/// Runs every handler's validator against its resolved value and checks where
/// each value was declared.
///
/// With `full_validation`, pointers in `documents` that no handler maps are
/// reported as well.
pub fn validate_fields(
    handlers: &[FieldHandler],
    fields: &Fields,
    documents: &[ConfigDocument],
    full_validation: bool,
) -> Vec<ConfigFieldError> {
    let handlers = unique(handlers);
    let mut errors = Vec::new();

    for handler in handlers.values() {
        let finding = match fields.get(&handler.name) {
            None => handler
                .validate(None)
                .map(|message| ConfigFieldError::missing(&handler.name, message)),
            Some(field) => {
                let document = &field.source.name;
                if !handler.is_allowed_in(field.source.file_type) {
                    errors.push(ConfigFieldError::illegal(
                        &handler.name,
                        document,
                        Some(field.value.clone()),
                        format!(
                            "Field {} can not be declared in a file of type {}",
                            handler.name, field.source.file_type
                        ),
                    ));
                }
                if requires_about_source(&handler.name)
                    && !field.is_default()
                    && !is_about_source(document)
                {
                    errors.push(ConfigFieldError::illegal(
                        &handler.name,
                        document,
                        Some(field.value.clone()),
                        format!(
                            "Invalid Source field={} requires an about source. Actual source is source={document}",
                            handler.name
                        ),
                    ));
                }
                handler.validate(Some(&field.value)).map(|message| {
                    ConfigFieldError::illegal(
                        &handler.name,
                        document,
                        Some(field.value.clone()),
                        message,
                    )
                })
            }
        };

        if let Some(finding) = finding {
            errors.push(match handler.severity {
                Severity::Error => finding,
                Severity::Warning => finding.into_warning(),
            });
        }
    }

    if full_validation {
        errors.extend(unmapped_pointers(&handlers, documents));
    }

    errors
}

fn unmapped_pointers<'a>(
    handlers: &'a indexmap::IndexMap<&'a str, &'a FieldHandler>,
    documents: &'a [ConfigDocument],
) -> impl Iterator<Item = ConfigFieldError> + 'a {
    // A pointer at the maximum level may stand for a whole object, it is
    // mapped if a handler reaches into it.
    let is_mapped = |pointer: &str| {
        let collapsed = pointer.matches('/').count() == MAX_POINTER_LEVEL;
        handlers.values().any(|handler| {
            let path = handler.path.as_str();
            path == pointer
                || collapsed
                    && path
                        .strip_prefix(pointer)
                        .is_some_and(|rest| rest.starts_with('/'))
        })
    };

    documents.iter().flat_map(move |document| {
        all_pointers(&document.contents, MAX_POINTER_LEVEL)
            .into_iter()
            .filter(|pointer| !is_mapped(pointer.as_str()))
            .map(|pointer| ConfigFieldError::invalid(pointer, &document.name))
            .collect::<Vec<_>>()
    })
}
