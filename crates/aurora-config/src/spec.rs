//! The read-only view over resolved fields that features work with.
use std::{
    collections::{BTreeMap, BTreeSet},
    str::FromStr,
};

use indexmap::IndexSet;
use serde::de::DeserializeOwned;
use serde_json::Value;
use snafu::{OptionExt as _, ResultExt as _, Snafu};

use crate::{
    field::{AuroraConfigField, Fields, placeholder::Placeholders, value_as_string},
    header::{ApplicationPlatform, DeployState, TemplateType},
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{field} is not set"))]
    MissingField { field: String },

    #[snafu(display("field {field} from {document:?} can not be read as {target}"))]
    ConvertField {
        source: serde_json::Error,
        field: String,
        document: String,
        target: &'static str,
    },

    #[snafu(display("field {field} from {document:?} has the unknown value {value:?}"))]
    UnknownVariant {
        source: strum::ParseError,
        field: String,
        document: String,
        value: String,
    },
}

/// The resolved configuration of one application in one environment.
///
/// Constructed once per request. All accessors are pure.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuroraDeploymentSpec {
    fields: Fields,
}

impl AuroraDeploymentSpec {
    pub fn new(fields: Fields) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&AuroraConfigField> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.field(name).map(|field| &field.value)
    }

    /// The value of `name` as text, see [`value_as_string`].
    pub fn extract(&self, name: &str) -> Result<String> {
        self.extract_with(name, AuroraConfigField::value_as_string)
    }

    pub fn extract_with<T>(&self, name: &str, mapper: impl FnOnce(&AuroraConfigField) -> T) -> Result<T> {
        self.field(name)
            .map(mapper)
            .context(MissingFieldSnafu { field: name })
    }

    pub fn extract_or_none(&self, name: &str) -> Option<String> {
        self.field(name).map(AuroraConfigField::value_as_string)
    }

    pub fn extract_or_default(&self, name: &str, default: &str) -> String {
        self.extract_or_none(name)
            .unwrap_or_else(|| default.to_owned())
    }

    /// Deserializes the value of `name`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        self.get_or_none(name)?
            .context(MissingFieldSnafu { field: name })
    }

    pub fn get_or_none<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        self.field(name)
            .map(|field| {
                T::deserialize(&field.value).context(ConvertFieldSnafu {
                    field: name,
                    document: &field.source.name,
                    target: std::any::type_name::<T>(),
                })
            })
            .transpose()
    }

    pub fn get_or<T: DeserializeOwned>(&self, name: &str, default: T) -> Result<T> {
        Ok(self.get_or_none(name)?.unwrap_or(default))
    }

    /// Parses a string field into one of the variants of `T`.
    pub fn get_enum<T: FromStr<Err = strum::ParseError>>(&self, name: &str) -> Result<T> {
        let field = self.field(name).context(MissingFieldSnafu { field: name })?;
        let value = field.value_as_string();
        value.parse().context(UnknownVariantSnafu {
            field: name,
            document: &field.source.name,
            value: &value,
        })
    }

    /// All fields whose name contains `substring`, keyed by name.
    pub fn find_all<T>(
        &self,
        substring: &str,
        mapper: impl Fn(&str, &AuroraConfigField) -> T,
    ) -> BTreeMap<String, T> {
        self.fields
            .iter()
            .filter(|(name, _)| name.contains(substring))
            .map(|(name, field)| (name.clone(), mapper(name, field)))
            .collect()
    }

    /// Fields below `prefix/`, keyed by the remainder of their name.
    pub fn sub_keys(&self, prefix: &str) -> BTreeMap<&str, &AuroraConfigField> {
        let prefix = format!("{prefix}/");
        self.fields
            .iter()
            .filter_map(|(name, field)| {
                name.strip_prefix(&prefix).map(|rest| (rest, field))
            })
            .collect()
    }

    pub fn has_sub_keys(&self, prefix: &str) -> bool {
        !self.sub_keys(prefix).is_empty()
    }

    /// The distinct first segments below `prefix/`, such as the database
    /// names below `database`.
    pub fn sub_key_names(&self, prefix: &str) -> BTreeSet<String> {
        self.sub_keys(prefix)
            .keys()
            .filter_map(|rest| rest.split('/').next())
            .map(ToOwned::to_owned)
            .collect()
    }

    /// `config/<file>/<key>` fields reshaped into `{file: {key: value}}`.
    pub fn get_config_map(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        let mut files: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for (name, field) in self.sub_keys("config") {
            if let Some((file, key)) = name.split_once('/') {
                files
                    .entry(file.to_owned())
                    .or_default()
                    .insert(key.to_owned(), field.value_as_string());
            }
        }
        files
    }

    /// `config/<key>` fields, used as environment variables.
    pub fn get_config_env(&self) -> BTreeMap<String, String> {
        self.sub_keys("config")
            .into_iter()
            .filter(|(name, _)| !name.contains('/'))
            .map(|(name, field)| (name.to_owned(), field.value_as_string()))
            .collect()
    }

    /// True if `name` is configured as a scalar rather than as an object of
    /// sub fields.
    ///
    /// A scalar wins over sub fields declared in documents of lower or equal
    /// precedence.
    pub fn is_simplified_config(&self, name: &str) -> bool {
        let Some(field) = self.field(name) else {
            return false;
        };
        if !field.can_be_simplified {
            return false;
        }
        !self
            .sub_keys(name)
            .values()
            .any(|sub_field| sub_field.source.file_type > field.source.file_type)
    }

    pub fn is_simplified_and_enabled(&self, name: &str) -> bool {
        self.is_simplified_config(name) && self.value(name) == Some(&Value::Bool(true))
    }

    pub fn is_simplified_and_disabled(&self, name: &str) -> bool {
        self.is_simplified_config(name) && self.value(name) == Some(&Value::Bool(false))
    }

    /// Calls `f` with `name` when the feature block is switched on, either as
    /// `"<name>": true` or as an object without `"enabled": false`.
    pub fn feature_enabled<T>(&self, name: &str, f: impl FnOnce(&str) -> T) -> Option<T> {
        let enabled = if self.is_simplified_config(name) {
            self.value(name) == Some(&Value::Bool(true))
        } else {
            self.value(&format!("{name}/enabled")) != Some(&Value::Bool(false))
        };
        enabled.then(|| f(name))
    }

    /// Reads `<root>/<index>/<suffix>`, falling back to `<root>Defaults/<suffix>`.
    pub fn get_or_default<T: DeserializeOwned>(&self, root: &str, index: &str, suffix: &str) -> Result<T> {
        match self.get_or_none(&format!("{root}/{index}/{suffix}"))? {
            Some(value) => Ok(value),
            None => self.get(&format!("{root}Defaults/{suffix}")),
        }
    }

    /// Accepts `"a, b"` as well as `["a", "b"]`. Blank entries are dropped,
    /// order is kept.
    pub fn delimited_string_or_array_as_set(&self, name: &str) -> IndexSet<String> {
        let entries: Vec<String> = match self.value(name) {
            Some(Value::String(text)) => text.split(',').map(ToOwned::to_owned).collect(),
            Some(Value::Array(items)) => items.iter().map(value_as_string).collect(),
            _ => Vec::new(),
        };
        entries
            .into_iter()
            .map(|entry| entry.trim().to_owned())
            .filter(|entry| !entry.is_empty())
            .collect()
    }

    /// The fields to show to a user, optionally without defaults.
    pub fn present(&self, include_defaults: bool) -> BTreeMap<&str, &AuroraConfigField> {
        self.fields
            .iter()
            .filter(|(_, field)| include_defaults || !field.is_default())
            .map(|(name, field)| (name.as_str(), field))
            .collect()
    }

    pub fn name(&self) -> Result<String> {
        self.extract("name")
    }

    /// `env/name` if set, `envName` otherwise.
    pub fn env_name(&self) -> Result<String> {
        match self.extract_or_none("env/name") {
            Some(env_name) => Ok(env_name),
            None => self.extract("envName"),
        }
    }

    pub fn affiliation(&self) -> Result<String> {
        self.extract("affiliation")
    }

    pub fn cluster(&self) -> Result<String> {
        self.extract("cluster")
    }

    pub fn segment(&self) -> Option<String> {
        self.extract_or_none("segment")
    }

    pub fn namespace(&self) -> Result<String> {
        Ok(namespace(&self.affiliation()?, &self.env_name()?))
    }

    pub fn template_type(&self) -> Result<TemplateType> {
        self.get_enum("type")
    }

    pub fn application_platform(&self) -> Result<ApplicationPlatform> {
        self.get_enum("applicationPlatform")
    }

    pub fn deploy_state(&self) -> Result<DeployState> {
        self.get_enum("deployState")
    }

    pub fn release_to(&self) -> Option<String> {
        self.extract_or_none("releaseTo").filter(|release_to| !release_to.is_empty())
    }

    /// The placeholder values available for `@key@` substitution. Header
    /// fields that are not resolved are left out.
    pub fn placeholders(&self) -> Placeholders {
        let env = self.env_name().ok();
        Placeholders::new(
            [
                ("name", self.extract_or_none("name")),
                ("env", env),
                ("affiliation", self.extract_or_none("affiliation")),
                ("cluster", self.extract_or_none("cluster")),
                ("segment", self.segment()),
            ]
            .into_iter()
            .filter_map(|(key, value)| value.map(|value| (key, value))),
        )
    }
}

/// `affiliation` for a blank environment, `affiliation<env>` for an
/// environment starting with `-` and `affiliation-env` otherwise.
pub fn namespace(affiliation: &str, env_name: &str) -> String {
    if env_name.is_empty() {
        affiliation.to_owned()
    } else if env_name.starts_with('-') {
        format!("{affiliation}{env_name}")
    } else {
        format!("{affiliation}-{env_name}")
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::{
        document::ConfigDocument,
        field::{FieldHandler, resolver::resolve},
    };

    fn spec(documents: &[ConfigDocument], handlers: &[FieldHandler]) -> AuroraDeploymentSpec {
        AuroraDeploymentSpec::new(resolve(handlers, documents))
    }

    #[rstest]
    #[case("paas", "utv", "paas-utv")]
    #[case("paas", "", "paas")]
    #[case("paas", "-utv", "paas-utv")]
    fn namespace_rules(#[case] affiliation: &str, #[case] env: &str, #[case] expected: &str) {
        assert_eq!(namespace(affiliation, env), expected);
    }

    #[test]
    fn extract_reports_missing_fields() {
        let spec = AuroraDeploymentSpec::default();
        assert_eq!(
            spec.extract("groupId").expect_err("groupId is unset").to_string(),
            "groupId is not set"
        );
        assert_eq!(spec.extract_or_none("groupId"), None);
        assert_eq!(spec.extract_or_default("groupId", "no.skatteetaten"), "no.skatteetaten");
    }

    #[test]
    fn typed_access() {
        let spec = spec(
            &[ConfigDocument::new(
                "reference.json",
                json!({"replicas": 3, "pause": true, "type": "deploy"}),
            )],
            &[
                FieldHandler::new("replicas"),
                FieldHandler::new("pause"),
                FieldHandler::new("type"),
            ],
        );

        assert_eq!(spec.get::<u32>("replicas").expect("replicas is a number"), 3);
        assert!(spec.get::<bool>("pause").expect("pause is a boolean"));
        assert!(spec.get::<bool>("replicas").is_err());
        assert_eq!(spec.template_type().expect("type is known"), TemplateType::Deploy);
        assert_eq!(spec.extract("replicas").expect("replicas is set"), "3");
    }

    #[test]
    fn config_map_and_env() {
        let spec = spec(
            &[ConfigDocument::new(
                "reference.json",
                json!({"config": {"FOO": "bar", "latest": {"a": 1, "b": "two"}}}),
            )],
            &[
                FieldHandler::new("config/FOO"),
                FieldHandler::new("config/latest/a"),
                FieldHandler::new("config/latest/b"),
            ],
        );

        assert_eq!(
            spec.get_config_map(),
            BTreeMap::from([(
                "latest".to_owned(),
                BTreeMap::from([
                    ("a".to_owned(), "1".to_owned()),
                    ("b".to_owned(), "two".to_owned())
                ])
            )])
        );
        assert_eq!(
            spec.get_config_env(),
            BTreeMap::from([("FOO".to_owned(), "bar".to_owned())])
        );
    }

    fn route_handlers() -> Vec<FieldHandler> {
        vec![
            FieldHandler::new("route").simplified().with_default(false),
            FieldHandler::new("route/foo/host"),
        ]
    }

    #[test]
    fn simplified_config() {
        let spec = spec(
            &[ConfigDocument::new("utv/reference.json", json!({"route": true}))],
            &route_handlers(),
        );

        assert!(spec.is_simplified_config("route"));
        assert!(spec.is_simplified_and_enabled("route"));
        assert_eq!(spec.feature_enabled("route", str::len), Some(5));
    }

    #[test]
    fn expanded_config() {
        let spec = spec(
            &[ConfigDocument::new(
                "utv/reference.json",
                json!({"route": {"foo": {"host": "bar"}}}),
            )],
            &route_handlers(),
        );

        assert!(!spec.is_simplified_config("route"));
        assert!(!spec.is_simplified_and_disabled("route"));
        assert_eq!(spec.sub_key_names("route"), BTreeSet::from(["foo".to_owned()]));
    }

    #[test]
    fn scalar_in_more_specific_document_wins_over_object() {
        let spec = spec(
            &[
                ConfigDocument::new("reference.json", json!({"route": {"foo": {"host": "bar"}}})),
                ConfigDocument::new("utv/reference.json", json!({"route": false})),
            ],
            &route_handlers(),
        );

        assert!(spec.is_simplified_and_disabled("route"));
        assert_eq!(spec.feature_enabled("route", |_| ()), None);
    }

    #[test]
    fn get_or_default_falls_back_to_defaults_root() {
        let spec = spec(
            &[ConfigDocument::new(
                "reference.json",
                json!({"route": {"foo": {}, "bar": {"host": "custom"}}}),
            )],
            &[
                FieldHandler::new("route/foo/host"),
                FieldHandler::new("route/bar/host"),
                FieldHandler::new("routeDefaults/host").with_default("default-host"),
            ],
        );

        let host = |index| spec.get_or_default::<String>("route", index, "host").expect("host resolves");
        assert_eq!(host("foo"), "default-host");
        assert_eq!(host("bar"), "custom");
    }

    #[rstest]
    #[case(json!("a, b,,c "), vec!["a", "b", "c"])]
    #[case(json!(["b", " a", ""]), vec!["b", "a"])]
    #[case(json!(true), vec![])]
    fn delimited_sets(#[case] value: Value, #[case] expected: Vec<&str>) {
        let spec = spec(
            &[ConfigDocument::new("reference.json", json!({"webseal": {"roles": value}}))],
            &[FieldHandler::new("webseal/roles")],
        );

        let roles: Vec<_> = spec.delimited_string_or_array_as_set("webseal/roles").into_iter().collect();
        assert_eq!(roles, expected);
    }

    #[test]
    fn placeholders_skip_unresolved_header_fields() {
        let spec = spec(
            &[ConfigDocument::new("about.json", json!({"affiliation": "paas", "envName": "utv"}))],
            &[FieldHandler::new("affiliation"), FieldHandler::new("envName")],
        );

        let placeholders = spec.placeholders();
        assert_eq!(placeholders.get("env"), Some("utv"));
        assert_eq!(placeholders.get("name"), None);
        assert_eq!(placeholders.replace("@affiliation@-@env@"), "paas-utv");
    }
}
