//! Configuration documents and the file naming convention of an AuroraConfig.
//!
//! An AuroraConfig is the set of JSON documents belonging to one affiliation:
//!
//! * `about.json` carries affiliation wide defaults,
//! * `<app>.json` carries cross-environment defaults for one application,
//! * `<env>/about.json` carries defaults for one environment,
//! * `<env>/<app>.json` is the most specific non-override source.
//!
//! Override documents with the same names may be supplied with a request and
//! take precedence over all of the above.
use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{OptionExt as _, ResultExt as _, Snafu, ensure};
use strum::Display as StrumDisplay;
use tracing::debug;

pub const ABOUT_FILE: &str = "about.json";
const JSON_SUFFIX: &str = ".json";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("document {name:?} does not contain valid JSON"))]
    ParseDocument {
        source: serde_json::Error,
        name: String,
    },

    #[snafu(display("document {name:?} must contain a JSON object"))]
    NotAnObject { name: String },

    #[snafu(display(
        "Unable to merge files because some required files are missing. Missing {missing:?}."
    ))]
    MissingRequiredFiles { missing: Vec<String> },

    #[snafu(display(
        "application reference {input:?} must be in the form <environment>/<application>"
    ))]
    InvalidApplicationRef { input: String },
}

/// The role a document plays in the layering, ordered from lowest to highest
/// precedence.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, StrumDisplay,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfigFileType {
    Default,
    Global,
    GlobalOverride,
    Base,
    BaseOverride,
    Env,
    EnvOverride,
    App,
    AppOverride,
}

impl ConfigFileType {
    /// Classifies a document by its name alone.
    pub fn from_name(name: &str, is_override: bool) -> Self {
        let about = |segment: &str| segment.starts_with("about");
        let file_type = match name.split_once('/') {
            None if about(name) => Self::Global,
            None => Self::Base,
            Some((_, file)) if about(file) => Self::Env,
            Some(_) => Self::App,
        };

        if is_override {
            file_type.as_override()
        } else {
            file_type
        }
    }

    pub fn as_override(self) -> Self {
        match self {
            Self::Global => Self::GlobalOverride,
            Self::Base => Self::BaseOverride,
            Self::Env => Self::EnvOverride,
            Self::App => Self::AppOverride,
            other => other,
        }
    }

    pub fn is_override(self) -> bool {
        matches!(
            self,
            Self::GlobalOverride | Self::BaseOverride | Self::EnvOverride | Self::AppOverride
        )
    }
}

/// An immutable, named unit of configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    pub name: String,
    pub contents: Value,

    #[serde(default)]
    pub is_override: bool,

    #[serde(default)]
    pub is_default: bool,

    #[serde(default)]
    pub version: Option<String>,

    pub file_type: ConfigFileType,
}

impl ConfigDocument {
    pub fn new(name: impl Into<String>, contents: Value) -> Self {
        let name = name.into();
        Self {
            file_type: ConfigFileType::from_name(&name, false),
            name,
            contents,
            is_override: false,
            is_default: false,
            version: None,
        }
    }

    pub fn new_override(name: impl Into<String>, contents: Value) -> Self {
        let name = name.into();
        Self {
            file_type: ConfigFileType::from_name(&name, true),
            name,
            contents,
            is_override: true,
            is_default: false,
            version: None,
        }
    }

    /// Parses `text` as JSON. Only objects are accepted as document roots.
    pub fn parse(name: impl Into<String>, text: &str, is_override: bool) -> Result<Self> {
        let name = name.into();
        let contents: Value =
            serde_json::from_str(text).context(ParseDocumentSnafu { name: name.clone() })?;
        ensure!(contents.is_object(), NotAnObjectSnafu { name });

        Ok(if is_override {
            Self::new_override(name, contents)
        } else {
            Self::new(name, contents)
        })
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_file_type(mut self, file_type: ConfigFileType) -> Self {
        self.file_type = if self.is_override {
            file_type.as_override()
        } else {
            file_type
        };
        self
    }

    /// Pointer lookup that never fails. Explicit `null` counts as missing.
    pub fn at(&self, pointer: &str) -> Option<&Value> {
        self.contents.pointer(pointer).filter(|value| !value.is_null())
    }

    /// The file name without its folder and `.json` suffix.
    pub fn stem(&self) -> &str {
        let file = self.name.rsplit('/').next().unwrap_or(&self.name);
        file.strip_suffix(JSON_SUFFIX).unwrap_or(file)
    }

    /// Returns true if the last path segment of the document name starts with `about`.
    pub fn is_about_file(&self) -> bool {
        self.name
            .rsplit('/')
            .next()
            .is_some_and(|file| file.starts_with("about"))
    }
}

/// Identifies one application in one environment, written `<env>/<app>`.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRef {
    pub environment: String,
    pub application: String,
}

impl ApplicationRef {
    pub fn new(environment: impl Into<String>, application: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            application: application.into(),
        }
    }

    pub fn app_file(&self) -> String {
        format!("{}/{}{JSON_SUFFIX}", self.environment, self.application)
    }
}

impl Display for ApplicationRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.environment, self.application)
    }
}

impl FromStr for ApplicationRef {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let input = input.strip_suffix(JSON_SUFFIX).unwrap_or(input);
        let (environment, application) = input
            .split_once('/')
            .filter(|(env, app)| !env.is_empty() && !app.is_empty() && !app.contains('/'))
            .context(InvalidApplicationRefSnafu { input })?;

        Ok(Self::new(environment, application))
    }
}

/// The full set of documents of one affiliation.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct AuroraConfig {
    pub affiliation: String,
    pub documents: Vec<ConfigDocument>,
}

impl AuroraConfig {
    pub fn new(affiliation: impl Into<String>, documents: Vec<ConfigDocument>) -> Self {
        Self {
            affiliation: affiliation.into(),
            documents,
        }
    }

    pub fn document(&self, name: &str) -> Option<&ConfigDocument> {
        self.documents.iter().find(|document| document.name == name)
    }

    /// Lists every application found in an environment folder.
    pub fn application_refs(&self) -> Vec<ApplicationRef> {
        let mut refs: Vec<_> = self
            .documents
            .iter()
            .map(|document| document.name.as_str())
            .filter(|name| name.contains('/') && !name.contains("about"))
            .filter_map(|name| name.parse().ok())
            .collect();
        refs.sort();
        refs
    }

    /// Replaces the document with the same name, or appends a new one.
    pub fn update_document(&mut self, document: ConfigDocument) {
        match self.documents.iter_mut().find(|d| d.name == document.name) {
            Some(existing) => *existing = document,
            None => self.documents.push(document),
        }
    }

    /// Names of the documents an application is composed of, in ascending
    /// precedence order.
    pub fn required_files(&self, application: &ApplicationRef) -> Vec<String> {
        let app_file = self.document(&application.app_file());
        let string_key = |key: &str| {
            app_file
                .and_then(|document| document.at(&format!("/{key}")))
                .and_then(Value::as_str)
                .map(ToOwned::to_owned)
        };

        let base_file =
            string_key("baseFile").unwrap_or_else(|| format!("{}{JSON_SUFFIX}", application.application));
        let env_file = string_key("envFile").unwrap_or_else(|| ABOUT_FILE.to_owned());

        vec![
            ABOUT_FILE.to_owned(),
            base_file,
            format!("{}/{env_file}", application.environment),
            application.app_file(),
        ]
    }

    /// Selects the documents for `application`, followed by the matching
    /// override documents, in ascending precedence order.
    pub fn files_for_application(
        &self,
        application: &ApplicationRef,
        overrides: &[ConfigDocument],
    ) -> Result<Vec<ConfigDocument>> {
        let required = self.required_files(application);

        let roles = [
            ConfigFileType::Global,
            ConfigFileType::Base,
            ConfigFileType::Env,
            ConfigFileType::App,
        ];
        let files: Vec<ConfigDocument> = required
            .iter()
            .zip(roles)
            .filter_map(|(name, role)| {
                self.document(name)
                    .map(|document| document.clone().with_file_type(role))
            })
            .collect();

        let override_files: Vec<ConfigDocument> = required
            .iter()
            .zip(roles)
            .filter_map(|(name, role)| {
                overrides
                    .iter()
                    .find(|document| &document.name == name)
                    .map(|document| document.clone().with_file_type(role.as_override()))
            })
            .collect();

        let missing: Vec<String> = required
            .iter()
            .filter(|name| {
                !files.iter().chain(&override_files).any(|d| &d.name == *name)
            })
            .cloned()
            .collect();
        ensure!(missing.is_empty(), MissingRequiredFilesSnafu { missing });

        debug!(
            %application,
            files = ?required,
            overrides = override_files.len(),
            "selected documents for application"
        );

        Ok(files.into_iter().chain(override_files).collect())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn aurora_config() -> AuroraConfig {
        AuroraConfig::new(
            "paas",
            vec![
                ConfigDocument::new("about.json", json!({"cluster": "utv"})),
                ConfigDocument::new("reference.json", json!({"groupId": "no.skatteetaten"})),
                ConfigDocument::new("utv/about.json", json!({"cluster": "utv2"})),
                ConfigDocument::new("utv/reference.json", json!({})),
                ConfigDocument::new("utv/shared.json", json!({"baseFile": "reference.json"})),
                ConfigDocument::new("prod/about.json", json!({})),
            ],
        )
    }

    #[rstest]
    #[case("about.json", false, ConfigFileType::Global)]
    #[case("reference.json", false, ConfigFileType::Base)]
    #[case("utv/about.json", false, ConfigFileType::Env)]
    #[case("utv/about-alternative.json", false, ConfigFileType::Env)]
    #[case("utv/reference.json", false, ConfigFileType::App)]
    #[case("utv/reference.json", true, ConfigFileType::AppOverride)]
    #[case("about.json", true, ConfigFileType::GlobalOverride)]
    fn file_type_from_name(
        #[case] name: &str,
        #[case] is_override: bool,
        #[case] expected: ConfigFileType,
    ) {
        assert_eq!(ConfigFileType::from_name(name, is_override), expected);
    }

    #[test]
    fn file_types_are_ordered_by_precedence() {
        assert!(ConfigFileType::Default < ConfigFileType::Global);
        assert!(ConfigFileType::Base < ConfigFileType::Env);
        assert!(ConfigFileType::App < ConfigFileType::AppOverride);
    }

    #[test]
    fn selects_files_in_precedence_order() {
        let files = aurora_config()
            .files_for_application(&ApplicationRef::new("utv", "reference"), &[])
            .expect("all required files exist");

        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "about.json",
                "reference.json",
                "utv/about.json",
                "utv/reference.json"
            ]
        );
    }

    #[test]
    fn base_file_can_be_redirected() {
        let files = aurora_config()
            .files_for_application(&ApplicationRef::new("utv", "shared"), &[])
            .expect("all required files exist");

        assert_eq!(files[1].name, "reference.json");
        assert_eq!(files[1].file_type, ConfigFileType::Base);
    }

    #[test]
    fn overrides_are_appended() {
        let overrides = [ConfigDocument::new_override(
            "utv/reference.json",
            json!({"replicas": 3}),
        )];
        let files = aurora_config()
            .files_for_application(&ApplicationRef::new("utv", "reference"), &overrides)
            .expect("all required files exist");

        let last = files.last().expect("files are not empty");
        assert!(last.is_override);
        assert_eq!(last.file_type, ConfigFileType::AppOverride);
    }

    #[test]
    fn missing_files_are_reported() {
        let error = aurora_config()
            .files_for_application(&ApplicationRef::new("prod", "reference"), &[])
            .expect_err("prod/reference.json is missing");

        assert_eq!(
            error.to_string(),
            r#"Unable to merge files because some required files are missing. Missing ["prod/reference.json"]."#
        );
    }

    #[test]
    fn lists_application_refs() {
        let refs: Vec<String> = aurora_config()
            .application_refs()
            .iter()
            .map(ToString::to_string)
            .collect();

        assert_eq!(refs, ["utv/reference", "utv/shared"]);
    }

    #[rstest]
    #[case("utv/reference", Some(("utv", "reference")))]
    #[case("utv/reference.json", Some(("utv", "reference")))]
    #[case("reference", None)]
    #[case("utv/", None)]
    #[case("a/b/c", None)]
    fn parse_application_ref(#[case] input: &str, #[case] expected: Option<(&str, &str)>) {
        let parsed = input.parse::<ApplicationRef>().ok();
        assert_eq!(
            parsed,
            expected.map(|(env, app)| ApplicationRef::new(env, app))
        );
    }

    #[test]
    fn parse_rejects_non_objects() {
        assert!(ConfigDocument::parse("about.json", "[1, 2]", false).is_err());
        assert!(ConfigDocument::parse("about.json", "{", false).is_err());
    }

    #[test]
    fn explicit_null_is_missing() {
        let document = ConfigDocument::new("about.json", json!({"cluster": null}));
        assert_eq!(document.at("/cluster"), None);
    }
}
