//! Fields every application has, resolved before any feature is consulted.
//!
//! The header decides which features take part in a request, e.g. only
//! `deploy` and `development` types get a Deployment.
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, VariantNames};

use crate::{
    deployment::DeploymentCommand,
    document::ConfigFileType,
    field::{FieldHandler, validators},
    validation::{
        AFFILIATION_ERROR_MSG, AFFILIATION_REGEX, ENV_NAME_ERROR_MSG, ENV_NAME_REGEX,
        NAME_ERROR_MSG, NAME_REGEX,
    },
};

#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, PartialEq, Serialize, VariantNames,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum TemplateType {
    Cronjob,
    Job,
    Deploy,
    Development,
    LocalTemplate,
    Template,
}

impl TemplateType {
    pub fn is_job(self) -> bool {
        matches!(self, Self::Cronjob | Self::Job)
    }

    /// Types that run as a long lived Deployment.
    pub fn is_deployment(self) -> bool {
        matches!(self, Self::Deploy | Self::Development)
    }

    /// Development builds may be deployed without a released version.
    pub fn version_required(self) -> bool {
        self != Self::Development
    }
}

#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, PartialEq, Serialize, VariantNames,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ApplicationPlatform {
    Java,
    Python,
    Web,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, PartialEq, Serialize, VariantNames,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum DeployState {
    DeploymentConfig,
    Deployment,
}

pub const SCHEMA_VERSIONS: &[&str] = &["v1"];

/// The handlers of the header phase.
///
/// `name` and `envName` default to the application and environment the
/// request was made for.
pub fn header_handlers(cmd: &DeploymentCommand) -> Vec<FieldHandler> {
    let application = &cmd.application_ref;
    vec![
        FieldHandler::new("schemaVersion").with_validator(validators::one_of(SCHEMA_VERSIONS, true)),
        FieldHandler::new("type").with_validator(validators::one_of(TemplateType::VARIANTS, true)),
        FieldHandler::new("deployState")
            .with_default(DeployState::Deployment.to_string())
            .with_validator(validators::one_of(DeployState::VARIANTS, true)),
        FieldHandler::new("applicationPlatform")
            .with_default(ApplicationPlatform::Java.to_string())
            .with_validator(validators::one_of(ApplicationPlatform::VARIANTS, true)),
        FieldHandler::new("affiliation").with_validator(validators::pattern(
            &AFFILIATION_REGEX,
            AFFILIATION_ERROR_MSG,
            true,
        )),
        FieldHandler::new("segment"),
        FieldHandler::new("cluster").with_validator(validators::not_blank("Cluster must be set")),
        FieldHandler::new("permissions/admin"),
        FieldHandler::new("permissions/view"),
        FieldHandler::new("permissions/adminServiceAccount"),
        FieldHandler::new("envName")
            .with_default(application.environment.clone())
            .with_default_source("folderName")
            .with_validator(validators::pattern(&ENV_NAME_REGEX, ENV_NAME_ERROR_MSG, true)),
        FieldHandler::new("name")
            .with_default(application.application.clone())
            .with_default_source("fileName")
            .with_validator(validators::pattern(&NAME_REGEX, NAME_ERROR_MSG, false)),
        FieldHandler::new("env/name")
            .with_validator(validators::pattern(&ENV_NAME_REGEX, ENV_NAME_ERROR_MSG, false)),
        FieldHandler::new("env/ttl").with_validator(validators::duration()),
        FieldHandler::new("env/autoDeploy")
            .with_default(false)
            .with_validator(validators::boolean()),
        FieldHandler::new("baseFile").allowed_in([ConfigFileType::App, ConfigFileType::AppOverride]),
        FieldHandler::new("envFile").allowed_in([ConfigFileType::App, ConfigFileType::AppOverride]),
        FieldHandler::new("includeEnvFile"),
    ]
}
