//! A fluent-bit sidecar that ships the log files of the application to
//! Splunk.
//!
//! Logging is either configured with a default `logging/index` and optional
//! per logger indexes below `logging/loggers`, or with custom loggers below
//! `logging/custom`:
//!
//! ```json
//! {
//!   "logging": {
//!     "custom": {
//!       "application": { "index": "app", "pattern": "*.log", "sourcetype": "log4j" },
//!       "eval": { "index": "eval", "pattern": "*.evalevent", "sourcetype": "_json" }
//!     }
//!   }
//! }
//! ```
use std::{
    collections::BTreeMap,
    sync::{Arc, LazyLock},
};

use async_trait::async_trait;
use const_format::concatcp;
use k8s_openapi::{
    ByteString,
    api::core::v1::{ConfigMap, Container, ResourceRequirements, Secret, Volume},
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::ObjectMeta},
};
use regex::Regex;
use tracing::debug;

use self::conf::{Labels, LoggerConfig, PARSERS_CONF, fluent_bit_conf};
use super::{
    IMAGE_METADATA_KEY,
    deployment::{LOG_PATH, LOG_VOLUME, field_env},
    image_ref, object_meta, pinned_image,
};
use crate::{
    builder::{
        meta::insert_annotation,
        pod::{VolumeBuilder, env_var_from_secret, volume_mount},
    },
    config::FluentbitConfig,
    deployment::DeploymentCommand,
    feature::{Feature, FeatureContext, Result},
    field::{FieldHandler, discovery, validators},
    provision::{ImageMetadataResolver, ProvisioningError},
    resource::{AuroraResource, ResourceSet},
    spec::{self, AuroraDeploymentSpec},
    validation::ConfigFieldError,
};

pub mod conf;

const NAME: &str = "Fluentbit";

const INDEX: &str = "logging/index";
const BUFFER_SIZE: &str = "logging/bufferSize";
const LOGGERS: &str = "logging/loggers";
const CUSTOM: &str = "logging/custom";

pub const APPLICATION_LOGGER: &str = "application";
const ACCESS_LOGGER: &str = "access";
const STANDARD_LOGGERS: [&str; 8] = [
    APPLICATION_LOGGER,
    "audit_text",
    "audit_json",
    "slow",
    "gc",
    "sensitive",
    "stacktrace",
    ACCESS_LOGGER,
];
const SOURCE_TYPES: &[&str] = &["_json", "access_combined", "gc_log", "log4j"];

pub const PARSER_MOUNT_PATH: &str = "/fluent-bit/parser";
pub const PARSERS_FILE: &str = "parsers.conf";
const CONFIG_MOUNT_PATH: &str = "/fluent-bit/etc";

const HEC_TOKEN_KEY: &str = "HEC_TOKEN";
const SPLUNK_HOST_KEY: &str = "SPLUNK_HOST";
const SPLUNK_PORT_KEY: &str = "SPLUNK_PORT";

/// Keeps the node level Splunk collector away from pods that ship their own
/// logs.
const SPLUNK_EXCLUDE_ANNOTATION: &str = "splunk.com/exclude";
const SPLUNK_INDEX_ANNOTATION: &str = "splunk.com/index";

const FILE_PATTERN_FMT: &str = r"^[A-Za-z-*]+\.[A-Za-z]+$";
const FILE_PATTERN_ERROR_MSG: &str = concatcp!(
    "Is not properly formatted. You need to have exactly one period(.) and conform to the following regex ",
    FILE_PATTERN_FMT
);

static FILE_PATTERN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(FILE_PATTERN_FMT).expect("failed to compile log file pattern regex")
});

pub struct FluentbitFeature {
    config: FluentbitConfig,
    images: Arc<dyn ImageMetadataResolver>,
}

impl FluentbitFeature {
    pub fn new(config: FluentbitConfig, images: Arc<dyn ImageMetadataResolver>) -> Self {
        Self { config, images }
    }
}

fn logging_index(spec: &AuroraDeploymentSpec) -> Option<String> {
    spec.extract_or_none(INDEX)
        .filter(|index| !index.is_empty())
}

fn is_custom(spec: &AuroraDeploymentSpec) -> bool {
    spec.has_sub_keys(CUSTOM)
}

/// The sidecar only runs next to long lived applications.
fn runs_sidecar(spec: &AuroraDeploymentSpec) -> bool {
    spec.template_type()
        .is_ok_and(|template_type| template_type.is_deployment())
}

fn source_type(logger: &str) -> &'static str {
    match logger {
        "audit_json" => "_json",
        ACCESS_LOGGER => "access_combined",
        "gc" => "gc_log",
        _ => "log4j",
    }
}

fn file_pattern(logger: &str) -> &'static str {
    match logger {
        "audit_text" => "*.audit.text",
        "audit_json" => "*.audit.json",
        ACCESS_LOGGER => "*.access",
        "slow" => "*.slow",
        "gc" => "*.gc",
        "sensitive" => "*.sensitive",
        "stacktrace" => "*.stacktrace",
        _ => "*.log",
    }
}

/// The standard loggers with their index, `false` switches one off. The
/// application and access loggers fall back to the default index.
fn standard_loggers(spec: &AuroraDeploymentSpec, default_index: &str) -> Vec<LoggerConfig> {
    let prefix = format!("{LOGGERS}/");
    let mut indexes: BTreeMap<String, String> = spec
        .find_all(&prefix, |_, field| field.value_as_string())
        .into_iter()
        .filter_map(|(name, index)| Some((name.strip_prefix(&prefix)?.to_owned(), index)))
        .filter(|(_, index)| index != "false")
        .collect();
    for logger in [APPLICATION_LOGGER, ACCESS_LOGGER] {
        indexes
            .entry(logger.to_owned())
            .or_insert_with(|| default_index.to_owned());
    }

    indexes
        .iter()
        .map(|(name, index)| LoggerConfig::new(name, source_type(name), index, file_pattern(name)))
        .collect()
}

fn custom_loggers(spec: &AuroraDeploymentSpec) -> Result<Vec<LoggerConfig>, spec::Error> {
    spec.sub_key_names(CUSTOM)
        .iter()
        .map(|name| {
            let field = |suffix: &str| format!("{CUSTOM}/{name}/{suffix}");
            Ok(LoggerConfig::new(
                name,
                &spec.extract(&field("sourcetype"))?,
                &spec.extract(&field("index"))?,
                &spec.extract(&field("pattern"))?,
            ))
        })
        .collect()
}

/// The loggers to ship, empty if logging is off.
pub fn configured_loggers(spec: &AuroraDeploymentSpec) -> Result<Vec<LoggerConfig>, spec::Error> {
    if is_custom(spec) {
        return custom_loggers(spec);
    }
    Ok(logging_index(spec)
        .map(|index| standard_loggers(spec, &index))
        .unwrap_or_default())
}

fn validate_logging(spec: &AuroraDeploymentSpec) -> Vec<String> {
    let custom = is_custom(spec);
    let standard = spec.has_sub_keys(LOGGERS);
    let mut errors = Vec::new();

    if custom && (logging_index(spec).is_some() || standard) {
        errors.push(
            "Cannot use both custom loggers and the default loggers. If you wish to use custom loggers, then remove index and loggers"
                .to_owned(),
        );
    }
    if custom {
        if !spec.sub_key_names(CUSTOM).contains(APPLICATION_LOGGER) {
            errors.push("When using custom logger, application logger is required".to_owned());
        }
    } else if standard && spec.extract_or_none(INDEX).is_none() {
        errors.push(
            "Missing required field logging/index, it is required when logging/loggers is used".to_owned(),
        );
    }
    errors
}

fn config_map_name(spec: &AuroraDeploymentSpec) -> Result<String, spec::Error> {
    Ok(format!("{}-fluent-config", spec.name()?))
}

fn parser_map_name(spec: &AuroraDeploymentSpec) -> Result<String, spec::Error> {
    Ok(format!("{}-fluent-parser", spec.name()?))
}

fn hec_secret_name(spec: &AuroraDeploymentSpec) -> Result<String, spec::Error> {
    Ok(format!("{}-hec", spec.name()?))
}

fn set_template_annotation(template: &mut Option<ObjectMeta>, key: &str, value: &str) {
    insert_annotation(template.get_or_insert_with(ObjectMeta::default), key, value);
}

impl FluentbitFeature {
    fn config_map(
        &self,
        spec: &AuroraDeploymentSpec,
        loggers: &[LoggerConfig],
    ) -> Result<Option<ConfigMap>> {
        let name = spec.name()?;
        let cluster = spec.cluster()?;
        let version = spec.extract_or_default("version", "");
        let labels = Labels {
            application: &name,
            cluster: &cluster,
            version: &version,
            buffer_size: spec.get(BUFFER_SIZE)?,
            retry_limit: self.config.retry_limit,
        };
        let Some(conf) = fluent_bit_conf(loggers, &labels) else {
            return Ok(None);
        };
        Ok(Some(ConfigMap {
            metadata: object_meta(spec, config_map_name(spec)?)?,
            data: Some(BTreeMap::from([("fluent-bit.conf".to_owned(), conf)])),
            ..ConfigMap::default()
        }))
    }

    fn hec_secret(&self, spec: &AuroraDeploymentSpec) -> Result<Secret> {
        Ok(Secret {
            metadata: object_meta(spec, hec_secret_name(spec)?)?,
            data: Some(
                [
                    (HEC_TOKEN_KEY, &self.config.hec_token),
                    (SPLUNK_HOST_KEY, &self.config.splunk_host),
                    (SPLUNK_PORT_KEY, &self.config.splunk_port),
                ]
                .into_iter()
                .map(|(key, value)| (key.to_owned(), ByteString(value.clone().into_bytes())))
                .collect(),
            ),
            type_: Some("Opaque".to_owned()),
            ..Secret::default()
        })
    }

    fn container(&self, spec: &AuroraDeploymentSpec, context: &FeatureContext) -> Result<Container> {
        let buffer_size: u32 = spec.get(BUFFER_SIZE)?;
        let hec_secret = hec_secret_name(spec)?;
        let image = pinned_image(&image_ref(&self.config.image, self.config.tag.clone()), context)?;

        let mut env = vec![
            field_env("POD_NAME", "metadata.name"),
            field_env("POD_NAMESPACE", "metadata.namespace"),
        ];
        env.extend(
            [HEC_TOKEN_KEY, SPLUNK_HOST_KEY, SPLUNK_PORT_KEY]
                .into_iter()
                .map(|key| env_var_from_secret(key, &hec_secret, key)),
        );

        Ok(Container {
            name: format!("{}-fluent-sidecar", spec.name()?),
            image: Some(image),
            env: Some(env),
            volume_mounts: Some(vec![
                volume_mount(parser_map_name(spec)?, PARSER_MOUNT_PATH),
                volume_mount(config_map_name(spec)?, CONFIG_MOUNT_PATH),
                volume_mount(LOG_VOLUME, LOG_PATH),
            ]),
            resources: Some(ResourceRequirements {
                limits: Some(BTreeMap::from([
                    ("cpu".to_owned(), Quantity(self.config.cpu_limit.clone())),
                    ("memory".to_owned(), Quantity(format!("{}Mi", buffer_size.saturating_mul(5)))),
                ])),
                requests: Some(BTreeMap::from([
                    ("cpu".to_owned(), Quantity("10m".to_owned())),
                    ("memory".to_owned(), Quantity(format!("{buffer_size}Mi"))),
                ])),
                ..ResourceRequirements::default()
            }),
            ..Container::default()
        })
    }
}

#[async_trait]
impl Feature for FluentbitFeature {
    fn name(&self) -> &'static str {
        NAME
    }

    fn handlers(&self, _header: &AuroraDeploymentSpec, cmd: &DeploymentCommand) -> Vec<FieldHandler> {
        let mut handlers = vec![
            FieldHandler::new(INDEX),
            FieldHandler::new(BUFFER_SIZE)
                .with_default(20)
                .with_validator(validators::unsigned_int()),
        ];
        handlers.extend(
            STANDARD_LOGGERS
                .iter()
                .map(|logger| FieldHandler::new(format!("{LOGGERS}/{logger}"))),
        );
        handlers.extend(
            discovery::sub_keys_expanded(&cmd.documents, CUSTOM)
                .into_iter()
                .flat_map(|logger| {
                    [
                        FieldHandler::new(format!("{logger}/index"))
                            .with_validator(validators::required("Field is required")),
                        FieldHandler::new(format!("{logger}/pattern")).with_validator(
                            validators::pattern(&FILE_PATTERN_REGEX, FILE_PATTERN_ERROR_MSG, true),
                        ),
                        FieldHandler::new(format!("{logger}/sourcetype"))
                            .with_validator(validators::one_of(SOURCE_TYPES, true)),
                    ]
                }),
        );
        handlers
    }

    fn is_active(&self, spec: &AuroraDeploymentSpec) -> bool {
        is_custom(spec) || spec.has_sub_keys(LOGGERS) || logging_index(spec).is_some()
    }

    async fn create_context(
        &self,
        spec: &AuroraDeploymentSpec,
        _cmd: &DeploymentCommand,
        validation_only: bool,
    ) -> Result<FeatureContext, ProvisioningError> {
        if validation_only || !runs_sidecar(spec) {
            return Ok(FeatureContext::default());
        }

        let image = image_ref(&self.config.image, self.config.tag.clone());
        let metadata = self.images.resolve(&image).await?;
        debug!(%image, digest = ?metadata.digest, "resolved fluent-bit image metadata");
        Ok(FeatureContext::new().with(IMAGE_METADATA_KEY, metadata))
    }

    fn validate(
        &self,
        spec: &AuroraDeploymentSpec,
        _full_validation: bool,
        _context: &FeatureContext,
    ) -> Vec<ConfigFieldError> {
        validate_logging(spec)
            .into_iter()
            .map(|message| ConfigFieldError::generic(message).with_field("logging"))
            .collect()
    }

    fn generate(
        &self,
        spec: &AuroraDeploymentSpec,
        _cmd: &DeploymentCommand,
        _context: &FeatureContext,
    ) -> Result<Vec<AuroraResource>> {
        if !runs_sidecar(spec) {
            return Ok(Vec::new());
        }
        let loggers = configured_loggers(spec)?;
        let Some(config_map) = self.config_map(spec, &loggers)? else {
            return Ok(Vec::new());
        };
        let parsers = ConfigMap {
            metadata: object_meta(spec, parser_map_name(spec)?)?,
            data: Some(BTreeMap::from([(PARSERS_FILE.to_owned(), PARSERS_CONF.to_owned())])),
            ..ConfigMap::default()
        };

        Ok(vec![
            AuroraResource::new(parsers, NAME),
            AuroraResource::new(config_map, NAME),
            AuroraResource::new(self.hec_secret(spec)?, NAME),
        ])
    }

    fn modify(
        &self,
        spec: &AuroraDeploymentSpec,
        _cmd: &DeploymentCommand,
        resources: &mut ResourceSet,
        context: &FeatureContext,
    ) -> Result<()> {
        let loggers = configured_loggers(spec)?;
        let Some(application) = loggers.iter().find(|logger| logger.name == APPLICATION_LOGGER) else {
            return Ok(());
        };
        if !runs_sidecar(spec) {
            resources.modify_deployments(NAME, "Added splunk index annotation", |deployment| {
                if let Some(deployment_spec) = &mut deployment.spec {
                    set_template_annotation(
                        &mut deployment_spec.template.metadata,
                        SPLUNK_INDEX_ANNOTATION,
                        &application.index,
                    );
                }
            });
            return Ok(());
        }

        let volumes: Vec<Volume> = [config_map_name(spec)?, parser_map_name(spec)?]
            .iter()
            .map(|name| VolumeBuilder::new(name).with_config_map(name).build())
            .collect();
        let container = self.container(spec, context)?;

        resources.modify_deployments(
            NAME,
            "Added fluentbit volume, sidecar container and annotation",
            |deployment| {
                let Some(deployment_spec) = &mut deployment.spec else {
                    return;
                };
                let template = &mut deployment_spec.template;
                if let Some(pod) = &mut template.spec {
                    pod.volumes.get_or_insert_with(Vec::new).extend(volumes.iter().cloned());
                    pod.containers.push(container.clone());
                }
                set_template_annotation(&mut template.metadata, SPLUNK_EXCLUDE_ANNOTATION, "true");
            },
        );
        Ok(())
    }
}
