//! The orchestrator: from documents to a validated deployment context, and
//! from a context to resources.
use std::sync::Arc;

use futures::future::try_join_all;
use itertools::Itertools as _;
use serde_json::Value;
use snafu::{ResultExt as _, Snafu, ensure};
use tracing::{info, instrument, warn};

use crate::{
    assembly::{self, ActiveFeature},
    crd::application_deployment::AuroraConfigRef,
    document::{self, ApplicationRef, AuroraConfig, ConfigDocument},
    feature::Feature,
    field::{self, AuroraConfigField, FieldHandler, FieldSource, STATIC_SOURCE, resolver::resolve},
    header::header_handlers,
    provision::ProvisioningError,
    resource::AuroraResource,
    spec::AuroraDeploymentSpec,
    validation::{ConfigFieldError, ValidationErrors, validate_fields},
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to select the documents of {application}"))]
    SelectDocuments {
        source: document::Error,
        application: ApplicationRef,
    },

    #[snafu(display("feature {feature} declared a malformed field handler"))]
    MalformedHandler {
        source: field::Error,
        feature: &'static str,
    },

    #[snafu(transparent)]
    Validation { source: ValidationErrors },

    #[snafu(display("feature {feature} failed to provision external resources"))]
    Provisioning {
        source: ProvisioningError,
        feature: &'static str,
    },

    #[snafu(display("resources can not be generated from a validation only context"))]
    ValidationOnly,

    #[snafu(display("failed to assemble resources"))]
    Assemble { source: assembly::Error },
}

/// Everything one request is about.
#[derive(Clone, Debug, PartialEq)]
pub struct DeploymentCommand {
    pub application_ref: ApplicationRef,

    /// The documents of the application in ascending precedence order,
    /// overrides last.
    pub documents: Vec<ConfigDocument>,

    /// The override documents as given by the caller, keyed by file name.
    pub overrides: Vec<ConfigDocument>,
    pub config_ref: AuroraConfigRef,
    pub deploy_id: String,
    pub user: String,
}

impl DeploymentCommand {
    pub fn new(
        config: &AuroraConfig,
        application_ref: ApplicationRef,
        overrides: Vec<ConfigDocument>,
    ) -> Result<Self> {
        let documents = config
            .files_for_application(&application_ref, &overrides)
            .context(SelectDocumentsSnafu {
                application: application_ref.clone(),
            })?;

        Ok(Self {
            application_ref,
            documents,
            overrides,
            config_ref: AuroraConfigRef {
                name: config.affiliation.clone(),
                ref_name: "master".to_owned(),
                resolved_ref: None,
            },
            deploy_id: String::new(),
            user: String::new(),
        })
    }

    pub fn with_config_ref(mut self, config_ref: AuroraConfigRef) -> Self {
        self.config_ref = config_ref;
        self
    }

    pub fn with_deploy_id(mut self, deploy_id: impl Into<String>) -> Self {
        self.deploy_id = deploy_id.into();
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }
}

/// A request that passed validation.
#[derive(Debug)]
pub struct DeploymentContext {
    pub spec: AuroraDeploymentSpec,
    pub command: DeploymentCommand,
    pub features: Vec<ActiveFeature>,

    /// Every handler that took part in resolution, header handlers first.
    pub handlers: Vec<FieldHandler>,
    pub warnings: Vec<ConfigFieldError>,
    pub validation_only: bool,
}

/// Resolves, validates and assembles applications with an ordered list of
/// features.
#[derive(Clone)]
pub struct DeploymentEngine {
    features: Vec<Arc<dyn Feature>>,
}

impl std::fmt::Debug for DeploymentEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.features.iter().map(|feature| feature.name()))
            .finish()
    }
}

impl DeploymentEngine {
    pub fn new(features: Vec<Arc<dyn Feature>>) -> Self {
        Self { features }
    }

    pub fn features(&self) -> &[Arc<dyn Feature>] {
        &self.features
    }

    /// Resolves the configuration of one application and validates it.
    ///
    /// Resolution happens in two passes. The header is resolved and
    /// validated first and decides which features take part. The full spec
    /// is then resolved from the header handlers plus the handlers of those
    /// features. All validation errors of the second pass are reported
    /// together.
    ///
    /// With `validation_only` no external services are called and the
    /// returned context can not be used to generate resources.
    #[instrument(skip(self, cmd), fields(application = %cmd.application_ref))]
    pub async fn resolve_and_validate(
        &self,
        cmd: DeploymentCommand,
        validation_only: bool,
    ) -> Result<DeploymentContext> {
        let documents = &cmd.documents;

        let header_handlers = header_handlers(&cmd);
        check_handler_names(&header_handlers, "header")?;
        let header = AuroraDeploymentSpec::new(resolve(&header_handlers, documents));
        let (header_errors, _) = split_warnings(validate_fields(
            &header_handlers,
            header.fields(),
            documents,
            false,
        ));
        ensure_valid(&cmd.application_ref, header_errors)?;

        let enabled: Vec<_> = self
            .features
            .iter()
            .filter(|feature| feature.enable(&header))
            .cloned()
            .collect();

        let mut handlers = header_handlers;
        for feature in &enabled {
            let feature_handlers = feature.handlers(&header, &cmd);
            check_handler_names(&feature_handlers, feature.name())?;
            handlers.extend(feature_handlers);
        }
        // Features may share a field such as `releaseTo`, the first declaration wins.
        let handlers: Vec<_> = handlers
            .into_iter()
            .unique_by(|handler| handler.name.clone())
            .collect();

        let mut fields = resolve(&handlers, documents);
        let field_errors = validate_fields(&handlers, &fields, documents, true);
        add_static_fields(&mut fields, &cmd);
        AuroraDeploymentSpec::new(fields.clone())
            .placeholders()
            .apply(&mut fields);
        let spec = AuroraDeploymentSpec::new(fields);

        let active: Vec<_> = enabled
            .into_iter()
            .filter(|feature| feature.is_active(&spec))
            .collect();

        let offline = validation_only || field_errors.iter().any(|error| !error.is_warning());
        let contexts = try_join_all(active.iter().map(|feature| {
            let spec = &spec;
            let cmd = &cmd;
            async move {
                feature
                    .create_context(spec, cmd, offline)
                    .await
                    .context(ProvisioningSnafu {
                        feature: feature.name(),
                    })
            }
        }))
        .await?;

        let features: Vec<_> = active
            .into_iter()
            .zip(contexts)
            .map(|(feature, context)| ActiveFeature { feature, context })
            .collect();

        let feature_errors = features
            .iter()
            .flat_map(|ActiveFeature { feature, context }| feature.validate(&spec, true, context));
        let (errors, warnings) = split_warnings(field_errors.into_iter().chain(feature_errors).collect());
        for warning in &warnings {
            warn!(%warning, "configuration warning");
        }
        ensure_valid(&cmd.application_ref, errors)?;

        info!(
            features = features.len(),
            fields = spec.fields().len(),
            "resolved and validated application"
        );

        Ok(DeploymentContext {
            spec,
            command: cmd,
            features,
            handlers,
            warnings,
            validation_only,
        })
    }

    /// Generates the resources of a validated request.
    #[instrument(skip(self, context), fields(application = %context.command.application_ref))]
    pub fn generate_resources(&self, context: &DeploymentContext) -> Result<Vec<AuroraResource>> {
        ensure!(!context.validation_only, ValidationOnlySnafu);
        let resources = assembly::assemble(&context.features, &context.spec, &context.command)
            .context(AssembleSnafu)?;
        info!(resources = resources.len(), "generated resources");
        Ok(resources.into_vec())
    }
}

fn check_handler_names(handlers: &[FieldHandler], feature: &'static str) -> Result<()> {
    handlers
        .iter()
        .try_for_each(FieldHandler::check_name)
        .context(MalformedHandlerSnafu { feature })
}

fn split_warnings(errors: Vec<ConfigFieldError>) -> (Vec<ConfigFieldError>, Vec<ConfigFieldError>) {
    errors.into_iter().partition(|error| !error.is_warning())
}

fn ensure_valid(application: &ApplicationRef, errors: Vec<ConfigFieldError>) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    Err(ValidationErrors {
        application: application.clone(),
        errors,
    }
    .into())
}

/// Fields every spec has, whatever the documents say.
fn add_static_fields(fields: &mut field::Fields, cmd: &DeploymentCommand) {
    let config_version = cmd
        .config_ref
        .resolved_ref
        .clone()
        .unwrap_or_else(|| cmd.config_ref.ref_name.clone());

    for (name, value) in [
        ("applicationDeploymentRef", cmd.application_ref.to_string()),
        ("configVersion", config_version),
    ] {
        fields.insert(
            name.to_owned(),
            AuroraConfigField {
                value: Value::String(value),
                source: FieldSource::synthetic(STATIC_SOURCE),
                can_be_simplified: false,
            },
        );
    }
}
