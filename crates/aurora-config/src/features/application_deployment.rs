use std::{collections::BTreeMap, sync::Arc, time::Duration};

use snafu::ResultExt as _;

use super::{object_meta, short_digest};
use crate::{
    builder::meta::insert_label,
    crd::application_deployment::{
        ApplicationDeployment, ApplicationDeploymentCommand, ApplicationDeploymentSpec,
    },
    deployment::DeploymentCommand,
    feature::{Feature, FeatureContext, RenderSnafu, Result},
    field::{FieldHandler, validators},
    resource::{AuroraResource, Manifest, ResourceSet},
    spec::AuroraDeploymentSpec,
    time::Clock,
};

const NAME: &str = "ApplicationDeployment";

/// Label holding the epoch second after which the deployment may be removed.
pub const REMOVE_AFTER_LABEL: &str = "removeAfter";

pub struct ApplicationDeploymentFeature {
    clock: Arc<dyn Clock>,
}

impl ApplicationDeploymentFeature {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// `ttl`, falling back to `env/ttl`.
    fn ttl(spec: &AuroraDeploymentSpec) -> Option<Duration> {
        spec.extract_or_none("ttl")
            .or_else(|| spec.extract_or_none("env/ttl"))
            .and_then(|ttl| humantime::parse_duration(&ttl).ok())
    }
}

impl Feature for ApplicationDeploymentFeature {
    fn name(&self) -> &'static str {
        NAME
    }

    fn handlers(&self, _header: &AuroraDeploymentSpec, _cmd: &DeploymentCommand) -> Vec<FieldHandler> {
        vec![
            FieldHandler::new("message"),
            FieldHandler::new("ttl").with_validator(validators::duration()),
        ]
    }

    fn generate(
        &self,
        spec: &AuroraDeploymentSpec,
        cmd: &DeploymentCommand,
        _context: &FeatureContext,
    ) -> Result<Vec<AuroraResource>> {
        let name = spec.name()?;
        let namespace = spec.namespace()?;

        let mut override_files = BTreeMap::new();
        for document in &cmd.overrides {
            let contents = serde_json::to_string(&document.contents).context(RenderSnafu {
                what: format!("override file {}", document.name),
            })?;
            override_files.insert(document.name.clone(), contents);
        }

        let mut metadata = object_meta(spec, &name)?;
        if let Some(ttl) = Self::ttl(spec) {
            let remove_after = self.clock.epoch_seconds_after(ttl);
            insert_label(&mut metadata, REMOVE_AFTER_LABEL, &remove_after.to_string());
        }

        let application_deployment = ApplicationDeployment {
            metadata,
            spec: ApplicationDeploymentSpec {
                selector: BTreeMap::from([("name".to_owned(), name.clone())]),
                message: spec.extract_or_none("message"),
                application_deployment_id: short_digest(&format!("{namespace}/{name}")),
                application_deployment_name: name,
                command: ApplicationDeploymentCommand {
                    override_files,
                    application_deployment_ref: cmd.application_ref.to_string(),
                    aurora_config: cmd.config_ref.clone(),
                },
                ..ApplicationDeploymentSpec::default()
            },
        };

        Ok(vec![AuroraResource::new(application_deployment, NAME)])
    }

    fn modify(
        &self,
        _spec: &AuroraDeploymentSpec,
        _cmd: &DeploymentCommand,
        resources: &mut ResourceSet,
        _context: &FeatureContext,
    ) -> Result<()> {
        let Some(owner) = resources.iter().find_map(|resource| match &resource.manifest {
            Manifest::ApplicationDeployment(ad) => Some(ad.owner_reference()),
            _ => None,
        }) else {
            return Ok(());
        };

        for resource in resources.iter_mut() {
            if matches!(resource.manifest, Manifest::ApplicationDeployment(_)) {
                continue;
            }
            resource
                .manifest
                .metadata_mut()
                .owner_references
                .get_or_insert_with(Vec::new)
                .push(owner.clone());
            resource.record_modification(NAME, "Set owner reference to ApplicationDeployment");
        }
        Ok(())
    }
}
