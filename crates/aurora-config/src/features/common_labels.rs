//! Labels and annotations every generated resource carries.
use std::collections::BTreeMap;

use snafu::ResultExt as _;

use super::deployment::{docker_tag, management_path};
use crate::{
    builder::meta::{insert_annotation, insert_label},
    deployment::DeploymentCommand,
    feature::{Feature, FeatureContext, RenderSnafu, Result},
    field::{FieldHandler, validators},
    resource::{Manifest, ResourceSet},
    spec::AuroraDeploymentSpec,
};

const NAME: &str = "CommonLabels";

const APPLICATION_FILE_ANNOTATION: &str = "boober.skatteetaten.no/applicationFile";
const OVERRIDES_ANNOTATION: &str = "boober.skatteetaten.no/overrides";
const RELEASE_TO_ANNOTATION: &str = "boober.skatteetaten.no/releaseTo";
const ALARM_ANNOTATION: &str = "console.skatteetaten.no/alarm";
const MANAGEMENT_PATH_ANNOTATION: &str = "console.skatteetaten.no/management-path";

pub struct CommonLabelsFeature;

impl CommonLabelsFeature {
    fn labels(spec: &AuroraDeploymentSpec, cmd: &DeploymentCommand) -> Result<BTreeMap<&'static str, String>> {
        let name = spec.name()?;
        Ok([
            ("app", name.clone()),
            ("updatedBy", cmd.user.replace(':', "-")),
            ("affiliation", spec.affiliation()?),
            ("updateInBoober", "true".to_owned()),
            ("booberDeployId", cmd.deploy_id.clone()),
            ("name", name),
        ]
        .into_iter()
        .filter(|(_, value)| !value.is_empty())
        .collect())
    }

    fn deployment_annotations(
        spec: &AuroraDeploymentSpec,
        cmd: &DeploymentCommand,
    ) -> Result<BTreeMap<&'static str, String>> {
        let mut annotations = BTreeMap::from([
            (APPLICATION_FILE_ANNOTATION, cmd.application_ref.app_file()),
            (ALARM_ANNOTATION, spec.extract("alarm")?),
        ]);

        if !cmd.overrides.is_empty() {
            let overrides: BTreeMap<_, _> = cmd
                .overrides
                .iter()
                .map(|document| (&document.name, &document.contents))
                .collect();
            let overrides = serde_json::to_string(&overrides).context(RenderSnafu {
                what: "override annotation",
            })?;
            annotations.insert(OVERRIDES_ANNOTATION, overrides);
        }
        if let Some(path) = management_path(spec)? {
            annotations.insert(MANAGEMENT_PATH_ANNOTATION, path);
        }
        if let Some(release_to) = spec.release_to() {
            annotations.insert(RELEASE_TO_ANNOTATION, release_to);
        }
        Ok(annotations)
    }
}

impl Feature for CommonLabelsFeature {
    fn name(&self) -> &'static str {
        NAME
    }

    fn handlers(&self, _header: &AuroraDeploymentSpec, _cmd: &DeploymentCommand) -> Vec<FieldHandler> {
        vec![
            FieldHandler::new("management").simplified().with_default(true),
            FieldHandler::new("management/path").with_default("actuator"),
            FieldHandler::new("management/port").with_default("8081"),
            FieldHandler::new("releaseTo"),
            FieldHandler::new("alarm")
                .with_default(true)
                .with_validator(validators::boolean()),
            FieldHandler::new("pause")
                .with_default(false)
                .with_validator(validators::boolean()),
        ]
    }

    fn modify(
        &self,
        spec: &AuroraDeploymentSpec,
        cmd: &DeploymentCommand,
        resources: &mut ResourceSet,
        _context: &FeatureContext,
    ) -> Result<()> {
        let labels = Self::labels(spec, cmd)?;
        let paused: bool = spec.get("pause")?;

        for resource in resources.iter_mut() {
            let metadata = resource.manifest.metadata_mut();
            for (key, value) in &labels {
                insert_label(metadata, key, value);
            }
            resource.record_modification(NAME, "Added common labels");

            let Manifest::Deployment(deployment) = &mut resource.manifest else {
                continue;
            };
            for (key, value) in Self::deployment_annotations(spec, cmd)? {
                insert_annotation(&mut deployment.metadata, key, value);
            }
            if let Ok(tag) = docker_tag(spec) {
                insert_label(&mut deployment.metadata, "deployTag", &tag);
            }
            if paused {
                insert_label(&mut deployment.metadata, "paused", "true");
            }

            if let Some(deployment_spec) = deployment.spec.as_mut() {
                if paused {
                    deployment_spec.replicas = Some(0);
                }
                let template = deployment_spec.template.metadata.get_or_insert_with(Default::default);
                for (key, value) in &labels {
                    insert_label(template, key, value);
                }
            }
            resource.record_modification(NAME, "Added deployment annotations");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::ConfigMap,
    };
    use serde_json::json;

    use super::*;
    use crate::{
        document::{ApplicationRef, AuroraConfig, ConfigDocument},
        field::resolver::resolve,
        resource::AuroraResource,
    };

    fn command(app: serde_json::Value) -> DeploymentCommand {
        let config = AuroraConfig::new(
            "paas",
            vec![
                ConfigDocument::new("about.json", json!({"affiliation": "paas"})),
                ConfigDocument::new("reference.json", json!({})),
                ConfigDocument::new("utv/about.json", json!({})),
                ConfigDocument::new("utv/reference.json", app),
            ],
        );
        DeploymentCommand::new(&config, ApplicationRef::new("utv", "reference"), Vec::new())
            .expect("all files are present")
            .with_user("k1:admin")
            .with_deploy_id("abc123")
    }

    fn modified(cmd: &DeploymentCommand) -> ResourceSet {
        let mut handlers = CommonLabelsFeature.handlers(&AuroraDeploymentSpec::default(), cmd);
        handlers.extend([
            FieldHandler::new("name").with_default("reference"),
            FieldHandler::new("affiliation"),
            FieldHandler::new("version"),
        ]);
        let spec = AuroraDeploymentSpec::new(resolve(&handlers, &cmd.documents));

        let mut resources = ResourceSet::new();
        let deployment = Deployment {
            spec: Some(DeploymentSpec {
                replicas: Some(2),
                ..DeploymentSpec::default()
            }),
            ..Deployment::default()
        };
        resources
            .insert(AuroraResource::new(deployment, "Deployment"))
            .expect("resource is unique");
        resources
            .insert(AuroraResource::new(ConfigMap::default(), "Config"))
            .expect("resource is unique");

        CommonLabelsFeature
            .modify(&spec, cmd, &mut resources, &FeatureContext::new())
            .expect("modify succeeds");
        resources
    }

    #[test]
    fn labels_every_resource() {
        let resources = modified(&command(json!({"version": "1.2.3"})));

        for resource in resources.iter() {
            let labels = resource.manifest.metadata().labels.clone().unwrap_or_default();
            assert_eq!(labels.get("app").map(String::as_str), Some("reference"));
            assert_eq!(labels.get("updatedBy").map(String::as_str), Some("k1-admin"));
            assert_eq!(labels.get("booberDeployId").map(String::as_str), Some("abc123"));
            assert_eq!(labels.get("affiliation").map(String::as_str), Some("paas"));
        }

        let Some(Manifest::Deployment(deployment)) = resources.iter().next().map(|r| &r.manifest) else {
            panic!("the first resource is the deployment");
        };
        let annotations = deployment.metadata.annotations.clone().unwrap_or_default();
        assert_eq!(
            annotations.get(APPLICATION_FILE_ANNOTATION).map(String::as_str),
            Some("utv/reference.json")
        );
        assert_eq!(
            annotations.get(MANAGEMENT_PATH_ANNOTATION).map(String::as_str),
            Some(":8081/actuator")
        );
        assert_eq!(annotations.get(ALARM_ANNOTATION).map(String::as_str), Some("true"));
        assert_eq!(
            deployment.metadata.labels.as_ref().and_then(|labels| labels.get("deployTag")),
            Some(&"1.2.3".to_owned())
        );
    }

    #[test]
    fn pause_scales_to_zero() {
        let resources = modified(&command(json!({"pause": true})));

        let Some(Manifest::Deployment(deployment)) = resources.iter().next().map(|r| &r.manifest) else {
            panic!("the first resource is the deployment");
        };
        assert_eq!(deployment.spec.as_ref().and_then(|spec| spec.replicas), Some(0));
        assert_eq!(
            deployment.metadata.labels.as_ref().and_then(|labels| labels.get("paused")),
            Some(&"true".to_owned())
        );
    }
}
