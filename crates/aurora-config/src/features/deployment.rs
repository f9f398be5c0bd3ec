//! The Deployment and Service of long running applications.
use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment},
        core::v1::{
            Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
            ObjectFieldSelector, PodSpec, PodTemplateSpec, Probe, SecurityContext, Service,
            ServicePort, ServiceSpec, Volume,
        },
    },
    apimachinery::pkg::{
        apis::meta::v1::{LabelSelector, ObjectMeta},
        util::intstr::IntOrString,
    },
};
use tracing::debug;

use super::{
    HTTP_PORT, IMAGE_METADATA_KEY, INTERNAL_HTTP_PORT, ensure_starts_with, object_meta,
    pinned_image, short_digest,
};
use crate::{
    builder::{
        meta::ObjectMetaBuilder,
        pod::{env_var, probe, volume_mount},
    },
    deployment::DeploymentCommand,
    document::ConfigFileType,
    feature::{Feature, FeatureContext, Result},
    field::{FieldHandler, validators},
    provision::{ImageMetadataResolver, ImageRef, ProvisioningError},
    resource::{AuroraResource, Manifest, ResourceSet},
    spec::{self, AuroraDeploymentSpec},
    validation::{VERSION_ERROR_MSG, VERSION_REGEX},
};

const NAME: &str = "Deployment";
pub(super) const LOG_VOLUME: &str = "application-log-volume";
pub(super) const LOG_PATH: &str = "/u01/logs";
const MANAGEMENT_PORT: i32 = 8081;

pub struct DeploymentFeature {
    docker_registry: String,
    images: Arc<dyn ImageMetadataResolver>,
}

impl DeploymentFeature {
    pub fn new(docker_registry: String, images: Arc<dyn ImageMetadataResolver>) -> Self {
        Self {
            docker_registry,
            images,
        }
    }

    fn image_ref(&self, spec: &AuroraDeploymentSpec) -> Result<ImageRef, spec::Error> {
        Ok(ImageRef {
            registry: self.docker_registry.clone(),
            group: spec.extract("groupId")?.replace('.', "_"),
            name: spec.extract("artifactId")?,
            tag: docker_tag(spec)?,
        })
    }
}

/// The tag that is deployed, `releaseTo` if set.
pub fn docker_tag(spec: &AuroraDeploymentSpec) -> Result<String, spec::Error> {
    match spec.release_to() {
        Some(release_to) => Ok(release_to),
        None => spec.extract("version"),
    }
}

/// `:<port>/<path>` of the management interface, if enabled.
pub fn management_path(spec: &AuroraDeploymentSpec) -> Result<Option<String>, spec::Error> {
    spec.feature_enabled("management", |field| -> Result<_, spec::Error> {
        let path: String = spec.get(&format!("{field}/path"))?;
        let port = spec.extract(&format!("{field}/port"))?;
        Ok(format!(
            "{}{}",
            ensure_starts_with(&port, ":", ""),
            ensure_starts_with(&path, "/", "")
        ))
    })
    .transpose()
}

fn probe_handlers(name: &str, enabled: bool) -> Vec<FieldHandler> {
    vec![
        FieldHandler::new(name).simplified().with_default(enabled),
        FieldHandler::new(format!("{name}/port")).with_default(INTERNAL_HTTP_PORT),
        FieldHandler::new(format!("{name}/path")),
        FieldHandler::new(format!("{name}/delay")).with_default(10),
        FieldHandler::new(format!("{name}/timeout")).with_default(1),
    ]
}

fn spec_probe(spec: &AuroraDeploymentSpec, name: &str) -> Result<Option<Probe>, spec::Error> {
    spec.feature_enabled(name, |field| -> Result<_, spec::Error> {
        let path: Option<String> = spec.get_or_none(&format!("{field}/path"))?;
        Ok(probe(
            spec.get(&format!("{field}/port"))?,
            path.map(|path| ensure_starts_with(&path, "/", "")).as_deref(),
            spec.get(&format!("{field}/delay"))?,
            spec.get(&format!("{field}/timeout"))?,
        ))
    })
    .transpose()
}

pub(super) fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_owned(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: Some("v1".to_owned()),
                field_path: field_path.to_owned(),
            }),
            ..EnvVarSource::default()
        }),
        ..EnvVar::default()
    }
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_owned()),
        container_port: port,
        protocol: Some("TCP".to_owned()),
        ..ContainerPort::default()
    }
}

impl DeploymentFeature {
    fn container(
        &self,
        spec: &AuroraDeploymentSpec,
        context: &FeatureContext,
    ) -> Result<Container> {
        let name = spec.name()?;
        let image_ref = self.image_ref(spec)?;
        let image = pinned_image(&image_ref, context)?;

        Ok(Container {
            name: format!("{name}-{}", spec.application_platform()?),
            image: Some(image),
            image_pull_policy: Some("IfNotPresent".to_owned()),
            ports: Some(vec![
                container_port("http", INTERNAL_HTTP_PORT),
                container_port("management", MANAGEMENT_PORT),
            ]),
            env: Some(vec![
                field_env("POD_NAME", "metadata.name"),
                field_env("POD_NAMESPACE", "metadata.namespace"),
                env_var("HTTP_PORT", INTERNAL_HTTP_PORT.to_string()),
                env_var("MANAGEMENT_HTTP_PORT", MANAGEMENT_PORT.to_string()),
            ]),
            liveness_probe: spec_probe(spec, "liveness")?,
            readiness_probe: spec_probe(spec, "readiness")?,
            volume_mounts: Some(vec![volume_mount(LOG_VOLUME, LOG_PATH)]),
            termination_message_path: Some("/dev/termination-log".to_owned()),
            security_context: Some(SecurityContext {
                privileged: Some(false),
                ..SecurityContext::default()
            }),
            ..Container::default()
        })
    }

    fn deployment(
        &self,
        spec: &AuroraDeploymentSpec,
        context: &FeatureContext,
    ) -> Result<Deployment> {
        let name = spec.name()?;
        let selector = BTreeMap::from([("name".to_owned(), name.clone())]);
        let timeout: i32 = spec.get("deployStrategy/timeout")?;
        let strategy = match spec.extract("deployStrategy/type")?.as_str() {
            "recreate" => DeploymentStrategy {
                type_: Some("Recreate".to_owned()),
                rolling_update: None,
            },
            _ => DeploymentStrategy {
                type_: Some("RollingUpdate".to_owned()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_surge: Some(IntOrString::String("25%".to_owned())),
                    max_unavailable: Some(IntOrString::Int(0)),
                }),
            },
        };

        Ok(Deployment {
            metadata: object_meta(spec, &name)?,
            spec: Some(DeploymentSpec {
                replicas: Some(spec.get("replicas")?),
                selector: LabelSelector {
                    match_labels: Some(selector.clone()),
                    ..LabelSelector::default()
                },
                strategy: Some(strategy),
                progress_deadline_seconds: Some(timeout),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(selector),
                        ..ObjectMeta::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![self.container(spec, context)?],
                        volumes: Some(vec![Volume {
                            name: LOG_VOLUME.to_owned(),
                            empty_dir: Some(EmptyDirVolumeSource::default()),
                            ..Volume::default()
                        }]),
                        restart_policy: Some("Always".to_owned()),
                        dns_policy: Some("ClusterFirst".to_owned()),
                        service_account_name: spec.extract_or_none("serviceAccount"),
                        ..PodSpec::default()
                    }),
                },
                ..DeploymentSpec::default()
            }),
            ..Deployment::default()
        })
    }

    fn service(spec: &AuroraDeploymentSpec) -> Result<Service> {
        let name = spec.name()?;
        let prometheus = spec
            .feature_enabled("prometheus", |field| {
                Ok::<_, spec::Error>((
                    spec.extract(&format!("{field}/path"))?,
                    spec.extract_or_none(&format!("{field}/port")),
                ))
            })
            .transpose()?
            .filter(|(path, _)| !path.is_empty());

        let mut metadata = ObjectMetaBuilder::new();
        metadata.name(&name).namespace(spec.namespace()?);
        match prometheus {
            Some((path, port)) => {
                metadata
                    .with_annotation("prometheus.io/scheme", "http")
                    .with_annotation("prometheus.io/scrape", "true")
                    .with_annotation("prometheus.io/path", path);
                if let Some(port) = port {
                    metadata.with_annotation("prometheus.io/port", port);
                }
            }
            None => {
                metadata.with_annotation("prometheus.io/scrape", "false");
            }
        }

        Ok(Service {
            metadata: metadata.build(),
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    name: Some("http".to_owned()),
                    protocol: Some("TCP".to_owned()),
                    port: HTTP_PORT,
                    target_port: Some(IntOrString::Int(INTERNAL_HTTP_PORT)),
                    ..ServicePort::default()
                }]),
                selector: Some(BTreeMap::from([("name".to_owned(), name)])),
                type_: Some("ClusterIP".to_owned()),
                session_affinity: Some("None".to_owned()),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        })
    }
}

#[async_trait]
impl Feature for DeploymentFeature {
    fn name(&self) -> &'static str {
        NAME
    }

    fn enable(&self, header: &AuroraDeploymentSpec) -> bool {
        header
            .template_type()
            .is_ok_and(|template_type| template_type.is_deployment())
    }

    fn handlers(&self, header: &AuroraDeploymentSpec, cmd: &DeploymentCommand) -> Vec<FieldHandler> {
        let artifact_id = cmd
            .documents
            .iter()
            .find(|document| document.file_type == ConfigFileType::Base)
            .map_or_else(
                || cmd.application_ref.application.clone(),
                |document| document.stem().to_owned(),
            );
        let version_required = header
            .template_type()
            .map_or(true, |template_type| template_type.version_required());

        let mut handlers = vec![
            FieldHandler::new("artifactId")
                .with_default(artifact_id)
                .with_default_source("fileName")
                .with_validator(validators::length(
                    50,
                    "ArtifactId must be set and be shorter then 50 characters",
                    false,
                )),
            FieldHandler::new("groupId").with_validator(validators::length(
                200,
                "GroupId must be set and be shorter then 200 characters",
                true,
            )),
            FieldHandler::new("version").with_validator(validators::pattern(
                &VERSION_REGEX,
                VERSION_ERROR_MSG,
                version_required,
            )),
            FieldHandler::new("releaseTo"),
            FieldHandler::new("deployStrategy/type")
                .with_default("rolling")
                .with_validator(validators::one_of(&["recreate", "rolling"], true)),
            FieldHandler::new("deployStrategy/timeout")
                .with_default(180)
                .with_validator(validators::unsigned_int()),
            FieldHandler::new("replicas")
                .with_default(1)
                .with_validator(validators::unsigned_int()),
            FieldHandler::new("serviceAccount"),
            FieldHandler::new("prometheus").simplified().with_default(true),
            FieldHandler::new("prometheus/path").with_default("/prometheus"),
            FieldHandler::new("prometheus/port").with_default(MANAGEMENT_PORT),
        ];
        handlers.extend(probe_handlers("readiness", true));
        handlers.extend(probe_handlers("liveness", false));
        handlers
    }

    async fn create_context(
        &self,
        spec: &AuroraDeploymentSpec,
        _cmd: &DeploymentCommand,
        validation_only: bool,
    ) -> Result<FeatureContext, ProvisioningError> {
        let Ok(image) = self.image_ref(spec) else {
            return Ok(FeatureContext::default());
        };
        if validation_only {
            return Ok(FeatureContext::default());
        }

        let metadata = self.images.resolve(&image).await?;
        debug!(%image, digest = ?metadata.digest, "resolved image metadata");
        Ok(FeatureContext::new().with(IMAGE_METADATA_KEY, metadata))
    }

    fn generate(
        &self,
        spec: &AuroraDeploymentSpec,
        _cmd: &DeploymentCommand,
        context: &FeatureContext,
    ) -> Result<Vec<AuroraResource>> {
        Ok(vec![
            AuroraResource::new(self.deployment(spec, context)?, NAME),
            AuroraResource::new(Self::service(spec)?, NAME),
        ])
    }

    fn modify(
        &self,
        spec: &AuroraDeploymentSpec,
        _cmd: &DeploymentCommand,
        resources: &mut ResourceSet,
        _context: &FeatureContext,
    ) -> Result<()> {
        let artifact_id = spec.extract("artifactId")?;
        let application_id = short_digest(&format!("{}/{artifact_id}", spec.extract("groupId")?));

        for resource in resources.iter_mut() {
            if let Manifest::ApplicationDeployment(ad) = &mut resource.manifest {
                ad.spec.application_name.clone_from(&artifact_id);
                ad.spec.application_id.clone_from(&application_id);
                resource.record_modification(NAME, "Added application name and id");
            }
        }
        Ok(())
    }
}
