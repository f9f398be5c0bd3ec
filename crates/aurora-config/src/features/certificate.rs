//! A certificate for the application, provisioned per common name and
//! mounted from a Secret.
use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::{ByteString, api::core::v1::Secret};
use tracing::debug;

use super::object_meta;
use crate::{
    builder::{
        meta::{insert_annotation, insert_label},
        pod::{VolumeBuilder, add_env, add_volume, env_var},
    },
    deployment::DeploymentCommand,
    feature::{Feature, FeatureContext, Result},
    field::{FieldHandler, validators},
    provision::{
        CertificateProvisioner, CertificateProvisioningResult, CertificateRequest, ProvisioningError,
        database::escape_property,
    },
    resource::{AuroraResource, ResourceSet},
    spec::{self, AuroraDeploymentSpec},
};

const NAME: &str = "Certificate";
const CERTIFICATE_KEY: &str = "certificate";

pub const RENEW_AFTER_LABEL: &str = "stsRenewAfter";
pub const APP_ANNOTATION: &str = "gillis.skatteetaten.no/app";
pub const COMMON_NAME_ANNOTATION: &str = "gillis.skatteetaten.no/commonName";

pub struct CertificateFeature {
    secrets_path: String,
    provisioner: Arc<dyn CertificateProvisioner>,
}

impl CertificateFeature {
    pub fn new(secrets_path: String, provisioner: Arc<dyn CertificateProvisioner>) -> Self {
        Self {
            secrets_path,
            provisioner,
        }
    }

    fn mount_path(&self, secret_name: &str) -> String {
        format!("{}/{secret_name}", self.secrets_path)
    }
}

/// `<groupId>.<name>` for `"certificate": true`, the configured
/// `certificate/commonName` otherwise.
pub fn common_name(spec: &AuroraDeploymentSpec) -> Result<Option<String>, spec::Error> {
    if !spec.is_simplified_config("certificate") {
        return Ok(spec.extract_or_none("certificate/commonName"));
    }
    if !spec.get::<bool>("certificate")? {
        return Ok(None);
    }
    let group_id = spec.extract_or_default("groupId", "");
    Ok(Some(format!("{group_id}.{}", spec.name()?)))
}

fn secret_name(spec: &AuroraDeploymentSpec) -> Result<String, spec::Error> {
    Ok(format!("{}-cert", spec.name()?))
}

/// A Java properties file telling the application how to open the keystore.
fn descriptor(keystore_path: &str, result: &CertificateProvisioningResult) -> String {
    [
        ("keystore-file", keystore_path),
        ("alias", "ca"),
        ("store-password", result.certificate.store_password.as_str()),
        ("key-password", result.certificate.key_password.as_str()),
    ]
    .iter()
    .map(|(key, value)| format!("{key}={}\n", escape_property(value)))
    .collect()
}

impl CertificateFeature {
    fn secret(&self, spec: &AuroraDeploymentSpec, result: &CertificateProvisioningResult) -> Result<Secret> {
        let app = spec.name()?;
        let name = secret_name(spec)?;
        let keystore_path = format!("{}/keystore.jks", self.mount_path(&name));
        let certificate = &result.certificate;

        let mut metadata = object_meta(spec, name)?;
        insert_label(&mut metadata, RENEW_AFTER_LABEL, &result.renew_at.to_string());
        insert_annotation(&mut metadata, APP_ANNOTATION, app);
        insert_annotation(&mut metadata, COMMON_NAME_ANNOTATION, result.common_name.clone());

        let data = [
            ("privatekey.key", certificate.key.clone()),
            ("keystore.jks", certificate.keystore.clone()),
            ("certificate.crt", certificate.crt.clone()),
            ("descriptor.properties", descriptor(&keystore_path, result).into_bytes()),
        ];
        Ok(Secret {
            metadata,
            data: Some(
                data.into_iter()
                    .map(|(key, value)| (key.to_owned(), ByteString(value)))
                    .collect::<BTreeMap<_, _>>(),
            ),
            type_: Some("Opaque".to_owned()),
            ..Secret::default()
        })
    }
}

#[async_trait]
impl Feature for CertificateFeature {
    fn name(&self) -> &'static str {
        NAME
    }

    fn handlers(&self, _header: &AuroraDeploymentSpec, _cmd: &DeploymentCommand) -> Vec<FieldHandler> {
        vec![
            FieldHandler::new("certificate")
                .simplified()
                .with_default(false)
                .with_validator(validators::boolean()),
            FieldHandler::new("certificate/commonName"),
            FieldHandler::new("groupId"),
        ]
    }

    fn is_active(&self, spec: &AuroraDeploymentSpec) -> bool {
        common_name(spec).is_ok_and(|common_name| common_name.is_some())
    }

    async fn create_context(
        &self,
        spec: &AuroraDeploymentSpec,
        _cmd: &DeploymentCommand,
        validation_only: bool,
    ) -> Result<FeatureContext, ProvisioningError> {
        if validation_only {
            return Ok(FeatureContext::default());
        }
        let (Ok(Some(common_name)), Ok(application), Ok(environment)) =
            (common_name(spec), spec.name(), spec.env_name())
        else {
            return Ok(FeatureContext::default());
        };

        let result = self
            .provisioner
            .generate_certificate(&CertificateRequest {
                common_name,
                application,
                environment,
            })
            .await?;
        debug!(common_name = %result.common_name, renew_at = result.renew_at, "provisioned certificate");
        Ok(FeatureContext::new().with(CERTIFICATE_KEY, result))
    }

    fn generate(
        &self,
        spec: &AuroraDeploymentSpec,
        _cmd: &DeploymentCommand,
        context: &FeatureContext,
    ) -> Result<Vec<AuroraResource>> {
        let result = context.get::<CertificateProvisioningResult>(CERTIFICATE_KEY)?;
        Ok(vec![AuroraResource::new(self.secret(spec, result)?, NAME)])
    }

    fn modify(
        &self,
        spec: &AuroraDeploymentSpec,
        _cmd: &DeploymentCommand,
        resources: &mut ResourceSet,
        _context: &FeatureContext,
    ) -> Result<()> {
        let name = secret_name(spec)?;
        let base = self.mount_path(&name);
        let env = [
            env_var("STS_CERTIFICATE_URL", format!("{base}/certificate.crt")),
            env_var("STS_PRIVATE_KEY_URL", format!("{base}/privatekey.key")),
            env_var("STS_KEYSTORE_DESCRIPTOR", format!("{base}/descriptor.properties")),
            env_var(
                format!("VOLUME_{}", name.replace('-', "_").to_uppercase()),
                base.clone(),
            ),
        ];
        let volume = VolumeBuilder::new(&name).with_secret(&name, false).build();

        resources.modify_pod_specs(NAME, "Added certificate volume and env", |pod| {
            add_volume(pod, volume.clone(), &base);
            add_env(pod, &env);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{Container, PodSpec, PodTemplateSpec},
    };
    use rstest::rstest;
    use serde_json::{Value, json};

    use super::*;
    use crate::{
        document::{ApplicationRef, AuroraConfig, ConfigDocument},
        field::resolver::resolve,
        provision::offline::OfflineCertificateProvisioner,
        resource::Manifest,
        time::FixedClock,
    };

    fn feature() -> CertificateFeature {
        CertificateFeature::new(
            "/u01/secrets/app".to_owned(),
            Arc::new(OfflineCertificateProvisioner::new(Arc::new(
                FixedClock::from_epoch_seconds(1_000),
            ))),
        )
    }

    fn command(app: Value) -> DeploymentCommand {
        let config = AuroraConfig::new(
            "paas",
            vec![
                ConfigDocument::new("about.json", json!({"affiliation": "paas"})),
                ConfigDocument::new("reference.json", json!({"groupId": "no.skatteetaten"})),
                ConfigDocument::new("utv/about.json", json!({})),
                ConfigDocument::new("utv/reference.json", app),
            ],
        );
        DeploymentCommand::new(&config, ApplicationRef::new("utv", "reference"), Vec::new())
            .expect("all files are present")
    }

    fn spec(cmd: &DeploymentCommand) -> AuroraDeploymentSpec {
        let mut handlers = vec![
            FieldHandler::new("name").with_default("reference"),
            FieldHandler::new("envName").with_default("utv"),
            FieldHandler::new("affiliation"),
        ];
        handlers.extend(feature().handlers(&AuroraDeploymentSpec::default(), cmd));
        let mut fields = resolve(&handlers, &cmd.documents);
        AuroraDeploymentSpec::new(fields.clone())
            .placeholders()
            .apply(&mut fields);
        AuroraDeploymentSpec::new(fields)
    }

    #[rstest]
    #[case(json!({}), None)]
    #[case(json!({"certificate": false}), None)]
    #[case(json!({"certificate": true}), Some("no.skatteetaten.reference"))]
    #[case(json!({"certificate": {"commonName": "reference.example.com"}}), Some("reference.example.com"))]
    fn common_names(#[case] app: Value, #[case] expected: Option<&str>) {
        let spec = spec(&command(app));
        assert_eq!(common_name(&spec).expect("fields resolve").as_deref(), expected);
        assert_eq!(feature().is_active(&spec), expected.is_some());
    }

    #[tokio::test]
    async fn certificate_is_stored_in_a_secret_and_mounted() {
        let cmd = command(json!({"certificate": true}));
        let spec = spec(&cmd);
        let feature = feature();
        let context = feature
            .create_context(&spec, &cmd, false)
            .await
            .expect("offline provisioning never fails");

        let mut resources = ResourceSet::new();
        for resource in feature.generate(&spec, &cmd, &context).expect("secret renders") {
            resources.insert(resource).expect("resource is new");
        }
        resources
            .insert(AuroraResource::new(
                Deployment {
                    metadata: object_meta(&spec, "reference").expect("namespace resolves"),
                    spec: Some(DeploymentSpec {
                        template: PodTemplateSpec {
                            metadata: None,
                            spec: Some(PodSpec {
                                containers: vec![Container::default()],
                                ..PodSpec::default()
                            }),
                        },
                        ..DeploymentSpec::default()
                    }),
                    ..Deployment::default()
                },
                "Deployment",
            ))
            .expect("resource is new");
        feature
            .modify(&spec, &cmd, &mut resources, &context)
            .expect("modification succeeds");

        let mut secrets = resources.iter().filter_map(|resource| match &resource.manifest {
            Manifest::Secret(secret) => Some(secret),
            _ => None,
        });
        let secret = secrets.next().expect("a certificate secret");
        assert_eq!(secret.metadata.name.as_deref(), Some("reference-cert"));
        assert_eq!(
            secret.metadata.labels.as_ref().map(|labels| labels[RENEW_AFTER_LABEL].as_str()),
            Some("1988200")
        );
        assert_eq!(
            secret
                .metadata
                .annotations
                .as_ref()
                .map(|annotations| annotations[COMMON_NAME_ANNOTATION].as_str()),
            Some("no.skatteetaten.reference")
        );
        let data = secret.data.as_ref().expect("secret has data");
        let descriptor = String::from_utf8_lossy(&data["descriptor.properties"].0).into_owned();
        assert!(descriptor.starts_with("keystore-file=/u01/secrets/app/reference-cert/keystore.jks\nalias=ca\n"));

        let pod = resources
            .iter()
            .find_map(|resource| match &resource.manifest {
                Manifest::Deployment(deployment) => deployment.spec.as_ref()?.template.spec.as_ref(),
                _ => None,
            })
            .expect("a pod spec");
        let env = pod.containers[0].env.as_ref().expect("env is set");
        assert!(env.contains(&env_var(
            "STS_CERTIFICATE_URL",
            "/u01/secrets/app/reference-cert/certificate.crt"
        )));
        assert!(env.contains(&env_var("VOLUME_REFERENCE_CERT", "/u01/secrets/app/reference-cert")));
        assert_eq!(
            pod.volumes.as_ref().map(|volumes| volumes[0].name.as_str()),
            Some("reference-cert")
        );
    }
}
