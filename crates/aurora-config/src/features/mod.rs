//! The features shipped with the engine, see [`bundled_features`].
use std::{collections::BTreeMap, sync::Arc};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use sha2::{Digest as _, Sha256};

use crate::{
    builder::meta::ObjectMetaBuilder,
    config::EngineConfig,
    feature::{self, Feature, FeatureContext},
    provision::{ImageMetadata, ImageRef, Provisioners},
    spec::{self, AuroraDeploymentSpec},
    time::Clock,
};

pub mod application_deployment;
pub mod certificate;
pub mod common_labels;
pub mod config;
pub mod database;
pub mod deployment;
pub mod fluentbit;
pub mod route;
pub mod toxiproxy;
pub mod webseal;

/// The port Services expose.
pub const HTTP_PORT: i32 = 80;

/// The port the application container listens on.
pub const INTERNAL_HTTP_PORT: i32 = 8080;
pub const TOXIPROXY_HTTP_PORT: i32 = 8090;
pub const TOXIPROXY_ADMIN_PORT: i32 = 8474;

/// Context key of the [`ImageMetadata`](crate::provision::ImageMetadata) a
/// feature resolved for its container.
pub const IMAGE_METADATA_KEY: &str = "imageMetadata";

/// The bundled features in registration order.
pub fn bundled_features(
    config: &EngineConfig,
    provisioners: &Provisioners,
    clock: Arc<dyn Clock>,
) -> Vec<Arc<dyn Feature>> {
    vec![
        Arc::new(deployment::DeploymentFeature::new(
            config.docker_registry.clone(),
            provisioners.images.clone(),
        )),
        Arc::new(application_deployment::ApplicationDeploymentFeature::new(clock)),
        Arc::new(common_labels::CommonLabelsFeature),
        Arc::new(config::ConfigFeature::new(
            config.config_mount_path.clone(),
            provisioners.vaults.clone(),
        )),
        Arc::new(database::DatabaseFeature::new(
            config.secrets_path.clone(),
            provisioners.databases.clone(),
        )),
        Arc::new(certificate::CertificateFeature::new(
            config.secrets_path.clone(),
            provisioners.certificates.clone(),
        )),
        Arc::new(route::RouteFeature::new(config.route_suffix.clone())),
        Arc::new(webseal::WebsealFeature),
        Arc::new(fluentbit::FluentbitFeature::new(
            config.fluentbit.clone(),
            provisioners.images.clone(),
        )),
        Arc::new(toxiproxy::ToxiproxyFeature::new(
            config.toxiproxy_image.clone(),
            config.toxiproxy_default_version.clone(),
            provisioners.images.clone(),
            provisioners.databases.clone(),
        )),
    ]
}

/// Metadata with the given name in the namespace of the application.
fn object_meta(spec: &AuroraDeploymentSpec, name: impl Into<String>) -> Result<ObjectMeta, spec::Error> {
    Ok(ObjectMetaBuilder::new()
        .name(name)
        .namespace(spec.namespace()?)
        .build())
}

/// A 40 character hex digest of `input`, usable as a label value.
fn short_digest(input: &str) -> String {
    Sha256::digest(input)
        .iter()
        .take(20)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// `value` if it already starts with `prefix`, `prefix<separator>value` otherwise.
fn ensure_starts_with(value: &str, prefix: &str, separator: &str) -> String {
    if value.starts_with(prefix) {
        value.to_owned()
    } else {
        format!("{prefix}{separator}{value}")
    }
}

/// The scalar fields directly below `prefix`, keyed by the last segment.
fn sub_key_values(spec: &AuroraDeploymentSpec, prefix: &str) -> BTreeMap<String, String> {
    spec.sub_keys(prefix)
        .into_iter()
        .filter(|(key, _)| !key.contains('/'))
        .map(|(key, field)| (key.to_owned(), field.value_as_string()))
        .collect()
}

/// Splits `registry/group/name` into an [`ImageRef`], the registry defaults
/// to `docker.io`.
fn image_ref(image: &str, tag: String) -> ImageRef {
    let (repository, name) = image.rsplit_once('/').unwrap_or(("", image));
    let (registry, group) = repository.rsplit_once('/').unwrap_or(("docker.io", repository));
    ImageRef {
        registry: registry.to_owned(),
        group: group.to_owned(),
        name: name.to_owned(),
        tag,
    }
}

/// The image by digest if the context holds one, by tag otherwise.
fn pinned_image(image: &ImageRef, context: &FeatureContext) -> Result<String, feature::Error> {
    let metadata = context.get_or_none::<ImageMetadata>(IMAGE_METADATA_KEY)?;
    Ok(match metadata.and_then(|metadata| metadata.digest.as_deref()) {
        Some(digest) => format!("{}@{digest}", image.repository()),
        None => image.to_string(),
    })
}

/// Turns a config key such as `foo.bar-baz` into an env var name.
fn env_name(key: &str) -> String {
    key.replace(['.', '-'], "_")
}
