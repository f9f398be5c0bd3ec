//! A toxiproxy sidecar in front of the application, for fault injection in
//! test environments.
//!
//! Incoming HTTP calls always pass the `app` proxy. Proxies configured below
//! `toxiproxy/proxies` also put the sidecar between the application and the
//! endpoints, servers and databases it calls.
use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::{
    ByteString,
    api::core::v1::{
        ConfigMap, Container, ContainerPort, Probe, ResourceRequirements, Secret, TCPSocketAction,
        Volume,
    },
    apimachinery::pkg::{api::resource::Quantity, util::intstr::IntOrString},
};
use serde::Serialize;
use snafu::ResultExt as _;
use tracing::debug;

use self::{
    proxy::{
        FIRST_PROXY_PORT, MAIN_PROXY_NAME, Proxy, ProxyTarget, config_variable, enabled_proxies,
        proxy_handlers, validate_proxies,
    },
    upstream::UpstreamUrl,
};
use super::{
    IMAGE_METADATA_KEY, INTERNAL_HTTP_PORT, TOXIPROXY_ADMIN_PORT, TOXIPROXY_HTTP_PORT, database,
    env_name, image_ref, object_meta, pinned_image,
};
use crate::{
    builder::pod::{VolumeBuilder, env_var, volume_mount},
    deployment::DeploymentCommand,
    feature::{Feature, FeatureContext, RenderSnafu, Result},
    field::{FieldHandler, validators},
    provision::{
        DatabaseSchemaProvisioner, ImageMetadataResolver, ProvisioningError,
        SchemaProvisionRequest,
        database::{escape_property, unescape_property},
    },
    resource::{AuroraResource, Manifest, ResourceSet},
    spec::{self, AuroraDeploymentSpec},
    validation::ConfigFieldError,
};

pub mod proxy;
pub mod upstream;

const NAME: &str = "Toxiproxy";
const CONFIG_PATH: &str = "/u01/config/toxiproxy";
const PROXY_HOST: &str = "localhost";

/// Context key of the [`ProxyBinding`]s, the `app` proxy first.
pub const PROXY_BINDINGS_KEY: &str = "toxiproxyBindings";

/// One entry of the toxiproxy `config.json`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ProxyConfig {
    pub name: String,
    pub listen: String,
    pub upstream: String,
    pub enabled: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            name: MAIN_PROXY_NAME.to_owned(),
            listen: format!("0.0.0.0:{TOXIPROXY_HTTP_PORT}"),
            upstream: format!("0.0.0.0:{INTERNAL_HTTP_PORT}"),
            enabled: true,
        }
    }
}

/// A proxy with the port it listens on and, for databases, the Secret
/// holding the connection details.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProxyBinding {
    pub port: u16,
    pub secret_name: Option<String>,
    pub config: ProxyConfig,
}

impl ProxyBinding {
    fn main() -> Self {
        Self {
            port: TOXIPROXY_HTTP_PORT as u16,
            secret_name: None,
            config: ProxyConfig::default(),
        }
    }
}

pub struct ToxiproxyFeature {
    /// `registry/group/name` of the toxiproxy image.
    image: String,
    default_version: String,
    images: Arc<dyn ImageMetadataResolver>,
    databases: Arc<dyn DatabaseSchemaProvisioner>,
}

/// The configured version, if toxiproxy is switched on.
pub fn toxiproxy_version(spec: &AuroraDeploymentSpec) -> Option<String> {
    spec.feature_enabled("toxiproxy", |field| spec.extract_or_none(&format!("{field}/version")))
        .flatten()
}

fn config_map_name(spec: &AuroraDeploymentSpec) -> Result<String, spec::Error> {
    Ok(format!("{}-toxiproxy-config", spec.name()?))
}

/// The schema request of the database a proxy points to.
fn database_request(spec: &AuroraDeploymentSpec, name: Option<&str>) -> Option<SchemaProvisionRequest> {
    let name = match name {
        Some(name) => name.to_owned(),
        None => spec.extract("databaseDefaults/name").ok()?,
    };
    let database = database::find_databases(spec)
        .ok()?
        .into_iter()
        .find(|database| database.name == name)?;
    database::schema_requests(spec, &[database]).ok()?.into_iter().next()
}

fn proxied_url(url: &str, port: u16) -> Option<String> {
    UpstreamUrl::parse(url)
        .ok()
        .map(|upstream| upstream.with_address(PROXY_HOST, port))
}

/// Env var values pointing to the proxies, keyed by env var name.
fn proxied_env(spec: &AuroraDeploymentSpec, proxies: &[Proxy], bindings: &[ProxyBinding]) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for proxy in proxies {
        let Some(binding) = bindings.iter().find(|binding| binding.config.name == proxy.name) else {
            continue;
        };
        match &proxy.target {
            ProxyTarget::Endpoint { url_variable } => {
                if let Some(url) = config_variable(spec, url_variable).and_then(|url| proxied_url(&url, binding.port)) {
                    env.insert(env_name(url_variable), url);
                }
            }
            ProxyTarget::ServerAndPort {
                server_variable,
                port_variable,
            } => {
                env.extend(server_variable.as_deref().map(|variable| (env_name(variable), PROXY_HOST.to_owned())));
                env.extend(port_variable.as_deref().map(|variable| (env_name(variable), binding.port.to_string())));
            }
            ProxyTarget::Database { .. } => {}
        }
    }
    env
}

/// Points `jdbcurl` and the `jdbc.url` in `db.properties` to the proxy.
fn point_secret_to_proxy(secret: &mut Secret, port: u16) {
    let Some(data) = secret.data.as_mut() else {
        return;
    };
    if let Some(ByteString(bytes)) = data.get_mut("jdbcurl") {
        if let Some(url) = proxied_url(&String::from_utf8_lossy(bytes), port) {
            *bytes = url.into_bytes();
        }
    }
    if let Some(ByteString(bytes)) = data.get_mut("db.properties") {
        let properties: String = String::from_utf8_lossy(bytes)
            .lines()
            .map(|line| {
                let proxied = line
                    .strip_prefix("jdbc.url=")
                    .and_then(|url| proxied_url(&unescape_property(url), port));
                match proxied {
                    Some(url) => format!("jdbc.url={}\n", escape_property(&url)),
                    None => format!("{line}\n"),
                }
            })
            .collect();
        *bytes = properties.into_bytes();
    }
}

impl ToxiproxyFeature {
    pub fn new(
        image: String,
        default_version: String,
        images: Arc<dyn ImageMetadataResolver>,
        databases: Arc<dyn DatabaseSchemaProvisioner>,
    ) -> Self {
        Self {
            image,
            default_version,
            images,
            databases,
        }
    }

    fn field_handlers(&self, cmd: &DeploymentCommand) -> Vec<FieldHandler> {
        let mut handlers = vec![
            FieldHandler::new("toxiproxy")
                .simplified()
                .with_default(false)
                .with_validator(validators::boolean()),
            FieldHandler::new("toxiproxy/version").with_default(self.default_version.clone()),
        ];
        handlers.extend(proxy_handlers(cmd));
        handlers
    }

    /// The upstream `host:port` of a proxy, and the Secret to rewrite for
    /// databases. [`None`] if the target can not be resolved.
    async fn upstream(
        &self,
        spec: &AuroraDeploymentSpec,
        target: &ProxyTarget,
    ) -> Result<Option<(String, Option<String>)>, ProvisioningError> {
        match target {
            ProxyTarget::Endpoint { url_variable } => Ok(config_variable(spec, url_variable)
                .and_then(|url| UpstreamUrl::parse(&url).ok())
                .map(|upstream| (upstream.address(), None))),
            ProxyTarget::ServerAndPort {
                server_variable,
                port_variable,
            } => {
                let server = server_variable.as_deref().and_then(|variable| config_variable(spec, variable));
                let port = port_variable.as_deref().and_then(|variable| config_variable(spec, variable));
                Ok(server.zip(port).map(|(server, port)| (format!("{server}:{port}"), None)))
            }
            ProxyTarget::Database { name } => {
                let (Some(request), Ok(app)) = (database_request(spec, name.as_deref()), spec.name()) else {
                    return Ok(None);
                };
                let results = self.databases.provision(std::slice::from_ref(&request)).await?;
                Ok(results.first().and_then(|result| {
                    let upstream = UpstreamUrl::parse(&result.schema.jdbc_url).ok()?;
                    let secret_name = database::secret_name(&app, &result.request.details().schema_name);
                    Some((upstream.address(), Some(secret_name)))
                }))
            }
        }
    }

    /// Binds every enabled proxy to its port. A proxy whose upstream can not
    /// be resolved keeps its port but is left out.
    async fn proxy_bindings(&self, spec: &AuroraDeploymentSpec) -> Result<Vec<ProxyBinding>, ProvisioningError> {
        let mut bindings = vec![ProxyBinding::main()];
        let Ok(proxies) = enabled_proxies(spec) else {
            return Ok(bindings);
        };

        for (index, proxy) in proxies.into_iter().enumerate() {
            let Some(port) = u16::try_from(index)
                .ok()
                .and_then(|index| FIRST_PROXY_PORT.checked_add(index))
            else {
                break;
            };
            let Some((upstream, secret_name)) = self.upstream(spec, &proxy.target).await? else {
                debug!(proxy = %proxy.name, "skipping toxiproxy proxy without upstream");
                continue;
            };
            bindings.push(ProxyBinding {
                port,
                secret_name,
                config: ProxyConfig {
                    name: proxy.name,
                    listen: format!("0.0.0.0:{port}"),
                    upstream,
                    enabled: proxy.initial_enabled_state,
                },
            });
        }
        Ok(bindings)
    }

    fn container(
        &self,
        spec: &AuroraDeploymentSpec,
        version: String,
        context: &FeatureContext,
    ) -> Result<Container> {
        let image = pinned_image(&image_ref(&self.image, version), context)?;
        let ports = [("http", TOXIPROXY_HTTP_PORT), ("management", TOXIPROXY_ADMIN_PORT)];

        Ok(Container {
            name: format!("{}-toxiproxy-sidecar", spec.name()?),
            image: Some(image),
            args: Some(vec![
                "-config".to_owned(),
                format!("{CONFIG_PATH}/config.json"),
                "-host=0.0.0.0".to_owned(),
            ]),
            ports: Some(
                ports
                    .iter()
                    .map(|(name, port)| ContainerPort {
                        name: Some((*name).to_owned()),
                        container_port: *port,
                        protocol: Some("TCP".to_owned()),
                        ..ContainerPort::default()
                    })
                    .collect(),
            ),
            env: Some(vec![
                env_var("HTTP_PORT", TOXIPROXY_HTTP_PORT.to_string()),
                env_var("MANAGEMENT_HTTP_PORT", TOXIPROXY_ADMIN_PORT.to_string()),
            ]),
            volume_mounts: Some(vec![volume_mount(config_map_name(spec)?, CONFIG_PATH)]),
            resources: Some(ResourceRequirements {
                limits: Some(BTreeMap::from([
                    ("cpu".to_owned(), Quantity("1".to_owned())),
                    ("memory".to_owned(), Quantity("256Mi".to_owned())),
                ])),
                requests: Some(BTreeMap::from([
                    ("cpu".to_owned(), Quantity("10m".to_owned())),
                    ("memory".to_owned(), Quantity("128Mi".to_owned())),
                ])),
                ..ResourceRequirements::default()
            }),
            readiness_probe: Some(Probe {
                tcp_socket: Some(TCPSocketAction {
                    port: IntOrString::Int(TOXIPROXY_ADMIN_PORT),
                    ..TCPSocketAction::default()
                }),
                initial_delay_seconds: Some(10),
                timeout_seconds: Some(1),
                ..Probe::default()
            }),
            ..Container::default()
        })
    }
}

#[async_trait]
impl Feature for ToxiproxyFeature {
    fn name(&self) -> &'static str {
        NAME
    }

    fn handlers(&self, _header: &AuroraDeploymentSpec, cmd: &DeploymentCommand) -> Vec<FieldHandler> {
        self.field_handlers(cmd)
    }

    fn is_active(&self, spec: &AuroraDeploymentSpec) -> bool {
        toxiproxy_version(spec).is_some()
    }

    async fn create_context(
        &self,
        spec: &AuroraDeploymentSpec,
        _cmd: &DeploymentCommand,
        validation_only: bool,
    ) -> Result<FeatureContext, ProvisioningError> {
        let Some(version) = toxiproxy_version(spec) else {
            return Ok(FeatureContext::default());
        };
        if validation_only {
            return Ok(FeatureContext::default());
        }

        let image = image_ref(&self.image, version);
        let metadata = self.images.resolve(&image).await?;
        debug!(%image, digest = ?metadata.digest, "resolved toxiproxy image metadata");

        let bindings = self.proxy_bindings(spec).await?;
        debug!(proxies = bindings.len(), "bound toxiproxy proxies");
        Ok(FeatureContext::new()
            .with(IMAGE_METADATA_KEY, metadata)
            .with(PROXY_BINDINGS_KEY, bindings))
    }

    fn validate(
        &self,
        spec: &AuroraDeploymentSpec,
        _full_validation: bool,
        _context: &FeatureContext,
    ) -> Vec<ConfigFieldError> {
        match spec.template_type() {
            Ok(template_type) if template_type.is_job() => vec![
                ConfigFieldError::generic(format!(
                    "Toxiproxy is not supported for applications of type {template_type}"
                ))
                .with_field("toxiproxy"),
            ],
            _ => validate_proxies(spec),
        }
    }

    fn generate(
        &self,
        spec: &AuroraDeploymentSpec,
        _cmd: &DeploymentCommand,
        context: &FeatureContext,
    ) -> Result<Vec<AuroraResource>> {
        let configs: Vec<_> = context
            .get::<Vec<ProxyBinding>>(PROXY_BINDINGS_KEY)?
            .iter()
            .map(|binding| &binding.config)
            .collect();
        let config = serde_json::to_string(&configs).context(RenderSnafu {
            what: "toxiproxy config",
        })?;
        let config_map = ConfigMap {
            metadata: object_meta(spec, config_map_name(spec)?)?,
            data: Some(BTreeMap::from([("config.json".to_owned(), config)])),
            ..ConfigMap::default()
        };
        Ok(vec![AuroraResource::new(config_map, NAME)])
    }

    fn modify(
        &self,
        spec: &AuroraDeploymentSpec,
        _cmd: &DeploymentCommand,
        resources: &mut ResourceSet,
        context: &FeatureContext,
    ) -> Result<()> {
        let Some(version) = toxiproxy_version(spec) else {
            return Ok(());
        };
        let bindings = context.get::<Vec<ProxyBinding>>(PROXY_BINDINGS_KEY)?;
        let env = proxied_env(spec, &enabled_proxies(spec)?, bindings);
        let name = config_map_name(spec)?;
        let volume: Volume = VolumeBuilder::new(&name).with_config_map(&name).build();
        let container = self.container(spec, version, context)?;

        resources.modify_pod_specs(NAME, "Added toxiproxy volume and sidecar container", |pod| {
            let env_vars = pod
                .containers
                .iter_mut()
                .flat_map(|container| container.env.iter_mut().flatten());
            for env_var in env_vars.filter(|env_var| env_var.value.is_some()) {
                if let Some(value) = env.get(&env_var.name) {
                    env_var.value = Some(value.clone());
                }
            }
            pod.volumes.get_or_insert_with(Vec::new).insert(0, volume.clone());
            pod.containers.insert(0, container.clone());
        });
        resources.modify_services(NAME, "Changed targetPort to point to toxiproxy", |service| {
            let ports = service
                .spec
                .iter_mut()
                .flat_map(|spec| spec.ports.iter_mut().flatten())
                .filter(|port| port.name.as_deref() == Some("http"));
            for port in ports {
                port.target_port = Some(IntOrString::Int(TOXIPROXY_HTTP_PORT));
            }
        });

        for binding in bindings {
            let Some(secret_name) = &binding.secret_name else {
                continue;
            };
            for resource in resources.iter_mut() {
                let Manifest::Secret(secret) = &mut resource.manifest else {
                    continue;
                };
                if secret.metadata.name.as_ref() == Some(secret_name) {
                    point_secret_to_proxy(secret, binding.port);
                    resource.record_modification(NAME, "Changed JDBC URL to point to toxiproxy");
                }
            }
        }
        Ok(())
    }
}
