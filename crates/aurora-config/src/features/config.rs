//! Application configuration: `config` entries as env vars and properties
//! files, and secret vaults as Secrets.
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use async_trait::async_trait;
use futures::future::try_join_all;
use itertools::Itertools as _;
use k8s_openapi::{
    ByteString,
    api::core::v1::{ConfigMap, Secret},
};
use tracing::debug;

use super::{ensure_starts_with, env_name, object_meta, sub_key_values};
use crate::{
    builder::pod::{VolumeBuilder, add_env, add_volume, env_var, env_var_from_secret},
    deployment::DeploymentCommand,
    feature::{Feature, FeatureContext, Result},
    field::{FieldHandler, discovery, validators},
    provision::{ProvisioningError, VaultProvider},
    resource::{AuroraResource, ResourceSet},
    spec::{self, AuroraDeploymentSpec},
    validation::ConfigFieldError,
};

const NAME: &str = "Config";
const CONFIG_VOLUME: &str = "config";
const DEFAULT_VAULT_FILE: &str = "latest.properties";
const MAX_SECRET_NAME_LEN: usize = 63;

/// Context key of the [`VaultContents`] of all configured vaults.
pub const VAULT_CONTENTS_KEY: &str = "vaultContents";

/// Vault files keyed by vault name, then by file name.
pub type VaultContents = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

/// One vault the application reads secrets from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SecretVault {
    pub vault: String,
    pub file: String,

    /// The keys to expose, all keys of the file if empty.
    pub keys: Vec<String>,
    pub key_mappings: BTreeMap<String, String>,
    pub secret_name: String,
}

impl SecretVault {
    /// The entries of the vault file that end up in the Secret, with mapped
    /// keys. [`None`] if the file is missing.
    fn entries(&self, contents: &VaultContents) -> Option<BTreeMap<String, String>> {
        let file = contents.get(&self.vault)?.get(&self.file)?;
        Some(
            parse_properties(&String::from_utf8_lossy(file))
                .into_iter()
                .filter(|(key, _)| self.keys.is_empty() || self.keys.contains(key))
                .map(|(key, value)| {
                    let key = self.key_mappings.get(&key).cloned().unwrap_or(key);
                    (key, value)
                })
                .collect(),
        )
    }
}

pub struct ConfigFeature {
    mount_path: String,
    vaults: Arc<dyn VaultProvider>,
}

impl ConfigFeature {
    pub fn new(mount_path: String, vaults: Arc<dyn VaultProvider>) -> Self {
        Self { mount_path, vaults }
    }
}

/// Parses `key=value` (or `key: value`) lines. Blank lines and lines starting
/// with `#` or `!` are skipped.
pub fn parse_properties(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(['#', '!']))
        .map(|line| match line.split_once(['=', ':']) {
            Some((key, value)) => (key.trim().to_owned(), value.trim().to_owned()),
            None => (line.to_owned(), String::new()),
        })
        .collect()
}

fn render_properties(entries: &BTreeMap<String, String>) -> String {
    entries
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .join("\n")
}

fn secret_name(app: &str, vault: &str) -> String {
    let name = vault.to_lowercase().replace('_', "-");
    let name = if name.ends_with("-vault") {
        name
    } else {
        format!("{name}-vault")
    };
    ensure_starts_with(&name, app, "-")
}

fn key_mappings(spec: &AuroraDeploymentSpec, prefix: &str) -> BTreeMap<String, String> {
    sub_key_values(spec, &format!("{prefix}/keyMappings"))
}

/// The vaults configured through `secretVault` and `secretVaults`.
pub fn secret_vaults(spec: &AuroraDeploymentSpec) -> Result<Vec<SecretVault>, spec::Error> {
    let app = spec.name()?;
    let mut vaults = Vec::new();

    let single = if spec.is_simplified_config("secretVault") {
        spec.value("secretVault")
            .and_then(|value| value.as_str())
            .map(ToOwned::to_owned)
    } else {
        spec.extract_or_none("secretVault/name")
    };
    if let Some(vault) = single.filter(|vault| !vault.is_empty()) {
        vaults.push(SecretVault {
            secret_name: secret_name(&app, &vault),
            file: DEFAULT_VAULT_FILE.to_owned(),
            keys: spec
                .delimited_string_or_array_as_set("secretVault/keys")
                .into_iter()
                .collect(),
            key_mappings: key_mappings(spec, "secretVault"),
            vault,
        });
    }

    for key in spec.sub_key_names("secretVaults") {
        let prefix = format!("secretVaults/{key}");
        if !spec.get_or(&format!("{prefix}/enabled"), true)? {
            continue;
        }
        vaults.push(SecretVault {
            vault: spec.extract_or_default(&format!("{prefix}/name"), &key),
            file: spec.extract_or_default(&format!("{prefix}/file"), DEFAULT_VAULT_FILE),
            keys: spec
                .delimited_string_or_array_as_set(&format!("{prefix}/keys"))
                .into_iter()
                .collect(),
            key_mappings: key_mappings(spec, &prefix),
            secret_name: secret_name(&app, &key),
        });
    }
    Ok(vaults)
}

fn vault_handlers(cmd: &DeploymentCommand) -> Vec<FieldHandler> {
    let documents = &cmd.documents;
    let mut handlers = vec![
        FieldHandler::new("secretVault").simplified(),
        FieldHandler::new("secretVault/name"),
        FieldHandler::new("secretVault/keys"),
    ];
    handlers.extend(discovery::sub_handlers(documents, "secretVault/keyMappings", |_| None));

    for key in discovery::sub_keys(documents, "secretVaults") {
        let prefix = format!("secretVaults/{key}");
        handlers.extend([
            FieldHandler::new(format!("{prefix}/name")).with_default(key.clone()),
            FieldHandler::new(format!("{prefix}/enabled"))
                .with_default(true)
                .with_validator(validators::boolean()),
            FieldHandler::new(format!("{prefix}/file")).with_default(DEFAULT_VAULT_FILE),
            FieldHandler::new(format!("{prefix}/keys")),
        ]);
        handlers.extend(discovery::sub_handlers(
            documents,
            &format!("{prefix}/keyMappings"),
            |_| None,
        ));
    }
    handlers
}

fn validate_vaults(
    vaults: &[SecretVault],
    affiliation: &str,
    contents: Option<&VaultContents>,
) -> Vec<ConfigFieldError> {
    let mut errors = Vec::new();

    for vault in vaults {
        if vault.secret_name.len() > MAX_SECRET_NAME_LEN {
            errors.push(ConfigFieldError::generic(format!(
                "The name of the secretVault={} is too long. Max 63 characters. Note that we ensure that the name starts with @name@-",
                vault.secret_name
            )));
        }

        if !vault.keys.is_empty() {
            let unknown: Vec<_> = vault
                .key_mappings
                .keys()
                .filter(|key| !vault.keys.contains(*key))
                .collect();
            if !unknown.is_empty() {
                errors.push(ConfigFieldError::generic(format!(
                    "The secretVault keyMappings [{}] were not found in keys",
                    unknown.iter().join(", ")
                )));
            }
        }

        let Some(contents) = contents else {
            continue;
        };
        let file = contents
            .get(&vault.vault)
            .and_then(|files| files.get(&vault.file));
        let Some(file) = file else {
            errors.push(ConfigFieldError::generic(format!(
                "File with name={} is not present in vault={} in collection={affiliation}",
                vault.file, vault.vault
            )));
            continue;
        };
        let present = parse_properties(&String::from_utf8_lossy(file));
        let missing: Vec<_> = vault
            .keys
            .iter()
            .filter(|key| !present.contains_key(*key))
            .collect();
        if !missing.is_empty() {
            errors.push(ConfigFieldError::generic(format!(
                "The keys [{}] were not found in the secret vault={} in collection={affiliation}",
                missing.iter().join(", "),
                vault.vault
            )));
        }
    }

    let duplicates: BTreeSet<_> = vaults
        .iter()
        .map(|vault| &vault.secret_name)
        .duplicates()
        .collect();
    if !duplicates.is_empty() {
        errors.push(ConfigFieldError::generic(format!(
            "SecretVaults does not have unique names=[{}]",
            duplicates.iter().join(", ")
        )));
    }
    errors
}

#[async_trait]
impl Feature for ConfigFeature {
    fn name(&self) -> &'static str {
        NAME
    }

    fn handlers(&self, _header: &AuroraDeploymentSpec, cmd: &DeploymentCommand) -> Vec<FieldHandler> {
        let mut handlers = discovery::config_field_handlers(&cmd.documents);
        handlers.extend(vault_handlers(cmd));
        handlers
    }

    async fn create_context(
        &self,
        spec: &AuroraDeploymentSpec,
        _cmd: &DeploymentCommand,
        validation_only: bool,
    ) -> Result<FeatureContext, ProvisioningError> {
        let (Ok(vaults), Ok(affiliation)) = (secret_vaults(spec), spec.affiliation()) else {
            return Ok(FeatureContext::default());
        };
        if validation_only || vaults.is_empty() {
            return Ok(FeatureContext::default());
        }

        let names: BTreeSet<_> = vaults.into_iter().map(|vault| vault.vault).collect();
        let files = try_join_all(
            names
                .iter()
                .map(|vault| self.vaults.vault_contents(&affiliation, vault)),
        )
        .await?;
        debug!(vaults = ?names, "read secret vaults");

        let contents: VaultContents = names.into_iter().zip(files).collect();
        Ok(FeatureContext::new().with(VAULT_CONTENTS_KEY, contents))
    }

    fn validate(
        &self,
        spec: &AuroraDeploymentSpec,
        _full_validation: bool,
        context: &FeatureContext,
    ) -> Vec<ConfigFieldError> {
        let vaults = match secret_vaults(spec) {
            Ok(vaults) => vaults,
            Err(error) => return vec![ConfigFieldError::generic(error.to_string())],
        };
        let Ok(affiliation) = spec.affiliation() else {
            return Vec::new();
        };
        let contents = context
            .get_or_none::<VaultContents>(VAULT_CONTENTS_KEY)
            .ok()
            .flatten();
        validate_vaults(&vaults, &affiliation, contents)
    }

    fn generate(
        &self,
        spec: &AuroraDeploymentSpec,
        _cmd: &DeploymentCommand,
        context: &FeatureContext,
    ) -> Result<Vec<AuroraResource>> {
        let mut resources = Vec::new();

        let files = spec.get_config_map();
        if !files.is_empty() {
            let config_map = ConfigMap {
                metadata: object_meta(spec, spec.name()?)?,
                data: Some(
                    files
                        .iter()
                        .map(|(file, entries)| (format!("{file}.properties"), render_properties(entries)))
                        .collect(),
                ),
                ..ConfigMap::default()
            };
            resources.push(AuroraResource::new(config_map, NAME));
        }

        let vaults = secret_vaults(spec)?;
        if !vaults.is_empty() {
            let contents = context.get::<VaultContents>(VAULT_CONTENTS_KEY)?;
            for vault in vaults {
                let data = vault
                    .entries(contents)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(key, value)| (key, ByteString(value.into_bytes())))
                    .collect();
                let secret = Secret {
                    metadata: object_meta(spec, &vault.secret_name)?,
                    data: Some(data),
                    type_: Some("Opaque".to_owned()),
                    ..Secret::default()
                };
                resources.push(AuroraResource::new(secret, NAME));
            }
        }
        Ok(resources)
    }

    fn modify(
        &self,
        spec: &AuroraDeploymentSpec,
        _cmd: &DeploymentCommand,
        resources: &mut ResourceSet,
        context: &FeatureContext,
    ) -> Result<()> {
        if !spec.get_config_map().is_empty() {
            let volume = VolumeBuilder::new(CONFIG_VOLUME)
                .with_config_map(spec.name()?)
                .build();
            resources.modify_pod_specs(NAME, "Added configmap volume", |pod| {
                add_volume(pod, volume.clone(), &self.mount_path);
            });
        }

        let mut env: Vec<_> = spec
            .get_config_env()
            .into_iter()
            .map(|(key, value)| env_var(env_name(&key), value))
            .collect();

        let vaults = secret_vaults(spec)?;
        if !vaults.is_empty() {
            let contents = context.get::<VaultContents>(VAULT_CONTENTS_KEY)?;
            for vault in &vaults {
                env.extend(
                    vault
                        .entries(contents)
                        .unwrap_or_default()
                        .into_keys()
                        .map(|key| env_var_from_secret(env_name(&key), &vault.secret_name, key)),
                );
            }
        }

        if !env.is_empty() {
            resources.modify_pod_specs(NAME, "Added env vars", |pod| add_env(pod, &env));
        }
        Ok(())
    }
}
