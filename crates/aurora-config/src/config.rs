//! Settings of the engine itself, as opposed to the AuroraConfig it reads.
use std::path::Path;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt as _, Snafu};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read engine config from {path:?}"))]
    ReadFile {
        source: std::io::Error,
        path: std::path::PathBuf,
    },

    #[snafu(display("failed to parse engine config from {path:?}"))]
    ParseFile {
        source: serde_yaml::Error,
        path: std::path::PathBuf,
    },
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// The cluster this engine deploys to. Provisioning is only attempted for
    /// applications targeting it.
    pub cluster: String,

    /// Appended to every route host.
    pub route_suffix: String,
    pub docker_registry: String,

    /// Where database and vault secrets are mounted.
    pub secrets_path: String,
    pub config_mount_path: String,
    pub toxiproxy_default_version: String,
    pub toxiproxy_image: String,
    pub fluentbit: FluentbitConfig,
}

/// The logging sidecar and the Splunk HEC endpoint it ships to.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FluentbitConfig {
    pub image: String,
    pub tag: String,
    pub cpu_limit: String,

    /// How often a failed chunk is sent again, the fluent-bit default if unset.
    pub retry_limit: Option<u32>,
    pub hec_token: String,
    pub splunk_host: String,
    pub splunk_port: String,
}

impl Default for FluentbitConfig {
    fn default() -> Self {
        Self {
            image: "docker.io/fluent/fluent-bit".to_owned(),
            tag: "2.2.2".to_owned(),
            cpu_limit: "100m".to_owned(),
            retry_limit: None,
            hec_token: String::new(),
            splunk_host: "splunk-hec.cluster.local".to_owned(),
            splunk_port: "8088".to_owned(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cluster: "utv".to_owned(),
            route_suffix: ".apps.cluster.local".to_owned(),
            docker_registry: "docker-registry.default.svc:5000".to_owned(),
            secrets_path: "/u01/secrets/app".to_owned(),
            config_mount_path: "/u01/config/configmap".to_owned(),
            toxiproxy_default_version: "2.1.3".to_owned(),
            toxiproxy_image: "docker.io/shopify/toxiproxy".to_owned(),
            fluentbit: FluentbitConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        serde_yaml::from_str(&text).context(ParseFileSnafu { path })
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn missing_keys_use_defaults() {
        let config: EngineConfig = serde_yaml::from_str(indoc! {"
            cluster: prod
            routeSuffix: .apps.prod.example.com
        "})
        .expect("valid engine config");

        assert_eq!(config.cluster, "prod");
        assert_eq!(config.route_suffix, ".apps.prod.example.com");
        assert_eq!(config.secrets_path, EngineConfig::default().secrets_path);
        assert_eq!(config.fluentbit, FluentbitConfig::default());
    }

    #[test]
    fn nested_sections_fill_in_defaults() {
        let config: EngineConfig = serde_yaml::from_str(indoc! {"
            fluentbit:
              hecToken: secret-token
              retryLimit: 3
        "})
        .expect("valid engine config");

        assert_eq!(config.fluentbit.hec_token, "secret-token");
        assert_eq!(config.fluentbit.retry_limit, Some(3));
        assert_eq!(config.fluentbit.image, "docker.io/fluent/fluent-bit");
    }

    #[test]
    fn reads_from_file() {
        let dir = tempfile::tempdir().expect("temporary directory");
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "dockerRegistry: registry.example.com\n").expect("writable");

        let config = EngineConfig::from_yaml_file(&path).expect("valid engine config");
        assert_eq!(config.docker_registry, "registry.example.com");
    }
}
