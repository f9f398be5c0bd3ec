//! Helpers for the pod template parts features add to a Deployment.
use k8s_openapi::{
    api::core::v1::{
        ConfigMapVolumeSource, Container, EnvVar, EnvVarSource, HTTPGetAction, PodSpec, Probe,
        SecretKeySelector, SecretVolumeSource, TCPSocketAction, Volume, VolumeMount,
    },
    apimachinery::pkg::util::intstr::IntOrString,
};

pub fn env_var(name: impl Into<String>, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..Default::default()
    }
}

pub fn env_var_from_secret(
    env_var_name: impl Into<String>,
    secret_name: impl Into<String>,
    secret_key: impl Into<String>,
) -> EnvVar {
    EnvVar {
        name: env_var_name.into(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret_name.into(),
                key: secret_key.into(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A builder to build [`Volume`] objects backed by a ConfigMap or a Secret.
/// A call like `secret` after `config_map` overwrites the ConfigMap source.
#[derive(Clone, Debug, Default)]
pub struct VolumeBuilder {
    name: String,
    source: Option<VolumeSource>,
}

#[derive(Clone, Debug)]
enum VolumeSource {
    ConfigMap(ConfigMapVolumeSource),
    Secret(SecretVolumeSource),
}

impl VolumeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_config_map(&mut self, name: impl Into<String>) -> &mut Self {
        self.source = Some(VolumeSource::ConfigMap(ConfigMapVolumeSource {
            name: name.into(),
            ..ConfigMapVolumeSource::default()
        }));
        self
    }

    pub fn with_secret(&mut self, secret_name: impl Into<String>, optional: bool) -> &mut Self {
        self.source = Some(VolumeSource::Secret(SecretVolumeSource {
            optional: Some(optional),
            secret_name: Some(secret_name.into()),
            ..SecretVolumeSource::default()
        }));
        self
    }

    pub fn build(&self) -> Volume {
        let name = self.name.clone();
        match &self.source {
            Some(VolumeSource::ConfigMap(config_map)) => Volume {
                name,
                config_map: Some(config_map.clone()),
                ..Volume::default()
            },
            Some(VolumeSource::Secret(secret)) => Volume {
                name,
                secret: Some(secret.clone()),
                ..Volume::default()
            },
            None => Volume {
                name,
                ..Volume::default()
            },
        }
    }
}

pub fn volume_mount(name: impl Into<String>, mount_path: impl Into<String>) -> VolumeMount {
    VolumeMount {
        mount_path: mount_path.into(),
        name: name.into(),
        ..VolumeMount::default()
    }
}

/// An HTTP GET probe when `path` is set, a TCP probe otherwise.
pub fn probe(port: u16, path: Option<&str>, delay_seconds: i32, timeout_seconds: i32) -> Probe {
    let port = IntOrString::Int(port.into());
    let (http_get, tcp_socket) = match path {
        Some(path) => (
            Some(HTTPGetAction {
                path: Some(path.to_owned()),
                port,
                ..HTTPGetAction::default()
            }),
            None,
        ),
        None => (
            None,
            Some(TCPSocketAction {
                port,
                ..TCPSocketAction::default()
            }),
        ),
    };

    Probe {
        http_get,
        tcp_socket,
        initial_delay_seconds: Some(delay_seconds),
        timeout_seconds: Some(timeout_seconds),
        ..Probe::default()
    }
}

/// Adds a volume to the pod and mounts it into every container.
pub fn add_volume(pod: &mut PodSpec, volume: Volume, mount_path: &str) {
    let mount = volume_mount(&volume.name, mount_path);
    for container in &mut pod.containers {
        container
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .push(mount.clone());
    }
    pod.volumes.get_or_insert_with(Vec::new).push(volume);
}

/// Adds env vars to every container of the pod.
pub fn add_env(pod: &mut PodSpec, env: &[EnvVar]) {
    for container in &mut pod.containers {
        add_container_env(container, env);
    }
}

pub fn add_container_env(container: &mut Container, env: &[EnvVar]) {
    container
        .env
        .get_or_insert_with(Vec::new)
        .extend_from_slice(env);
}
