//! The resources features generate and modify.
//!
//! A resource is identified by its kind and name. Within one request every
//! identity exists at most once.
use std::fmt::Display;

use k8s_openapi::{
    api::{
        apps::v1::Deployment,
        core::v1::{ConfigMap, PodSpec, Secret, Service},
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::Resource as _;
use serde::Serialize;
use snafu::Snafu;

use crate::crd::{application_deployment::ApplicationDeployment, route::Route};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("resource {id} was already created by feature {created_by}"))]
    DuplicateResource { id: ResourceId, created_by: String },
}

/// Every kind of object the engine can produce.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Manifest {
    Deployment(Box<Deployment>),
    Service(Service),
    ConfigMap(ConfigMap),
    Secret(Secret),
    Route(Route),
    ApplicationDeployment(ApplicationDeployment),
}

macro_rules! impl_from_manifest {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for Manifest {
                fn from(value: $variant) -> Self {
                    Self::$variant(value)
                }
            }
        )*
    };
}

impl_from_manifest!(Service, ConfigMap, Secret, Route, ApplicationDeployment);

impl From<Deployment> for Manifest {
    fn from(value: Deployment) -> Self {
        Self::Deployment(Box::new(value))
    }
}

impl Manifest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Deployment(_) => "Deployment",
            Self::Service(_) => "Service",
            Self::ConfigMap(_) => "ConfigMap",
            Self::Secret(_) => "Secret",
            Self::Route(_) => "Route",
            Self::ApplicationDeployment(_) => "ApplicationDeployment",
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::Deployment(deployment) => deployment.meta(),
            Self::Service(service) => service.meta(),
            Self::ConfigMap(config_map) => config_map.meta(),
            Self::Secret(secret) => secret.meta(),
            Self::Route(route) => route.meta(),
            Self::ApplicationDeployment(ad) => ad.meta(),
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::Deployment(deployment) => deployment.meta_mut(),
            Self::Service(service) => service.meta_mut(),
            Self::ConfigMap(config_map) => config_map.meta_mut(),
            Self::Secret(secret) => secret.meta_mut(),
            Self::Route(route) => route.meta_mut(),
            Self::ApplicationDeployment(ad) => ad.meta_mut(),
        }
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }
}

/// The identity of a resource within one request.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ResourceId {
    pub kind: &'static str,
    pub name: String,
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// A change a feature made to a resource it did not create.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Modification {
    pub feature: String,
    pub comment: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuroraResource {
    pub manifest: Manifest,
    pub created_by: String,
    pub modifications: Vec<Modification>,
}

impl AuroraResource {
    pub fn new(manifest: impl Into<Manifest>, created_by: impl Into<String>) -> Self {
        Self {
            manifest: manifest.into(),
            created_by: created_by.into(),
            modifications: Vec::new(),
        }
    }

    pub fn id(&self) -> ResourceId {
        ResourceId {
            kind: self.manifest.kind(),
            name: self.manifest.name().to_owned(),
        }
    }

    pub fn record_modification(&mut self, feature: &str, comment: &str) {
        self.modifications.push(Modification {
            feature: feature.to_owned(),
            comment: comment.to_owned(),
        });
    }
}

/// The resources of one request, in insertion order.
///
/// There is no way to remove a resource once it is part of the set.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ResourceSet {
    resources: Vec<AuroraResource>,
}

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a resource, failing if its identity is already taken.
    pub fn insert(&mut self, resource: AuroraResource) -> Result<(), Error> {
        let id = resource.id();
        if let Some(existing) = self.get(&id) {
            return DuplicateResourceSnafu {
                id,
                created_by: existing.created_by.clone(),
            }
            .fail();
        }
        self.resources.push(resource);
        Ok(())
    }

    pub fn get(&self, id: &ResourceId) -> Option<&AuroraResource> {
        self.resources.iter().find(|resource| &resource.id() == id)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AuroraResource> {
        self.resources.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut AuroraResource> {
        self.resources.iter_mut()
    }

    pub fn into_vec(self) -> Vec<AuroraResource> {
        self.resources
    }

    /// Calls `f` for every Deployment and records the change on it.
    pub fn modify_deployments(
        &mut self,
        feature: &str,
        comment: &str,
        mut f: impl FnMut(&mut Deployment),
    ) {
        for resource in &mut self.resources {
            if let Manifest::Deployment(deployment) = &mut resource.manifest {
                f(deployment);
                resource.record_modification(feature, comment);
            }
        }
    }

    /// Calls `f` with the pod template of every Deployment.
    pub fn modify_pod_specs(&mut self, feature: &str, comment: &str, mut f: impl FnMut(&mut PodSpec)) {
        self.modify_deployments(feature, comment, |deployment| {
            if let Some(pod) = deployment
                .spec
                .as_mut()
                .and_then(|spec| spec.template.spec.as_mut())
            {
                f(pod);
            }
        });
    }

    pub fn modify_services(&mut self, feature: &str, comment: &str, mut f: impl FnMut(&mut Service)) {
        for resource in &mut self.resources {
            if let Manifest::Service(service) = &mut resource.manifest {
                f(service);
                resource.record_modification(feature, comment);
            }
        }
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.resources.iter().filter_map(|resource| match &resource.manifest {
            Manifest::Route(route) => Some(route),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::apps::v1::DeploymentSpec;

    use super::*;
    use crate::builder::meta::ObjectMetaBuilder;

    fn config_map(name: &str) -> AuroraResource {
        AuroraResource::new(
            ConfigMap {
                metadata: ObjectMetaBuilder::new().name(name).build(),
                ..ConfigMap::default()
            },
            "Config",
        )
    }

    #[test]
    fn insert_rejects_taken_identities() {
        let mut resources = ResourceSet::new();
        resources.insert(config_map("reference")).expect("first insert");
        resources
            .insert(AuroraResource::new(
                Secret {
                    metadata: ObjectMetaBuilder::new().name("reference").build(),
                    ..Secret::default()
                },
                "Database",
            ))
            .expect("same name of another kind is fine");

        let error = resources
            .insert(config_map("reference"))
            .expect_err("identity is taken");
        assert_eq!(
            error.to_string(),
            "resource ConfigMap/reference was already created by feature Config"
        );
        assert_eq!(resources.len(), 2);
    }

    #[test]
    fn modifications_are_recorded() {
        let mut resources = ResourceSet::new();
        resources.insert(config_map("reference")).expect("insert");
        resources
            .insert(AuroraResource::new(
                Deployment {
                    metadata: ObjectMetaBuilder::new().name("reference").build(),
                    spec: Some(DeploymentSpec::default()),
                    ..Deployment::default()
                },
                "Deployment",
            ))
            .expect("insert");

        resources.modify_deployments("CommonLabels", "Added labels", |deployment| {
            deployment.metadata.labels = Some([("app".to_owned(), "reference".to_owned())].into());
        });

        let modified: Vec<_> = resources
            .iter()
            .map(|resource| resource.modifications.len())
            .collect();
        assert_eq!(modified, [0, 1]);
    }
}
