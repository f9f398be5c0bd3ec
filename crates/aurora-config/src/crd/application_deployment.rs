use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{CustomResource, Resource as _};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The uid owner references are generated with. It is replaced by the uid
/// of the ApplicationDeployment once that exists in the cluster.
pub const PENDING_OWNER_UID: &str = "123-123";

/// Records which configuration produced the resources of one application
/// deployment. Every other generated resource is owned by it.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "skatteetaten.no",
    version = "v1",
    kind = "ApplicationDeployment",
    plural = "applicationdeployments",
    shortname = "ad",
    namespaced,
    derive = "PartialEq",
    crates(
        kube_core = "kube::core",
        k8s_openapi = "k8s_openapi",
        schemars = "schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationDeploymentSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    pub application_deployment_name: String,
    pub application_deployment_id: String,
    pub application_name: String,
    pub application_id: String,

    /// Ids of the database schemas the application uses.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub databases: Vec<String>,

    pub command: ApplicationDeploymentCommand,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationDeploymentCommand {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub override_files: BTreeMap<String, String>,

    /// `<environment>/<application>`
    pub application_deployment_ref: String,
    pub aurora_config: AuroraConfigRef,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuroraConfigRef {
    pub name: String,
    pub ref_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_ref: Option<String>,
}

impl ApplicationDeployment {
    /// An owner reference pointing at this resource, for the resources
    /// generated alongside it.
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: Self::api_version(&()).into_owned(),
            kind: Self::kind(&()).into_owned(),
            name: self.metadata.name.clone().unwrap_or_default(),
            uid: PENDING_OWNER_UID.to_owned(),
            ..OwnerReference::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn serializes_camel_case() {
        let spec = ApplicationDeploymentSpec {
            application_deployment_name: "reference".to_owned(),
            application_deployment_id: "abc".to_owned(),
            application_name: "reference".to_owned(),
            application_id: "def".to_owned(),
            command: ApplicationDeploymentCommand {
                application_deployment_ref: "utv/reference".to_owned(),
                aurora_config: AuroraConfigRef {
                    name: "paas".to_owned(),
                    ref_name: "master".to_owned(),
                    resolved_ref: None,
                },
                ..ApplicationDeploymentCommand::default()
            },
            ..ApplicationDeploymentSpec::default()
        };

        assert_eq!(
            serde_json::to_value(&spec).expect("spec serializes"),
            json!({
                "applicationDeploymentName": "reference",
                "applicationDeploymentId": "abc",
                "applicationName": "reference",
                "applicationId": "def",
                "command": {
                    "applicationDeploymentRef": "utv/reference",
                    "auroraConfig": {"name": "paas", "refName": "master"},
                },
            })
        );
    }

    #[test]
    fn owner_reference_points_at_the_resource() {
        let ad = ApplicationDeployment::new("reference", ApplicationDeploymentSpec::default());
        let owner = ad.owner_reference();

        assert_eq!(owner.api_version, "skatteetaten.no/v1");
        assert_eq!(owner.kind, "ApplicationDeployment");
        assert_eq!(owner.name, "reference");
    }
}
