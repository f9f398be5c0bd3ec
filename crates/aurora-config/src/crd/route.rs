use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// An OpenShift route exposing a Service under a host name.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "route.openshift.io",
    version = "v1",
    kind = "Route",
    plural = "routes",
    namespaced,
    derive = "PartialEq",
    crates(
        kube_core = "kube::core",
        k8s_openapi = "k8s_openapi",
        schemars = "schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    pub host: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    pub to: RouteTarget,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<RouteTls>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTarget {
    pub kind: String,
    pub name: String,
}

impl RouteTarget {
    pub fn service(name: impl Into<String>) -> Self {
        Self {
            kind: "Service".to_owned(),
            name: name.into(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTls {
    pub termination: String,
    pub insecure_edge_termination_policy: String,
}

impl Route {
    /// The URL the route is reachable under.
    pub fn url(&self) -> String {
        let scheme = if self.spec.tls.is_some() { "https" } else { "http" };
        let path = self.spec.path.as_deref().unwrap_or_default();
        format!("{scheme}://{host}{path}", host = self.spec.host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_follows_tls() {
        let mut route = Route::new(
            "reference",
            RouteSpec {
                host: "reference-paas-utv.apps.cluster.local".to_owned(),
                path: Some("/api".to_owned()),
                to: RouteTarget::service("reference"),
                tls: None,
            },
        );
        assert_eq!(route.url(), "http://reference-paas-utv.apps.cluster.local/api");

        route.spec.tls = Some(RouteTls {
            termination: "edge".to_owned(),
            insecure_edge_termination_policy: "Redirect".to_owned(),
        });
        assert_eq!(route.url(), "https://reference-paas-utv.apps.cluster.local/api");
    }
}
