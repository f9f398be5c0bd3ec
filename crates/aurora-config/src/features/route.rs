//! OpenShift Routes in front of the application Service.
use std::{collections::BTreeMap, sync::Arc};

use super::{ensure_starts_with, sub_key_values};
use crate::{
    builder::{
        meta::ObjectMetaBuilder,
        pod::{add_env, env_var},
    },
    crd::route::{Route, RouteSpec, RouteTarget, RouteTls},
    deployment::DeploymentCommand,
    document::ConfigDocument,
    feature::{Feature, FeatureContext, Result},
    field::{FieldHandler, Validator, discovery, validators},
    resource::{AuroraResource, ResourceSet},
    spec::{self, AuroraDeploymentSpec},
};

const NAME: &str = "Route";

const TLS_TERMINATIONS: &[&str] = &["edge", "passthrough", "reencrypt"];
const INSECURE_POLICIES: &[&str] = &["Redirect", "None", "Allow"];

fn annotation_validator(key: &str) -> Option<Validator> {
    if !key.contains('/') {
        return None;
    }
    let message = format!("Annotation {key} cannot contain '/'. Use '|' instead");
    let validator: Validator = Arc::new(move |_| Some(message.clone()));
    Some(validator)
}

fn annotation_handlers(documents: &[ConfigDocument], prefix: &str) -> Vec<FieldHandler> {
    discovery::sub_handlers(documents, &format!("{prefix}/annotations"), annotation_validator)
}

fn route_handlers(documents: &[ConfigDocument]) -> Vec<FieldHandler> {
    let mut handlers = vec![
        FieldHandler::new("route")
            .simplified()
            .with_default(false)
            .with_validator(validators::boolean()),
        FieldHandler::new("routeDefaults/host").with_default("@name@-@affiliation@-@env@"),
        FieldHandler::new("routeDefaults/tls/enabled")
            .with_default(false)
            .with_validator(validators::boolean()),
        FieldHandler::new("routeDefaults/tls/termination")
            .with_default("edge")
            .with_validator(validators::one_of(TLS_TERMINATIONS, true)),
        FieldHandler::new("routeDefaults/tls/insecurePolicy")
            .with_default("Redirect")
            .with_validator(validators::one_of(INSECURE_POLICIES, true)),
    ];
    handlers.extend(annotation_handlers(documents, "routeDefaults"));

    for key in discovery::sub_keys_expanded(documents, "route") {
        handlers.extend([
            FieldHandler::new(format!("{key}/host")),
            FieldHandler::new(format!("{key}/path"))
                .with_validator(validators::starts_with("/", "Path must start with /")),
            FieldHandler::new(format!("{key}/tls/enabled")).with_validator(validators::boolean()),
            FieldHandler::new(format!("{key}/tls/insecurePolicy"))
                .with_validator(validators::one_of(INSECURE_POLICIES, false)),
            FieldHandler::new(format!("{key}/tls/termination"))
                .with_validator(validators::one_of(TLS_TERMINATIONS, false)),
        ]);
        handlers.extend(annotation_handlers(documents, &key));
    }
    handlers
}

/// A route as configured, before the cluster suffix is added to the host.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfiguredRoute {
    pub object_name: String,
    pub host: String,
    pub path: Option<String>,
    pub annotations: BTreeMap<String, String>,
    pub tls: Option<RouteTls>,
}

fn tls(spec: &AuroraDeploymentSpec, route: Option<&str>) -> Result<RouteTls, spec::Error> {
    let value = |suffix: &str| match route {
        Some(route) => spec.get_or_default::<String>("route", route, suffix),
        None => spec.get(&format!("routeDefaults/{suffix}")),
    };
    Ok(RouteTls {
        termination: value("tls/termination")?,
        insecure_edge_termination_policy: value("tls/insecurePolicy")?,
    })
}

/// `|` in annotation keys stands for `/`.
fn annotations(spec: &AuroraDeploymentSpec, prefix: &str) -> BTreeMap<String, String> {
    sub_key_values(spec, &format!("{prefix}/annotations"))
        .into_iter()
        .map(|(key, value)| (key.replace('|', "/"), value))
        .collect()
}

/// The routes of the application, named after the keys below `route`.
pub fn find_routes(
    spec: &AuroraDeploymentSpec,
    documents: &[ConfigDocument],
) -> Result<Vec<ConfiguredRoute>, spec::Error> {
    let name = spec.name()?;
    let defaults_tls: bool = spec.get("routeDefaults/tls/enabled")?;

    if spec.is_simplified_and_disabled("route") {
        return Ok(Vec::new());
    }
    if spec.is_simplified_config("route") {
        return Ok(vec![ConfiguredRoute {
            object_name: name,
            host: spec.extract("routeDefaults/host")?,
            path: None,
            annotations: annotations(spec, "routeDefaults"),
            tls: defaults_tls.then(|| tls(spec, None)).transpose()?,
        }]);
    }

    let placeholders = spec.placeholders();
    discovery::sub_keys(documents, "route")
        .into_iter()
        .map(|key| {
            let prefix = format!("route/{key}");
            let secure = match spec.get_or_none::<bool>(&format!("{prefix}/tls/enabled"))? {
                Some(enabled) => enabled,
                None => defaults_tls || spec.has_sub_keys(&format!("{prefix}/tls")),
            };
            let mut route_annotations = annotations(spec, "routeDefaults");
            route_annotations.extend(annotations(spec, &prefix));

            Ok(ConfiguredRoute {
                object_name: ensure_starts_with(&placeholders.replace(&key), &name, "-"),
                host: spec.get_or_default("route", &key, "host")?,
                path: spec.extract_or_none(&format!("{prefix}/path")),
                annotations: route_annotations,
                tls: secure.then(|| tls(spec, Some(&key))).transpose()?,
            })
        })
        .collect()
}

pub struct RouteFeature {
    route_suffix: String,
}

impl RouteFeature {
    pub fn new(route_suffix: String) -> Self {
        Self { route_suffix }
    }

    fn route(&self, spec: &AuroraDeploymentSpec, route: ConfiguredRoute) -> Result<Route, spec::Error> {
        let mut metadata = ObjectMetaBuilder::new();
        metadata.name(route.object_name).namespace(spec.namespace()?);
        if !route.annotations.is_empty() {
            metadata.with_annotations(route.annotations);
        }

        Ok(Route {
            metadata: metadata.build(),
            spec: RouteSpec {
                host: format!("{}{}", route.host, self.route_suffix),
                path: route.path,
                to: RouteTarget::service(spec.name()?),
                tls: route.tls,
            },
        })
    }
}

impl Feature for RouteFeature {
    fn name(&self) -> &'static str {
        NAME
    }

    fn handlers(&self, _header: &AuroraDeploymentSpec, cmd: &DeploymentCommand) -> Vec<FieldHandler> {
        route_handlers(&cmd.documents)
    }

    fn is_active(&self, spec: &AuroraDeploymentSpec) -> bool {
        !spec.is_simplified_and_disabled("route")
    }

    fn generate(
        &self,
        spec: &AuroraDeploymentSpec,
        cmd: &DeploymentCommand,
        _context: &FeatureContext,
    ) -> Result<Vec<AuroraResource>> {
        find_routes(spec, &cmd.documents)?
            .into_iter()
            .map(|route| Ok(AuroraResource::new(self.route(spec, route)?, NAME)))
            .collect()
    }

    fn modify(
        &self,
        _spec: &AuroraDeploymentSpec,
        _cmd: &DeploymentCommand,
        resources: &mut ResourceSet,
        _context: &FeatureContext,
    ) -> Result<()> {
        let Some(route) = resources.routes().next() else {
            return Ok(());
        };
        let env = [
            env_var(
                "ROUTE_NAME",
                format!(
                    "{}{}",
                    route.spec.host,
                    route.spec.path.as_deref().unwrap_or_default()
                ),
            ),
            env_var("ROUTE_URL", route.url()),
        ];

        resources.modify_pod_specs(NAME, "Added route env", |pod| add_env(pod, &env));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::{field::resolver::resolve, resource::Manifest};

    fn documents(app: Value) -> Vec<ConfigDocument> {
        vec![
            ConfigDocument::new("about.json", json!({"affiliation": "paas"})),
            ConfigDocument::new("utv/reference.json", app),
        ]
    }

    fn spec(documents: &[ConfigDocument]) -> AuroraDeploymentSpec {
        let mut handlers = vec![
            FieldHandler::new("name").with_default("reference"),
            FieldHandler::new("envName").with_default("utv"),
            FieldHandler::new("affiliation"),
        ];
        handlers.extend(route_handlers(documents));
        let mut fields = resolve(&handlers, documents);
        AuroraDeploymentSpec::new(fields.clone())
            .placeholders()
            .apply(&mut fields);
        AuroraDeploymentSpec::new(fields)
    }

    #[test]
    fn simplified_route_uses_defaults() {
        let documents = documents(json!({"route": true}));
        let routes = find_routes(&spec(&documents), &documents).expect("routes resolve");

        assert_eq!(
            routes,
            [ConfiguredRoute {
                object_name: "reference".to_owned(),
                host: "reference-paas-utv".to_owned(),
                path: None,
                annotations: BTreeMap::new(),
                tls: None,
            }]
        );
    }

    #[test]
    fn expanded_routes() {
        let documents = documents(json!({
            "routeDefaults": {"tls": {"enabled": true}},
            "route": {
                "api": {"host": "api-@env@", "path": "/api", "annotations": {"haproxy.router.openshift.io|timeout": "30s"}},
                "reference-web": {"tls": {"enabled": false}},
            },
        }));
        let routes = find_routes(&spec(&documents), &documents).expect("routes resolve");

        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].object_name, "reference-api");
        assert_eq!(routes[0].host, "api-utv");
        assert_eq!(routes[0].path.as_deref(), Some("/api"));
        assert_eq!(
            routes[0].annotations.get("haproxy.router.openshift.io/timeout").map(String::as_str),
            Some("30s")
        );
        assert_eq!(
            routes[0].tls,
            Some(RouteTls {
                termination: "edge".to_owned(),
                insecure_edge_termination_policy: "Redirect".to_owned(),
            })
        );
        assert_eq!(routes[1].object_name, "reference-web");
        assert_eq!(routes[1].host, "reference-paas-utv");
        assert_eq!(routes[1].tls, None);
    }

    #[test]
    fn annotations_may_not_contain_slashes() {
        let validator = annotation_validator("a/b").expect("slashes are validated");
        assert_eq!(
            validator(None).as_deref(),
            Some("Annotation a/b cannot contain '/'. Use '|' instead")
        );
        assert!(annotation_validator("a|b").is_none());
    }

    #[test]
    fn generated_routes_get_the_suffix() {
        let documents = documents(json!({"route": true}));
        let spec = spec(&documents);
        let feature = RouteFeature::new(".apps.cluster.local".to_owned());
        let config = crate::document::AuroraConfig::new(
            "paas",
            vec![
                documents[0].clone(),
                ConfigDocument::new("reference.json", json!({})),
                ConfigDocument::new("utv/about.json", json!({})),
                documents[1].clone(),
            ],
        );
        let cmd = DeploymentCommand::new(
            &config,
            crate::document::ApplicationRef::new("utv", "reference"),
            Vec::new(),
        )
        .expect("all files are present");

        let resources = feature
            .generate(&spec, &cmd, &FeatureContext::new())
            .expect("generation succeeds");
        let [resource] = resources.as_slice() else {
            panic!("expected one route, got {resources:?}");
        };
        let Manifest::Route(route) = &resource.manifest else {
            panic!("expected a Route");
        };
        assert_eq!(route.spec.host, "reference-paas-utv.apps.cluster.local");
        assert_eq!(route.spec.to, RouteTarget::service("reference"));
        assert_eq!(route.metadata.namespace.as_deref(), Some("paas-utv"));
    }
}
