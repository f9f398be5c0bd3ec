//! Exposes the Service through the webseal reverse proxy.
use std::collections::BTreeMap;

use itertools::Itertools as _;

use crate::{
    builder::meta::insert_annotation,
    deployment::DeploymentCommand,
    feature::{Feature, FeatureContext, Result},
    field::FieldHandler,
    resource::ResourceSet,
    spec::{self, AuroraDeploymentSpec},
};

const NAME: &str = "Webseal";

pub const WEBSEAL_ANNOTATION: &str = "sprocket.sits.no/service.webseal";
pub const WEBSEAL_ROLES_ANNOTATION: &str = "sprocket.sits.no/service.webseal-roles";

pub struct WebsealFeature;

/// The Service annotations, empty if webseal is off.
fn webseal_annotations(spec: &AuroraDeploymentSpec) -> Result<BTreeMap<&'static str, String>, spec::Error> {
    let Some(field) = spec.feature_enabled("webseal", ToOwned::to_owned) else {
        return Ok(BTreeMap::new());
    };

    let host = match spec.extract_or_none(&format!("{field}/host")) {
        Some(host) => host,
        None => format!("{}-{}", spec.name()?, spec.namespace()?),
    };
    let mut annotations = BTreeMap::from([(WEBSEAL_ANNOTATION, host)]);

    let roles = spec.delimited_string_or_array_as_set(&format!("{field}/roles"));
    if !roles.is_empty() {
        annotations.insert(WEBSEAL_ROLES_ANNOTATION, roles.iter().join(","));
    }
    Ok(annotations)
}

fn webseal_handlers() -> Vec<FieldHandler> {
    vec![
        FieldHandler::new("webseal").simplified().with_default(false),
        FieldHandler::new("webseal/host"),
        FieldHandler::new("webseal/roles"),
    ]
}

impl Feature for WebsealFeature {
    fn name(&self) -> &'static str {
        NAME
    }

    fn handlers(&self, _header: &AuroraDeploymentSpec, _cmd: &DeploymentCommand) -> Vec<FieldHandler> {
        webseal_handlers()
    }

    fn is_active(&self, spec: &AuroraDeploymentSpec) -> bool {
        spec.feature_enabled("webseal", |_| ()).is_some()
    }

    fn modify(
        &self,
        spec: &AuroraDeploymentSpec,
        _cmd: &DeploymentCommand,
        resources: &mut ResourceSet,
        _context: &FeatureContext,
    ) -> Result<()> {
        let annotations = webseal_annotations(spec)?;
        if annotations.is_empty() {
            return Ok(());
        }

        resources.modify_services(NAME, "Added webseal annotations", |service| {
            for (key, value) in &annotations {
                insert_annotation(&mut service.metadata, key, value.clone());
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::{Value, json};

    use super::*;
    use crate::{document::ConfigDocument, field::resolver::resolve};

    fn spec(app: Value) -> AuroraDeploymentSpec {
        let documents = [
            ConfigDocument::new("about.json", json!({"affiliation": "paas"})),
            ConfigDocument::new("utv/reference.json", app),
        ];
        let mut handlers = vec![
            FieldHandler::new("name").with_default("reference"),
            FieldHandler::new("envName").with_default("utv"),
            FieldHandler::new("affiliation"),
        ];
        handlers.extend(webseal_handlers());
        AuroraDeploymentSpec::new(resolve(&handlers, &documents))
    }

    #[rstest]
    #[case(json!({}), &[])]
    #[case(json!({"webseal": false}), &[])]
    #[case(
        json!({"webseal": true}),
        &[(WEBSEAL_ANNOTATION, "reference-paas-utv")],
    )]
    #[case(
        json!({"webseal": {"host": "custom", "roles": "a, b"}}),
        &[(WEBSEAL_ANNOTATION, "custom"), (WEBSEAL_ROLES_ANNOTATION, "a,b")],
    )]
    #[case(
        json!({"webseal": {"roles": ["x", "y"]}}),
        &[(WEBSEAL_ANNOTATION, "reference-paas-utv"), (WEBSEAL_ROLES_ANNOTATION, "x,y")],
    )]
    fn annotations(#[case] app: Value, #[case] expected: &[(&str, &str)]) {
        let annotations = webseal_annotations(&spec(app)).expect("fields resolve");
        let annotations: Vec<_> = annotations
            .iter()
            .map(|(key, value)| (*key, value.as_str()))
            .collect();

        assert_eq!(annotations, expected);
    }
}
