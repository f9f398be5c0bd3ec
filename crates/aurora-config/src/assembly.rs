//! Turns the active features of a validated request into one resource set.
use std::{collections::BTreeSet, sync::Arc};

use itertools::Itertools as _;
use snafu::{ResultExt as _, Snafu, ensure};
use tracing::debug;

use crate::{
    deployment::DeploymentCommand,
    feature::{self, Feature, FeatureContext},
    resource::{self, ResourceSet},
    spec::AuroraDeploymentSpec,
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("feature {feature} failed to generate resources"))]
    Generate {
        source: feature::Error,
        feature: &'static str,
    },

    #[snafu(display("The following resources are generated more then once {resources}"))]
    DuplicateResources { resources: String },

    #[snafu(display("feature {feature} failed to modify resources"))]
    Modify {
        source: feature::Error,
        feature: &'static str,
    },
}

/// A feature that takes part in assembly, together with the context it
/// created for the request.
#[derive(Clone)]
pub struct ActiveFeature {
    pub feature: Arc<dyn Feature>,
    pub context: FeatureContext,
}

impl std::fmt::Debug for ActiveFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveFeature")
            .field("feature", &self.feature.name())
            .field("context", &self.context)
            .finish()
    }
}

/// Runs `generate` of every feature, then `modify` of every feature, both in
/// registration order.
///
/// Identities generated more than once are reported together and fail the
/// request before any modify pass runs.
pub fn assemble(
    features: &[ActiveFeature],
    spec: &AuroraDeploymentSpec,
    cmd: &DeploymentCommand,
) -> Result<ResourceSet> {
    let mut generated = Vec::new();
    for ActiveFeature { feature, context } in features {
        let resources = feature
            .generate(spec, cmd, context)
            .context(GenerateSnafu {
                feature: feature.name(),
            })?;
        debug!(
            feature = feature.name(),
            count = resources.len(),
            "generated resources"
        );
        generated.extend(resources);
    }

    let mut resources = ResourceSet::new();
    let mut duplicates = BTreeSet::new();
    for resource in generated {
        if let Err(resource::Error::DuplicateResource { id, .. }) = resources.insert(resource) {
            duplicates.insert(id);
        }
    }
    ensure!(
        duplicates.is_empty(),
        DuplicateResourcesSnafu {
            resources: duplicates.iter().join(", ")
        }
    );

    for ActiveFeature { feature, context } in features {
        feature
            .modify(spec, cmd, &mut resources, context)
            .context(ModifySnafu {
                feature: feature.name(),
            })?;
    }

    Ok(resources)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::ConfigMap;
    use serde_json::json;

    use super::*;
    use crate::{
        builder::meta::ObjectMetaBuilder,
        document::{ApplicationRef, AuroraConfig, ConfigDocument},
        field::FieldHandler,
        resource::{AuroraResource, Manifest},
    };

    /// Generates the named ConfigMaps and, when modifying, writes a data key
    /// that records which keys earlier features had written.
    struct ConfigMapFeature {
        name: &'static str,
        config_maps: &'static [&'static str],
    }

    #[async_trait]
    impl Feature for ConfigMapFeature {
        fn name(&self) -> &'static str {
            self.name
        }

        fn handlers(&self, _header: &AuroraDeploymentSpec, _cmd: &DeploymentCommand) -> Vec<FieldHandler> {
            Vec::new()
        }

        fn generate(
            &self,
            _spec: &AuroraDeploymentSpec,
            _cmd: &DeploymentCommand,
            _context: &FeatureContext,
        ) -> feature::Result<Vec<AuroraResource>> {
            Ok(self
                .config_maps
                .iter()
                .map(|name| {
                    AuroraResource::new(
                        ConfigMap {
                            metadata: ObjectMetaBuilder::new().name(*name).build(),
                            ..ConfigMap::default()
                        },
                        self.name,
                    )
                })
                .collect())
        }

        fn modify(
            &self,
            _spec: &AuroraDeploymentSpec,
            _cmd: &DeploymentCommand,
            resources: &mut ResourceSet,
            _context: &FeatureContext,
        ) -> feature::Result<()> {
            for resource in resources.iter_mut() {
                if let Manifest::ConfigMap(config_map) = &mut resource.manifest {
                    let data = config_map.data.get_or_insert_with(Default::default);
                    let seen = data.keys().join(",");
                    data.insert(self.name.to_owned(), seen);
                    resource.record_modification(self.name, "Recorded earlier keys");
                }
            }
            Ok(())
        }
    }

    fn active(name: &'static str, config_maps: &'static [&'static str]) -> ActiveFeature {
        ActiveFeature {
            feature: Arc::new(ConfigMapFeature { name, config_maps }),
            context: FeatureContext::default(),
        }
    }

    fn command() -> DeploymentCommand {
        let config = AuroraConfig::new(
            "paas",
            vec![
                ConfigDocument::new("about.json", json!({"affiliation": "paas"})),
                ConfigDocument::new("reference.json", json!({})),
                ConfigDocument::new("utv/about.json", json!({})),
                ConfigDocument::new("utv/reference.json", json!({})),
            ],
        );
        DeploymentCommand::new(&config, ApplicationRef::new("utv", "reference"), Vec::new())
            .expect("all files are present")
    }

    #[test]
    fn every_duplicate_identity_is_reported_at_once() {
        let features = [
            active("First", &["a", "b", "c"]),
            active("Second", &["b"]),
            active("Third", &["c", "d"]),
        ];

        let error = assemble(&features, &AuroraDeploymentSpec::default(), &command())
            .expect_err("b and c are generated twice");
        assert_eq!(
            error.to_string(),
            "The following resources are generated more then once ConfigMap/b, ConfigMap/c"
        );
    }

    #[test]
    fn modify_runs_in_registration_order_after_all_generates() {
        let features = [active("First", &[]), active("Second", &["a"]), active("Third", &[])];

        let resources = assemble(&features, &AuroraDeploymentSpec::default(), &command())
            .expect("identities are unique");

        let [resource]: [AuroraResource; 1] = resources.into_vec().try_into().expect("one resource");
        let Manifest::ConfigMap(config_map) = &resource.manifest else {
            panic!("expected a ConfigMap, got {:?}", resource.manifest);
        };
        let data = config_map.data.as_ref().expect("modify wrote data");
        assert_eq!(data["First"], "");
        assert_eq!(data["Second"], "First");
        assert_eq!(data["Third"], "First,Second");
        assert_eq!(
            resource
                .modifications
                .iter()
                .map(|modification| modification.feature.as_str())
                .collect::<Vec<_>>(),
            ["First", "Second", "Third"]
        );
    }
}
