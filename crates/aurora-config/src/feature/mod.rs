//! The extension point of the engine.
//!
//! A [`Feature`] owns one concern of an application deployment, such as
//! routes or databases. It declares the fields it reads, validates their
//! combination, may fetch external data and finally contributes resources.
//! Features are registered as an ordered list; the order decides the order of
//! the modify passes.
use std::{any::Any, collections::BTreeMap, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use itertools::Itertools as _;
use snafu::{OptionExt as _, Snafu};

use crate::{
    deployment::DeploymentCommand,
    field::FieldHandler,
    provision::ProvisioningError,
    resource::{self, AuroraResource, ResourceSet},
    spec::{self, AuroraDeploymentSpec},
    validation::ConfigFieldError,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("The feature context key={key} was not found in the context. keys=[{keys}]"))]
    MissingContextKey { key: String, keys: String },

    #[snafu(display("The feature context key={key} does not hold a {expected}"))]
    WrongContextType { key: String, expected: &'static str },

    #[snafu(display("failed to read the deployment spec"), context(false))]
    Spec { source: spec::Error },

    #[snafu(display("failed to add a resource"), context(false))]
    AddResource { source: resource::Error },

    #[snafu(display("failed to render {what}"))]
    Render {
        source: serde_json::Error,
        what: String,
    },
}

/// Values a feature computed in [`Feature::create_context`] for its later
/// phases, keyed by name.
#[derive(Clone, Default)]
pub struct FeatureContext {
    values: BTreeMap<String, Arc<dyn Any + Send + Sync>>,
}

impl FeatureContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) -> &mut Self {
        self.values.insert(key.into(), Arc::new(value));
        self
    }

    pub fn with<T: Any + Send + Sync>(mut self, key: impl Into<String>, value: T) -> Self {
        self.insert(key, value);
        self
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Result<&T> {
        let value = self.values.get(key).context(MissingContextKeySnafu {
            key,
            keys: self.values.keys().join(", "),
        })?;
        value
            .downcast_ref::<T>()
            .context(WrongContextTypeSnafu {
                key,
                expected: std::any::type_name::<T>(),
            })
    }

    /// Like [`Self::get`], but absent keys are not an error.
    pub fn get_or_none<T: Any + Send + Sync>(&self, key: &str) -> Result<Option<&T>> {
        if self.contains_key(key) {
            self.get(key).map(Some)
        } else {
            Ok(None)
        }
    }
}

impl Debug for FeatureContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

/// One concern of an application deployment.
///
/// Phases run in this order for every request: [`Self::enable`] and
/// [`Self::handlers`] before resolution, then [`Self::is_active`],
/// [`Self::create_context`] and [`Self::validate`]. Only if validation
/// succeeded, every active feature's [`Self::generate`] runs, followed by
/// every active feature's [`Self::modify`].
#[async_trait]
pub trait Feature: Send + Sync {
    /// A unique name, used as the creator of generated resources.
    fn name(&self) -> &'static str;

    /// Whether the feature takes part in a request at all, decided from the
    /// header. Disabled features do not even declare handlers.
    fn enable(&self, _header: &AuroraDeploymentSpec) -> bool {
        true
    }

    fn handlers(&self, header: &AuroraDeploymentSpec, cmd: &DeploymentCommand) -> Vec<FieldHandler>;

    /// Whether the resolved configuration switches the feature on. Inactive
    /// features neither validate nor produce resources.
    fn is_active(&self, _spec: &AuroraDeploymentSpec) -> bool {
        true
    }

    /// Fetches external data. With `validation_only` no external call may be
    /// made.
    async fn create_context(
        &self,
        _spec: &AuroraDeploymentSpec,
        _cmd: &DeploymentCommand,
        _validation_only: bool,
    ) -> Result<FeatureContext, ProvisioningError> {
        Ok(FeatureContext::default())
    }

    /// Cross-field validation, every violation is returned.
    fn validate(
        &self,
        _spec: &AuroraDeploymentSpec,
        _full_validation: bool,
        _context: &FeatureContext,
    ) -> Vec<ConfigFieldError> {
        Vec::new()
    }

    fn generate(
        &self,
        _spec: &AuroraDeploymentSpec,
        _cmd: &DeploymentCommand,
        _context: &FeatureContext,
    ) -> Result<Vec<AuroraResource>> {
        Ok(Vec::new())
    }

    fn modify(
        &self,
        _spec: &AuroraDeploymentSpec,
        _cmd: &DeploymentCommand,
        _resources: &mut ResourceSet,
        _context: &FeatureContext,
    ) -> Result<()> {
        Ok(())
    }
}
