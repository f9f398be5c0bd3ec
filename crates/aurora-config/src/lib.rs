//! Resolution, validation and resource generation for AuroraConfig, the
//! layered JSON configuration of applications on an OpenShift/Kubernetes
//! platform.
//!
//! A request for one application flows through these steps:
//!
//! 1. [`document::AuroraConfig::files_for_application`] picks the documents,
//! 2. [`deployment::DeploymentEngine::resolve_and_validate`] resolves every
//!    field a [`feature::Feature`] declares and validates the result,
//! 3. [`deployment::DeploymentEngine::generate_resources`] lets the active
//!    features generate and modify the Kubernetes resources.
//!
//! External state is only reached through the traits in [`provision`].

pub mod assembly;
pub mod builder;
pub mod config;
pub mod crd;
pub mod deployment;
pub mod document;
pub mod feature;
pub mod features;
pub mod field;
pub mod header;
pub mod logging;
pub mod provision;
pub mod resource;
pub mod source;
pub mod spec;
pub mod time;
pub mod validation;

// External re-exports
pub use k8s_openapi;
pub use kube;
pub use schemars;
