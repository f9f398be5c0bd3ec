//! Interfaces to the services that own external state, such as database
//! schemas, image digests, secret vaults and certificates.
//!
//! Features only talk to these traits. Implementations must be safe to share
//! between concurrent requests.
use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use snafu::Snafu;

use crate::time::SystemClock;

pub mod database;
pub mod offline;

pub use database::{
    DatabaseEngine, DatabaseInstance, DbhSchema, SchemaForAppRequest, SchemaIdRequest,
    SchemaProvisionRequest, SchemaProvisionResult, SchemaRequestDetails, SchemaUser,
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProvisioningError {
    #[snafu(display("failed to provision database schema {schema}: {message}"))]
    SchemaProvisioning { schema: String, message: String },

    #[snafu(display("failed to look up image metadata for {image}: {message}"))]
    ImageLookup { image: String, message: String },

    #[snafu(display("vault {vault} does not exist in affiliation {affiliation}"))]
    VaultNotFound { vault: String, affiliation: String },

    #[snafu(display("failed to read vault {vault}: {message}"))]
    VaultRead { vault: String, message: String },

    #[snafu(display("failed to provision certificate with commonName={common_name}: {message}"))]
    CertificateProvisioning { common_name: String, message: String },
}

/// A container image by tag.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageRef {
    pub registry: String,
    pub group: String,
    pub name: String,
    pub tag: String,
}

impl ImageRef {
    /// `registry/group/name`
    pub fn repository(&self) -> String {
        format!("{}/{}/{}", self.registry, self.group, self.name)
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repository(), self.tag)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ImageMetadata {
    /// The immutable digest of the tag, `sha256:..`, if the registry knows it.
    pub digest: Option<String>,
}

#[async_trait]
pub trait ImageMetadataResolver: Send + Sync {
    async fn resolve(&self, image: &ImageRef) -> Result<ImageMetadata, ProvisioningError>;
}

#[async_trait]
pub trait DatabaseSchemaProvisioner: Send + Sync {
    /// Finds or creates the schema for every request. Fails on the first
    /// request that can not be fulfilled.
    async fn provision(
        &self,
        requests: &[SchemaProvisionRequest],
    ) -> Result<Vec<SchemaProvisionResult>, ProvisioningError>;
}

#[async_trait]
pub trait VaultProvider: Send + Sync {
    /// The files of a vault, keyed by file name.
    async fn vault_contents(
        &self,
        affiliation: &str,
        vault: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, ProvisioningError>;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CertificateRequest {
    pub common_name: String,
    pub application: String,
    pub environment: String,
}

/// Key material of a certificate, PEM encoded except for the keystore.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Certificate {
    pub crt: Vec<u8>,
    pub key: Vec<u8>,
    pub keystore: Vec<u8>,
    pub store_password: String,
    pub key_password: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CertificateProvisioningResult {
    pub common_name: String,
    pub certificate: Certificate,

    /// When the certificate should be replaced, in seconds since the epoch.
    pub renew_at: u64,
}

#[async_trait]
pub trait CertificateProvisioner: Send + Sync {
    async fn generate_certificate(
        &self,
        request: &CertificateRequest,
    ) -> Result<CertificateProvisioningResult, ProvisioningError>;
}

/// The external services available to the features of one engine.
#[derive(Clone)]
pub struct Provisioners {
    pub images: Arc<dyn ImageMetadataResolver>,
    pub databases: Arc<dyn DatabaseSchemaProvisioner>,
    pub vaults: Arc<dyn VaultProvider>,
    pub certificates: Arc<dyn CertificateProvisioner>,
}

impl Provisioners {
    /// Providers that never leave the process, see [`offline`].
    pub fn offline() -> Self {
        Self {
            images: Arc::new(offline::OfflineImageMetadataResolver),
            databases: Arc::new(offline::OfflineSchemaProvisioner),
            vaults: Arc::new(offline::InMemoryVaults::default()),
            certificates: Arc::new(offline::OfflineCertificateProvisioner::new(Arc::new(
                SystemClock,
            ))),
        }
    }
}

impl std::fmt::Debug for Provisioners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioners").finish_non_exhaustive()
    }
}
