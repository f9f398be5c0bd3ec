//! Providers that answer from memory, for validation and local rendering.
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use sha2::{Digest as _, Sha256};
use snafu::OptionExt as _;

use super::{
    Certificate, CertificateProvisioner, CertificateProvisioningResult, CertificateRequest,
    DatabaseEngine, DatabaseSchemaProvisioner, DbhSchema, ImageMetadata, ImageMetadataResolver, ImageRef,
    ProvisioningError, SchemaProvisionRequest, SchemaProvisionResult, VaultNotFoundSnafu,
    VaultProvider,
};
use crate::time::Clock;

const CERTIFICATE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const CERTIFICATE_RENEW_BEFORE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Knows no digests, images are referenced by tag.
#[derive(Clone, Copy, Debug, Default)]
pub struct OfflineImageMetadataResolver;

#[async_trait]
impl ImageMetadataResolver for OfflineImageMetadataResolver {
    async fn resolve(&self, _image: &ImageRef) -> Result<ImageMetadata, ProvisioningError> {
        Ok(ImageMetadata::default())
    }
}

/// Answers every request with a schema derived from the request itself.
///
/// The same request always yields the same schema.
#[derive(Clone, Copy, Debug, Default)]
pub struct OfflineSchemaProvisioner;

#[async_trait]
impl DatabaseSchemaProvisioner for OfflineSchemaProvisioner {
    async fn provision(
        &self,
        requests: &[SchemaProvisionRequest],
    ) -> Result<Vec<SchemaProvisionResult>, ProvisioningError> {
        Ok(requests
            .iter()
            .map(|request| SchemaProvisionResult {
                schema: offline_schema(request),
                request: request.clone(),
            })
            .collect())
    }
}

fn offline_schema(request: &SchemaProvisionRequest) -> DbhSchema {
    let details = request.details();
    let id = match request {
        SchemaProvisionRequest::Id(request) => request.id.clone(),
        SchemaProvisionRequest::ForApp(request) => {
            let digest = Sha256::digest(format!(
                "{}/{}/{}/{}",
                details.affiliation, request.environment, request.application, details.schema_name
            ));
            // Schema ids are used as label values.
            format!("{digest:x}").chars().take(32).collect()
        }
    };

    DbhSchema {
        jdbc_url: match details.engine {
            DatabaseEngine::Oracle => format!("jdbc:oracle:thin:@oracle.offline:1521/{}", details.schema_name),
            DatabaseEngine::Postgres => format!("jdbc:postgresql://postgres.offline:5432/{}", details.schema_name),
        },
        username: details.schema_name.to_uppercase(),
        password: String::new(),
        labels: BTreeMap::from([
            ("affiliation".to_owned(), details.affiliation.clone()),
            ("name".to_owned(), details.schema_name.clone()),
        ]),
        id,
    }
}

/// Vault contents keyed by affiliation and vault name.
#[derive(Clone, Debug, Default)]
pub struct InMemoryVaults {
    vaults: BTreeMap<(String, String), BTreeMap<String, Vec<u8>>>,
}

impl InMemoryVaults {
    pub fn with_vault(
        mut self,
        affiliation: impl Into<String>,
        vault: impl Into<String>,
        files: BTreeMap<String, Vec<u8>>,
    ) -> Self {
        self.vaults.insert((affiliation.into(), vault.into()), files);
        self
    }
}

#[async_trait]
impl VaultProvider for InMemoryVaults {
    async fn vault_contents(
        &self,
        affiliation: &str,
        vault: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, ProvisioningError> {
        self.vaults
            .get(&(affiliation.to_owned(), vault.to_owned()))
            .cloned()
            .context(VaultNotFoundSnafu { vault, affiliation })
    }
}

/// Issues placeholder key material derived from the common name. The
/// certificates are only good for rendering, nothing can verify them.
#[derive(Clone)]
pub struct OfflineCertificateProvisioner {
    clock: Arc<dyn Clock>,
}

impl OfflineCertificateProvisioner {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl std::fmt::Debug for OfflineCertificateProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineCertificateProvisioner").finish_non_exhaustive()
    }
}

fn pem(label: &str, body: &str) -> Vec<u8> {
    format!("-----BEGIN {label}-----\n{body}\n-----END {label}-----\n").into_bytes()
}

#[async_trait]
impl CertificateProvisioner for OfflineCertificateProvisioner {
    async fn generate_certificate(
        &self,
        request: &CertificateRequest,
    ) -> Result<CertificateProvisioningResult, ProvisioningError> {
        let digest = |purpose: &str| format!("{:x}", Sha256::digest(format!("{purpose}/{}", request.common_name)));
        let password = digest("password").chars().take(16).collect::<String>();

        Ok(CertificateProvisioningResult {
            common_name: request.common_name.clone(),
            certificate: Certificate {
                crt: pem("CERTIFICATE", &digest("certificate")),
                key: pem("PRIVATE KEY", &digest("key")),
                keystore: digest("keystore").into_bytes(),
                store_password: password.clone(),
                key_password: password,
            },
            renew_at: self
                .clock
                .epoch_seconds_after(CERTIFICATE_TTL.saturating_sub(CERTIFICATE_RENEW_BEFORE)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        provision::{DatabaseInstance, SchemaForAppRequest, SchemaRequestDetails},
        time::FixedClock,
    };

    fn request() -> SchemaProvisionRequest {
        SchemaProvisionRequest::ForApp(SchemaForAppRequest {
            environment: "utv".to_owned(),
            application: "reference".to_owned(),
            generate: true,
            details: SchemaRequestDetails {
                schema_name: "reference".to_owned(),
                users: Vec::new(),
                engine: DatabaseEngine::Oracle,
                affiliation: "paas".to_owned(),
                database_instance: DatabaseInstance::default(),
            },
            try_reuse: false,
        })
    }

    #[tokio::test]
    async fn offline_schemas_are_stable() {
        let first = OfflineSchemaProvisioner
            .provision(&[request()])
            .await
            .expect("offline provisioning never fails");
        let second = OfflineSchemaProvisioner
            .provision(&[request()])
            .await
            .expect("offline provisioning never fails");

        assert_eq!(first, second);
        assert_eq!(first[0].schema.labels["name"], "reference");
    }

    #[tokio::test]
    async fn unknown_vaults_are_reported() {
        let vaults = InMemoryVaults::default().with_vault(
            "paas",
            "foo",
            BTreeMap::from([("latest.properties".to_owned(), b"a=b".to_vec())]),
        );

        assert_eq!(
            vaults.vault_contents("paas", "foo").await.expect("vault exists").len(),
            1
        );
        assert_eq!(
            vaults
                .vault_contents("paas", "bar")
                .await
                .expect_err("vault is unknown")
                .to_string(),
            "vault bar does not exist in affiliation paas"
        );
    }

    #[tokio::test]
    async fn offline_certificates_renew_a_week_before_expiry() {
        let provisioner = OfflineCertificateProvisioner::new(Arc::new(FixedClock::from_epoch_seconds(1_000)));
        let request = CertificateRequest {
            common_name: "no.skatteetaten.reference".to_owned(),
            application: "reference".to_owned(),
            environment: "utv".to_owned(),
        };

        let result = provisioner
            .generate_certificate(&request)
            .await
            .expect("offline provisioning never fails");
        assert_eq!(result.common_name, "no.skatteetaten.reference");
        assert_eq!(result.renew_at, 1_000 + 23 * 24 * 60 * 60);
        assert!(result.certificate.crt.starts_with(b"-----BEGIN CERTIFICATE-----\n"));
        assert_eq!(result.certificate.store_password.len(), 16);
        assert_eq!(
            provisioner.generate_certificate(&request).await.expect("offline provisioning never fails"),
            result
        );
    }
}
