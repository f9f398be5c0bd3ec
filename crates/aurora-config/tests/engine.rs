use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use aurora_config::{
    config::EngineConfig,
    deployment::{self, DeploymentCommand, DeploymentContext, DeploymentEngine},
    document::{ApplicationRef, AuroraConfig, ConfigDocument},
    features::bundled_features,
    provision::{
        DatabaseSchemaProvisioner, ProvisioningError, Provisioners, SchemaProvisionRequest,
        SchemaProvisionResult, offline::OfflineSchemaProvisioner,
    },
    resource::Manifest,
    time::FixedClock,
    validation::ErrorType,
};
use rstest::rstest;
use serde_json::{Value, json};

/// Remembers every schema request and answers like the offline provisioner.
#[derive(Default)]
struct RecordingProvisioner {
    requests: Mutex<Vec<SchemaProvisionRequest>>,
}

impl RecordingProvisioner {
    fn requests(&self) -> Vec<SchemaProvisionRequest> {
        self.requests.lock().expect("lock is not poisoned").clone()
    }
}

#[async_trait]
impl DatabaseSchemaProvisioner for RecordingProvisioner {
    async fn provision(
        &self,
        requests: &[SchemaProvisionRequest],
    ) -> Result<Vec<SchemaProvisionResult>, ProvisioningError> {
        self.requests
            .lock()
            .expect("lock is not poisoned")
            .extend_from_slice(requests);
        OfflineSchemaProvisioner.provision(requests).await
    }
}

/// Fails every request, as a database service that is down would.
struct FailingProvisioner;

#[async_trait]
impl DatabaseSchemaProvisioner for FailingProvisioner {
    async fn provision(
        &self,
        requests: &[SchemaProvisionRequest],
    ) -> Result<Vec<SchemaProvisionResult>, ProvisioningError> {
        Err(ProvisioningError::SchemaProvisioning {
            schema: requests
                .first()
                .map(|request| request.details().schema_name.clone())
                .unwrap_or_default(),
            message: "connection refused".to_owned(),
        })
    }
}

fn engine(databases: Arc<RecordingProvisioner>) -> DeploymentEngine {
    engine_with(Provisioners {
        databases,
        ..Provisioners::offline()
    })
}

fn engine_with(provisioners: Provisioners) -> DeploymentEngine {
    DeploymentEngine::new(bundled_features(
        &EngineConfig::default(),
        &provisioners,
        Arc::new(FixedClock::from_epoch_seconds(1_700_000_000)),
    ))
}

fn aurora_config(base: Value, app: Value) -> AuroraConfig {
    AuroraConfig::new(
        "paas",
        vec![
            ConfigDocument::new(
                "about.json",
                json!({"schemaVersion": "v1", "affiliation": "paas", "cluster": "utv", "type": "deploy"}),
            ),
            ConfigDocument::new("utv/about.json", json!({"cluster": "utv2"})),
            ConfigDocument::new("reference.json", base),
            ConfigDocument::new("utv/reference.json", app),
        ],
    )
}

fn base() -> Value {
    json!({"groupId": "no.skatteetaten.aurora", "version": "1.0.0"})
}

async fn resolve(
    engine: &DeploymentEngine,
    base: Value,
    app: Value,
) -> Result<DeploymentContext, deployment::Error> {
    let cmd = DeploymentCommand::new(
        &aurora_config(base, app),
        ApplicationRef::new("utv", "reference"),
        Vec::new(),
    )
    .expect("all required files are present");
    engine.resolve_and_validate(cmd, false).await
}

fn validation_errors(result: Result<DeploymentContext, deployment::Error>) -> Vec<(ErrorType, Option<String>)> {
    match result {
        Err(deployment::Error::Validation { source }) => source
            .errors
            .into_iter()
            .map(|error| (error.error_type, error.field))
            .collect(),
        other => panic!("expected validation errors, got {other:?}"),
    }
}

#[tokio::test]
async fn env_files_take_precedence_over_global_files() {
    let context = resolve(&engine(Arc::default()), base(), json!({}))
        .await
        .expect("valid configuration");

    let cluster = context.spec.field("cluster").expect("cluster is resolved");
    assert_eq!(cluster.value, json!("utv2"));
    assert_eq!(cluster.source.name, "utv/about.json");
}

#[tokio::test]
async fn undefined_fields_fall_back_to_defaults() {
    let context = resolve(&engine(Arc::default()), base(), json!({}))
        .await
        .expect("valid configuration");

    let replicas = context.spec.field("replicas").expect("replicas has a default");
    assert_eq!(replicas.value, json!(1));
    assert_eq!(replicas.source.name, "default");
    assert!(context.spec.field("serviceAccount").is_none());
}

#[tokio::test]
async fn invalid_name_is_reported_with_its_document() {
    let result = resolve(&engine(Arc::default()), base(), json!({"name": "Test_App"})).await;

    let Err(deployment::Error::Validation { source }) = result else {
        panic!("expected validation errors");
    };
    assert_eq!(source.errors.len(), 1);
    assert_eq!(source.errors[0].field.as_deref(), Some("name"));
    assert_eq!(source.errors[0].document.as_deref(), Some("utv/reference.json"));
    assert_eq!(source.errors[0].value, Some(json!("Test_App")));
}

#[tokio::test]
async fn all_field_errors_are_reported_together() {
    let result = resolve(
        &engine(Arc::default()),
        base(),
        json!({"replicas": "many", "deployStrategy": {"type": "blue-green"}, "version": "!bad"}),
    )
    .await;

    assert_eq!(
        validation_errors(result),
        [
            (ErrorType::Illegal, Some("version".to_owned())),
            (ErrorType::Illegal, Some("deployStrategy/type".to_owned())),
            (ErrorType::Illegal, Some("replicas".to_owned())),
        ]
    );
}

#[tokio::test]
async fn unknown_fields_are_invalid() {
    let result = resolve(&engine(Arc::default()), base(), json!({"replica": 2})).await;

    assert_eq!(
        validation_errors(result),
        [(ErrorType::Invalid, Some("/replica".to_owned()))]
    );
}

#[rstest]
#[case::route_typo(json!({"route": {"foo": {"hots": "x"}}}), ErrorType::Invalid, "/route/foo/hots")]
#[case::readiness_typo(json!({"readiness": {"prot": 8080}}), ErrorType::Invalid, "/readiness/prot")]
#[case::ttl_overflow(json!({"ttl": "292300000000y"}), ErrorType::Illegal, "ttl")]
#[tokio::test]
async fn single_field_errors(#[case] app: Value, #[case] error_type: ErrorType, #[case] field: &str) {
    let result = resolve(&engine(Arc::default()), base(), app).await;

    assert_eq!(validation_errors(result), [(error_type, Some(field.to_owned()))]);
}

#[tokio::test]
async fn failing_schema_provisioning_fails_the_request() {
    let engine = engine_with(Provisioners {
        databases: Arc::new(FailingProvisioner),
        ..Provisioners::offline()
    });

    match resolve(&engine, base(), json!({"database": true})).await {
        Err(deployment::Error::Provisioning { source, feature }) => {
            assert_eq!(feature, "Database");
            assert_eq!(
                source.to_string(),
                "failed to provision database schema reference: connection refused"
            );
        }
        other => panic!("expected a provisioning error, got {other:?}"),
    }
}

#[tokio::test]
async fn base_file_database_gives_one_schema_request() {
    let provisioner = Arc::new(RecordingProvisioner::default());
    let mut base = base();
    base["database"] = json!({"REFERENCE": "auto"});

    resolve(&engine(provisioner.clone()), base, json!({}))
        .await
        .expect("valid configuration");

    let requests = provisioner.requests();
    assert_eq!(requests.len(), 1);
    let SchemaProvisionRequest::ForApp(request) = &requests[0] else {
        panic!("expected a request by application");
    };
    assert_eq!(request.details.schema_name, "reference");
}

#[rstest]
#[case(json!({"database": true}))]
#[case(json!({"database": {"reference": "auto"}}))]
#[tokio::test]
async fn simplified_and_expanded_database_are_equivalent(#[case] app: Value) {
    let simplified = Arc::new(RecordingProvisioner::default());
    resolve(&engine(simplified.clone()), base(), json!({"database": true}))
        .await
        .expect("valid configuration");

    let provisioner = Arc::new(RecordingProvisioner::default());
    resolve(&engine(provisioner.clone()), base(), app)
        .await
        .expect("valid configuration");

    assert_eq!(provisioner.requests(), simplified.requests());
}

#[tokio::test]
async fn inactive_features_contribute_nothing_but_handlers() {
    let engine = engine(Arc::default());
    let context = resolve(&engine, base(), json!({}))
        .await
        .expect("valid configuration");

    assert!(context.features.iter().all(|active| active.feature.name() != "Route"));
    assert!(context.handlers.iter().any(|handler| handler.name == "route"));
    assert!(context.handlers.iter().any(|handler| handler.name == "routeDefaults/host"));

    let resources = engine.generate_resources(&context).expect("resources assemble");
    assert!(
        resources
            .iter()
            .all(|resource| !matches!(resource.manifest, Manifest::Route(_)))
    );
}

#[tokio::test]
async fn generating_twice_gives_equal_resources() {
    let engine = engine(Arc::default());
    let context = resolve(
        &engine,
        base(),
        json!({"route": true, "database": true, "config": {"FOO": "bar"}}),
    )
    .await
    .expect("valid configuration");

    let first = engine.generate_resources(&context).expect("resources assemble");
    let second = engine.generate_resources(&context).expect("resources assemble");
    assert_eq!(first, second);

    let mut kinds: Vec<_> = first.iter().map(|resource| resource.manifest.kind()).collect();
    kinds.sort_unstable();
    assert_eq!(
        kinds,
        ["ApplicationDeployment", "Deployment", "Route", "Secret", "Service"]
    );
}

#[tokio::test]
async fn validation_only_contexts_can_not_generate() {
    let engine = engine(Arc::default());
    let cmd = DeploymentCommand::new(
        &aurora_config(base(), json!({})),
        ApplicationRef::new("utv", "reference"),
        Vec::new(),
    )
    .expect("all required files are present");
    let context = engine
        .resolve_and_validate(cmd, true)
        .await
        .expect("valid configuration");

    assert!(matches!(
        engine.generate_resources(&context),
        Err(deployment::Error::ValidationOnly)
    ));
}

#[tokio::test]
async fn logging_sidecar_and_certificate_are_added_to_the_deployment() {
    let engine = engine(Arc::default());
    let context = resolve(
        &engine,
        base(),
        json!({"logging": {"index": "paas-app"}, "certificate": true}),
    )
    .await
    .expect("valid configuration");

    let resources = engine.generate_resources(&context).expect("resources assemble");
    let names: Vec<_> = resources
        .iter()
        .filter(|resource| matches!(resource.manifest, Manifest::ConfigMap(_) | Manifest::Secret(_)))
        .map(|resource| resource.manifest.name())
        .collect();
    assert_eq!(
        names,
        ["reference-cert", "reference-fluent-parser", "reference-fluent-config", "reference-hec"]
    );

    let deployment = resources
        .iter()
        .find_map(|resource| match &resource.manifest {
            Manifest::Deployment(_) => Some(resource),
            _ => None,
        })
        .expect("a deployment");
    let position = |feature: &str| {
        deployment
            .modifications
            .iter()
            .position(|modification| modification.feature == feature)
            .expect("the feature modified the deployment")
    };
    assert!(position("Certificate") < position("Fluentbit"));
}
