//! Database schemas, provisioned per application and mounted as Secrets.
//!
//! A database is configured either simplified, `"database": true` gives one
//! schema named after the application, or expanded, as one entry per schema
//! below `database`:
//!
//! ```json
//! {
//!   "database": {
//!     "REFERENCE": "auto",
//!     "OTHER": { "flavor": "POSTGRES_MANAGED", "generate": false }
//!   }
//! }
//! ```
//!
//! An entry is either the schema id, `auto` for a schema labelled with the
//! application, or `false` to switch it off. `databaseDefaults` holds the
//! values every entry falls back to.
use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::{ByteString, api::core::v1::Secret};
use serde_json::{Value, json};
use strum::{Display, EnumString, VariantNames};
use tracing::debug;

use super::{ensure_starts_with, object_meta, sub_key_values};
use crate::{
    builder::{
        meta::insert_label,
        pod::{VolumeBuilder, add_env, add_volume, env_var},
    },
    deployment::DeploymentCommand,
    document::ConfigDocument,
    feature::{Feature, FeatureContext, Result},
    field::{FieldHandler, Validator, discovery, validators},
    provision::{
        DatabaseEngine, DatabaseInstance, DatabaseSchemaProvisioner, ProvisioningError,
        SchemaForAppRequest, SchemaIdRequest, SchemaProvisionRequest, SchemaProvisionResult,
        SchemaRequestDetails, SchemaUser,
    },
    resource::{AuroraResource, Manifest, ResourceSet},
    spec::{self, AuroraDeploymentSpec},
};

const NAME: &str = "Database";
const DEFAULTS: &str = "databaseDefaults";
const DBH_ID_LABEL: &str = "dbhId";

/// Context key of the provisioned [`SchemaProvisionResult`]s.
pub const SCHEMAS_KEY: &str = "schemas";

#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, VariantNames)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DatabaseFlavor {
    OracleManaged,
    PostgresManaged,
}

impl DatabaseFlavor {
    pub fn engine(self) -> DatabaseEngine {
        match self {
            Self::OracleManaged => DatabaseEngine::Oracle,
            Self::PostgresManaged => DatabaseEngine::Postgres,
        }
    }

    /// Whether a shared instance may be used if the requested one is missing.
    pub fn default_fallback(self) -> bool {
        match self {
            Self::OracleManaged => true,
            Self::PostgresManaged => false,
        }
    }
}

#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, VariantNames)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DatabasePermission {
    Read,
    Write,
    All,
}

impl DatabasePermission {
    pub fn permission_string(self) -> &'static str {
        match self {
            Self::Read => "r",
            Self::Write => "rw",
            Self::All => "a",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Database {
    pub name: String,
    pub id: Option<String>,
    pub flavor: DatabaseFlavor,
    pub generate: bool,

    /// Role name by affiliation it is exposed to.
    pub expose_to: BTreeMap<String, String>,
    pub roles: BTreeMap<String, DatabasePermission>,
    pub instance: DatabaseInstance,
    pub application_label: Option<String>,
    pub try_reuse: bool,
}

impl Database {
    fn schema_details(&self, affiliation: &str) -> SchemaRequestDetails {
        let users = if self.roles.is_empty() {
            vec![SchemaUser {
                name: "SCHEMA".to_owned(),
                role: DatabasePermission::All.permission_string().to_owned(),
                affiliation: affiliation.to_owned(),
            }]
        } else {
            self.roles
                .iter()
                .map(|(role, permission)| {
                    let exposed_to = self
                        .expose_to
                        .iter()
                        .find(|(_, exposed_role)| *exposed_role == role)
                        .map(|(affiliation, _)| affiliation.as_str());
                    SchemaUser {
                        name: role.clone(),
                        role: permission.permission_string().to_owned(),
                        affiliation: exposed_to.unwrap_or(affiliation).to_owned(),
                    }
                })
                .collect()
        };

        SchemaRequestDetails {
            schema_name: self.name.to_lowercase(),
            users,
            engine: self.flavor.engine(),
            affiliation: affiliation.to_owned(),
            database_instance: self.instance.clone(),
        }
    }

    /// `<name>-db`, the directory the Secret is mounted in.
    fn mount_name(&self) -> String {
        format!("{}-db", self.name).to_lowercase()
    }
}

pub struct DatabaseFeature {
    secrets_path: String,
    provisioner: Arc<dyn DatabaseSchemaProvisioner>,
}

impl DatabaseFeature {
    pub fn new(secrets_path: String, provisioner: Arc<dyn DatabaseSchemaProvisioner>) -> Self {
        Self {
            secrets_path,
            provisioner,
        }
    }

    /// `<NAME>` and `<NAME>_PROPERTIES` pointing into the mounted Secret.
    fn db_env(&self, mount_name: &str, env_name: &str) -> [(String, String); 2] {
        let path = format!("{}/{mount_name}", self.secrets_path);
        let env_name = env_name.replace('-', "_").to_uppercase();
        [
            (format!("{env_name}_PROPERTIES"), format!("{path}/db.properties")),
            (env_name, format!("{path}/info")),
        ]
    }
}

fn permission_validator() -> Validator {
    validators::one_of(DatabasePermission::VARIANTS, true)
}

fn expose_to_validator(affiliation: String, valid_roles: Vec<String>) -> Validator {
    Arc::new(move |value| {
        let role = value.and_then(Value::as_str).unwrap_or_default();
        (!valid_roles.iter().any(|valid| valid == role)).then(|| {
            format!(
                "Database cannot expose affiliation={affiliation} with invalid role={role}. ValidRoles={}",
                valid_roles.join(",")
            )
        })
    })
}

fn instance_handlers(documents: &[ConfigDocument], key: &str) -> Vec<FieldHandler> {
    let prefix = format!("{key}/instance");
    discovery::sub_keys(documents, &prefix)
        .into_iter()
        .flat_map(|sub_key| {
            let name = format!("{prefix}/{sub_key}");
            if sub_key == "labels" {
                discovery::sub_handlers(documents, &name, |_| None)
            } else {
                vec![FieldHandler::new(name)]
            }
        })
        .collect()
}

fn roles_and_expose_to_handlers(
    documents: &[ConfigDocument],
    key: &str,
    valid_roles: Vec<String>,
) -> Vec<FieldHandler> {
    let mut handlers = discovery::sub_handlers(documents, &format!("{key}/roles"), |_| {
        Some(permission_validator())
    });
    handlers.extend(discovery::sub_handlers(
        documents,
        &format!("{key}/exposeTo"),
        |affiliation| Some(expose_to_validator(affiliation.to_owned(), valid_roles.clone())),
    ));
    handlers
}

fn database_handlers(cmd: &DeploymentCommand) -> Vec<FieldHandler> {
    let documents = &cmd.documents;
    let default_roles: Vec<_> = discovery::sub_keys(documents, &format!("{DEFAULTS}/roles"))
        .into_iter()
        .collect();

    let mut handlers = vec![
        FieldHandler::new(format!("{DEFAULTS}/flavor"))
            .with_default(DatabaseFlavor::OracleManaged.to_string())
            .with_validator(validators::one_of(DatabaseFlavor::VARIANTS, true)),
        FieldHandler::new(format!("{DEFAULTS}/generate"))
            .with_default(true)
            .with_validator(validators::boolean()),
        FieldHandler::new(format!("{DEFAULTS}/name")).with_default("@name@"),
        FieldHandler::new(format!("{DEFAULTS}/tryReuse"))
            .with_default(false)
            .with_validator(validators::boolean()),
    ];
    handlers.extend(roles_and_expose_to_handlers(documents, DEFAULTS, default_roles.clone()));
    handlers.extend(instance_handlers(documents, DEFAULTS));

    for db in discovery::sub_keys_expanded(documents, "database") {
        if discovery::sub_keys(documents, &db).is_empty() {
            handlers.push(FieldHandler::new(db));
            continue;
        }

        handlers.extend([
            FieldHandler::new(format!("{db}/enabled"))
                .with_default(true)
                .with_validator(validators::boolean()),
            FieldHandler::new(format!("{db}/generate")).with_validator(validators::boolean()),
            FieldHandler::new(format!("{db}/tryReuse")).with_validator(validators::boolean()),
            FieldHandler::new(format!("{db}/name")),
            FieldHandler::new(format!("{db}/applicationLabel")),
            FieldHandler::new(format!("{db}/id")),
            FieldHandler::new(format!("{db}/flavor"))
                .with_validator(validators::one_of(DatabaseFlavor::VARIANTS, false)),
        ]);
        let mut valid_roles = default_roles.clone();
        valid_roles.extend(discovery::sub_keys(documents, &format!("{db}/roles")));
        handlers.extend(roles_and_expose_to_handlers(documents, &db, valid_roles));
        handlers.extend(instance_handlers(documents, &db));
    }

    handlers.push(
        FieldHandler::new("database")
            .simplified()
            .with_default(false)
            .with_validator(validators::boolean()),
    );
    handlers
}

fn roles(spec: &AuroraDeploymentSpec, key: &str) -> BTreeMap<String, DatabasePermission> {
    sub_key_values(spec, &format!("{key}/roles"))
        .into_iter()
        .filter_map(|(role, permission)| Some((role, permission.parse().ok()?)))
        .collect()
}

fn find_instance(
    spec: &AuroraDeploymentSpec,
    key: &str,
    default_fallback: bool,
) -> Result<Option<DatabaseInstance>, spec::Error> {
    let key = format!("{key}/instance");
    if !spec.has_sub_keys(&key) {
        return Ok(None);
    }
    Ok(Some(DatabaseInstance {
        name: spec.extract_or_none(&format!("{key}/name")),
        fallback: spec.get_or(&format!("{key}/fallback"), default_fallback)?,
        labels: sub_key_values(spec, &format!("{key}/labels")),
    }))
}

/// An id value of `auto` or blank means the schema is looked up by labels.
fn schema_id(value: String) -> Option<String> {
    (value != "auto" && !value.trim().is_empty()).then_some(value)
}

/// The configured databases, in name order.
pub fn find_databases(spec: &AuroraDeploymentSpec) -> Result<Vec<Database>, spec::Error> {
    if spec.is_simplified_and_disabled("database") {
        return Ok(Vec::new());
    }

    let flavor: DatabaseFlavor = spec.get_enum(&format!("{DEFAULTS}/flavor"))?;
    let mut instance = find_instance(spec, DEFAULTS, flavor.default_fallback())?.unwrap_or(
        DatabaseInstance {
            fallback: flavor.default_fallback(),
            ..DatabaseInstance::default()
        },
    );
    instance.labels.insert("affiliation".to_owned(), spec.affiliation()?);

    let default_db = Database {
        name: spec.extract(&format!("{DEFAULTS}/name"))?,
        id: None,
        flavor,
        generate: spec.get(&format!("{DEFAULTS}/generate"))?,
        expose_to: sub_key_values(spec, &format!("{DEFAULTS}/exposeTo")),
        roles: roles(spec, DEFAULTS),
        instance,
        application_label: None,
        try_reuse: spec.get(&format!("{DEFAULTS}/tryReuse"))?,
    };

    if spec.is_simplified_and_enabled("database") {
        return Ok(vec![default_db]);
    }

    let mut databases = Vec::new();
    for db in spec.sub_key_names("database") {
        let key = format!("database/{db}");

        if spec.contains(&key) {
            let value = spec.extract(&key)?;
            if value == "false" {
                continue;
            }
            databases.push(Database {
                name: db,
                id: schema_id(value),
                ..default_db.clone()
            });
            continue;
        }

        if !spec.get_or(&format!("{key}/enabled"), true)? {
            continue;
        }
        let flavor = match spec.extract_or_none(&format!("{key}/flavor")) {
            Some(_) => spec.get_enum(&format!("{key}/flavor"))?,
            None => default_db.flavor,
        };
        let instance = find_instance(spec, &key, flavor.default_fallback())?;
        let mut labels = default_db.instance.labels.clone();
        labels.extend(instance.as_ref().map(|instance| instance.labels.clone()).unwrap_or_default());

        let mut roles_for_db = default_db.roles.clone();
        roles_for_db.extend(roles(spec, &key));
        let mut expose_to = default_db.expose_to.clone();
        expose_to.extend(sub_key_values(spec, &format!("{key}/exposeTo")));

        databases.push(Database {
            name: spec.extract_or_default(&format!("{key}/name"), &db),
            id: spec.extract_or_none(&format!("{key}/id")).and_then(schema_id),
            flavor,
            generate: spec.get_or(&format!("{key}/generate"), default_db.generate)?,
            expose_to,
            roles: roles_for_db,
            instance: DatabaseInstance {
                name: instance
                    .as_ref()
                    .and_then(|instance| instance.name.clone())
                    .or_else(|| default_db.instance.name.clone()),
                fallback: instance.map_or(flavor.default_fallback(), |instance| instance.fallback),
                labels,
            },
            application_label: spec.extract_or_none(&format!("{key}/applicationLabel")),
            try_reuse: spec.get_or_default("database", &db, "tryReuse")?,
        });
    }
    Ok(databases)
}

/// One request per database: by id if the id is known, by application labels
/// otherwise.
pub fn schema_requests(
    spec: &AuroraDeploymentSpec,
    databases: &[Database],
) -> Result<Vec<SchemaProvisionRequest>, spec::Error> {
    let affiliation = spec.affiliation()?;
    let environment = spec.env_name()?;
    let application = spec.name()?;

    Ok(databases
        .iter()
        .map(|database| {
            let details = database.schema_details(&affiliation);
            match &database.id {
                Some(id) => SchemaProvisionRequest::Id(SchemaIdRequest {
                    id: id.clone(),
                    details,
                    try_reuse: database.try_reuse,
                }),
                None => SchemaProvisionRequest::ForApp(SchemaForAppRequest {
                    environment: environment.clone(),
                    application: database
                        .application_label
                        .clone()
                        .unwrap_or_else(|| application.clone()),
                    generate: database.generate,
                    details,
                    try_reuse: database.try_reuse,
                }),
            }
        })
        .collect())
}

pub(super) fn secret_name(app: &str, schema_name: &str) -> String {
    ensure_starts_with(
        &format!("{schema_name}-db").replace('_', "-").to_lowercase(),
        app,
        "-",
    )
}

fn dbh_secret(spec: &AuroraDeploymentSpec, result: &SchemaProvisionResult) -> Result<Secret> {
    let schema = &result.schema;
    let name = secret_name(&spec.name()?, &result.request.details().schema_name);
    let info = json!({
        "database": {
            "id": schema.id,
            "name": schema.username,
            "jdbcUrl": schema.jdbc_url,
            "users": [{
                "username": schema.username,
                "password": schema.password,
                "type": "SCHEMA",
            }],
            "labels": schema.labels,
        }
    });

    let mut metadata = object_meta(spec, name)?;
    insert_label(&mut metadata, DBH_ID_LABEL, &schema.id);

    Ok(Secret {
        metadata,
        data: Some(
            [
                ("db.properties", schema.connection_properties()),
                ("id", schema.id.clone()),
                ("info", info.to_string()),
                ("jdbcurl", schema.jdbc_url.clone()),
                ("name", schema.username.clone()),
            ]
            .into_iter()
            .map(|(key, value)| (key.to_owned(), ByteString(value.into_bytes())))
            .collect(),
        ),
        type_: Some("Opaque".to_owned()),
        ..Secret::default()
    })
}

#[async_trait]
impl Feature for DatabaseFeature {
    fn name(&self) -> &'static str {
        NAME
    }

    fn handlers(&self, _header: &AuroraDeploymentSpec, cmd: &DeploymentCommand) -> Vec<FieldHandler> {
        database_handlers(cmd)
    }

    fn is_active(&self, spec: &AuroraDeploymentSpec) -> bool {
        find_databases(spec).is_ok_and(|databases| !databases.is_empty())
    }

    async fn create_context(
        &self,
        spec: &AuroraDeploymentSpec,
        _cmd: &DeploymentCommand,
        validation_only: bool,
    ) -> Result<FeatureContext, ProvisioningError> {
        if validation_only {
            return Ok(FeatureContext::default());
        }
        let Ok(requests) = find_databases(spec).and_then(|databases| schema_requests(spec, &databases))
        else {
            return Ok(FeatureContext::default());
        };

        let results = self.provisioner.provision(&requests).await?;
        debug!(schemas = results.len(), "provisioned database schemas");
        Ok(FeatureContext::new().with(SCHEMAS_KEY, results))
    }

    fn generate(
        &self,
        spec: &AuroraDeploymentSpec,
        _cmd: &DeploymentCommand,
        context: &FeatureContext,
    ) -> Result<Vec<AuroraResource>> {
        context
            .get::<Vec<SchemaProvisionResult>>(SCHEMAS_KEY)?
            .iter()
            .map(|result| Ok(AuroraResource::new(dbh_secret(spec, result)?, NAME)))
            .collect()
    }

    fn modify(
        &self,
        spec: &AuroraDeploymentSpec,
        _cmd: &DeploymentCommand,
        resources: &mut ResourceSet,
        _context: &FeatureContext,
    ) -> Result<()> {
        let databases = find_databases(spec)?;
        let Some(first) = databases.first() else {
            return Ok(());
        };
        let app = spec.name()?;

        let mut env: Vec<_> = databases
            .iter()
            .flat_map(|database| self.db_env(&database.mount_name(), &database.mount_name()))
            .collect();
        env.extend(self.db_env(&first.mount_name(), "db"));
        let env: Vec<_> = env
            .into_iter()
            .map(|(name, value)| env_var(name, value))
            .collect();

        let volumes: Vec<_> = databases
            .iter()
            .map(|database| {
                let mount_name = database.mount_name();
                let volume_name = ensure_starts_with(&mount_name.replace('_', "-"), &app, "-");
                let volume = VolumeBuilder::new(&volume_name)
                    .with_secret(&volume_name, false)
                    .build();
                (volume, format!("{}/{mount_name}", self.secrets_path))
            })
            .collect();

        resources.modify_pod_specs(NAME, "Added database secrets", |pod| {
            for (volume, mount_path) in &volumes {
                add_volume(pod, volume.clone(), mount_path);
            }
            add_env(pod, &env);
        });

        let database_ids: Vec<_> = resources
            .iter()
            .filter_map(|resource| match &resource.manifest {
                Manifest::Secret(secret) => secret.metadata.labels.as_ref()?.get(DBH_ID_LABEL).cloned(),
                _ => None,
            })
            .collect();
        for resource in resources.iter_mut() {
            if let Manifest::ApplicationDeployment(ad) = &mut resource.manifest {
                ad.spec.databases.clone_from(&database_ids);
                resource.record_modification(NAME, "Added databaseId");
            }
        }
        Ok(())
    }
}
