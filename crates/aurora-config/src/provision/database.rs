use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DatabaseEngine {
    Postgres,
    Oracle,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseInstance {
    pub name: Option<String>,
    pub fallback: bool,
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaUser {
    pub name: String,
    pub role: String,
    pub affiliation: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaRequestDetails {
    pub schema_name: String,
    pub users: Vec<SchemaUser>,
    pub engine: DatabaseEngine,
    pub affiliation: String,
    pub database_instance: DatabaseInstance,
}

/// Look up an existing schema by its id.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaIdRequest {
    pub id: String,
    pub details: SchemaRequestDetails,

    /// Reuse a schema from a previous provisioning instead of failing when
    /// the database manager is unavailable.
    #[serde(default)]
    pub try_reuse: bool,
}

/// Find the schema labelled with environment and application, creating it if
/// `generate` is set.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaForAppRequest {
    pub environment: String,
    pub application: String,
    pub generate: bool,
    pub details: SchemaRequestDetails,

    #[serde(default)]
    pub try_reuse: bool,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum SchemaProvisionRequest {
    Id(SchemaIdRequest),
    ForApp(SchemaForAppRequest),
}

impl SchemaProvisionRequest {
    pub fn details(&self) -> &SchemaRequestDetails {
        match self {
            Self::Id(request) => &request.details,
            Self::ForApp(request) => &request.details,
        }
    }

    pub fn try_reuse(&self) -> bool {
        match self {
            Self::Id(request) => request.try_reuse,
            Self::ForApp(request) => request.try_reuse,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbhSchema {
    pub id: String,
    pub jdbc_url: String,
    pub username: String,
    pub password: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaProvisionResult {
    pub request: SchemaProvisionRequest,
    pub schema: DbhSchema,
}

impl DbhSchema {
    /// The schema as a Java properties file.
    pub fn connection_properties(&self) -> String {
        format!(
            "jdbc.url={}\njdbc.user={}\njdbc.password={}\n",
            escape_property(&self.jdbc_url),
            escape_property(&self.username),
            escape_property(&self.password),
        )
    }
}

pub(crate) fn escape_property(value: &str) -> String {
    value.replace('\\', "\\\\").replace(':', "\\:").replace('=', "\\=")
}

/// Reverses [`escape_property`].
pub(crate) fn unescape_property(value: &str) -> String {
    let mut unescaped = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => unescaped.extend(chars.next()),
            c => unescaped.push(c),
        }
    }
    unescaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_escape_separators() {
        let schema = DbhSchema {
            id: "1".to_owned(),
            jdbc_url: "jdbc:oracle:thin:@host:1521/db".to_owned(),
            username: "user".to_owned(),
            password: "a=b".to_owned(),
            labels: BTreeMap::new(),
        };

        assert_eq!(
            schema.connection_properties(),
            "jdbc.url=jdbc\\:oracle\\:thin\\:@host\\:1521/db\njdbc.user=user\njdbc.password=a\\=b\n"
        );
        assert_eq!(
            unescape_property(&escape_property("jdbc:oracle:thin:@host:1521/db?a=b\\c")),
            "jdbc:oracle:thin:@host:1521/db?a=b\\c"
        );
    }
}
