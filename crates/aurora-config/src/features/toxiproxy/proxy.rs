//! Proxies below `toxiproxy/proxies`, for outgoing calls to endpoints, to
//! servers and to databases.
use itertools::Itertools as _;

use super::upstream::UpstreamUrl;
use crate::{
    deployment::DeploymentCommand,
    field::{FieldHandler, discovery, validators},
    spec::{self, AuroraDeploymentSpec},
    validation::ConfigFieldError,
};

pub const PROXIES: &str = "toxiproxy/proxies";

/// The proxy for incoming calls, see [`ProxyConfig`](super::ProxyConfig).
pub const MAIN_PROXY_NAME: &str = "app";

/// The port of the first configured proxy, the following ones count up.
pub const FIRST_PROXY_PORT: u16 = 18000;

const VALID_COMBINATIONS: &str = "A valid configuration must contain a value for exactly one of the properties urlVariableKey, database, or databaseName, or both the properties serverVariableKey and portVariableKey.";

/// A proxy as configured, before the combination of its fields is checked.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProxySpec {
    pub name: String,
    pub enabled: bool,
    pub initial_enabled_state: bool,
    pub url_variable: Option<String>,
    pub server_variable: Option<String>,
    pub port_variable: Option<String>,
    pub database: bool,
    pub database_name: Option<String>,
}

/// What a proxy forwards to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProxyTarget {
    /// The URL in the config variable.
    Endpoint { url_variable: String },

    /// The server and port in two config variables.
    ServerAndPort {
        server_variable: Option<String>,
        port_variable: Option<String>,
    },

    /// A provisioned database, [`None`] for the database of a simplified
    /// `database` config.
    Database { name: Option<String> },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Proxy {
    pub name: String,
    pub initial_enabled_state: bool,
    pub target: ProxyTarget,
}

fn given(value: Option<&String>) -> bool {
    value.is_some_and(|value| !value.trim().is_empty())
}

impl ProxySpec {
    fn server_or_port_given(&self) -> bool {
        given(self.server_variable.as_ref()) || given(self.port_variable.as_ref())
    }

    fn given_values(&self) -> usize {
        [
            given(self.url_variable.as_ref()),
            self.server_or_port_given(),
            self.database,
            given(self.database_name.as_ref()),
        ]
        .into_iter()
        .filter(|given| *given)
        .count()
    }

    fn invalid_combination(&self) -> Option<String> {
        let message = match self.given_values() {
            0 => format!(
                "Neither of the fields urlVariableKey, serverVariableKey, portVariableKey, database or databaseName are set for the Toxiproxy proxy named {}.",
                self.name
            ),
            1 => return None,
            _ => format!(
                "The combination of fields specified for the Toxiproxy proxy named {} is not valid.",
                self.name
            ),
        };
        Some(format!("{message} {VALID_COMBINATIONS}"))
    }

    /// The proxy, if it is enabled and the combination of its fields is
    /// valid.
    pub fn to_proxy(&self) -> Option<Proxy> {
        if !self.enabled || self.given_values() != 1 {
            return None;
        }
        let target = match &self.url_variable {
            Some(url_variable) if given(Some(url_variable)) => ProxyTarget::Endpoint {
                url_variable: url_variable.clone(),
            },
            _ if self.server_or_port_given() => ProxyTarget::ServerAndPort {
                server_variable: self.server_variable.clone(),
                port_variable: self.port_variable.clone(),
            },
            _ if self.database => ProxyTarget::Database { name: None },
            _ => ProxyTarget::Database {
                name: self.database_name.clone(),
            },
        };
        Some(Proxy {
            name: self.name.clone(),
            initial_enabled_state: self.initial_enabled_state,
            target,
        })
    }
}

pub fn proxy_handlers(cmd: &DeploymentCommand) -> Vec<FieldHandler> {
    let mut handlers: Vec<_> = discovery::sub_keys_expanded(&cmd.documents, PROXIES)
        .into_iter()
        .flat_map(|proxy| {
            [
                FieldHandler::new(proxy.clone()),
                FieldHandler::new(format!("{proxy}/enabled"))
                    .with_default(true)
                    .with_validator(validators::boolean()),
                FieldHandler::new(format!("{proxy}/initialEnabledState"))
                    .with_default(true)
                    .with_validator(validators::boolean()),
                FieldHandler::new(format!("{proxy}/urlVariable")),
                FieldHandler::new(format!("{proxy}/serverVariable")),
                FieldHandler::new(format!("{proxy}/portVariable")),
                FieldHandler::new(format!("{proxy}/databaseName")),
                FieldHandler::new(format!("{proxy}/database"))
                    .with_default(false)
                    .with_validator(validators::boolean()),
            ]
        })
        .collect();
    handlers.push(FieldHandler::new(PROXIES));
    handlers
}

/// All configured proxies in name order, enabled or not.
pub fn proxy_specs(spec: &AuroraDeploymentSpec) -> Result<Vec<ProxySpec>, spec::Error> {
    spec.sub_key_names(PROXIES)
        .into_iter()
        .map(|name| {
            let field = |suffix: &str| format!("{PROXIES}/{name}/{suffix}");
            Ok(ProxySpec {
                enabled: spec.get_or(&field("enabled"), true)?,
                initial_enabled_state: spec.get_or(&field("initialEnabledState"), true)?,
                url_variable: spec.extract_or_none(&field("urlVariable")),
                server_variable: spec.extract_or_none(&field("serverVariable")),
                port_variable: spec.extract_or_none(&field("portVariable")),
                database: spec.get_or(&field("database"), false)?,
                database_name: spec.extract_or_none(&field("databaseName")),
                name,
            })
        })
        .collect()
}

/// The enabled proxies with a valid combination of fields.
pub fn enabled_proxies(spec: &AuroraDeploymentSpec) -> Result<Vec<Proxy>, spec::Error> {
    Ok(proxy_specs(spec)?.iter().filter_map(ProxySpec::to_proxy).collect())
}

pub(super) fn config_variable(spec: &AuroraDeploymentSpec, variable: &str) -> Option<String> {
    spec.extract_or_none(&format!("config/{variable}"))
}

fn endpoint_errors(spec: &AuroraDeploymentSpec, url_variable: &str) -> Option<String> {
    let Some(url) = config_variable(spec, url_variable) else {
        return Some(format!(
            "Found Toxiproxy config for endpoint named {url_variable}, but there is no such environment variable."
        ));
    };
    UpstreamUrl::parse(&url).is_err().then(|| {
        format!("The format of the URL \"{url}\" given by the config variable {url_variable} is not supported.")
    })
}

fn server_and_port_errors(
    spec: &AuroraDeploymentSpec,
    proxy: &str,
    server_variable: Option<&String>,
    port_variable: Option<&String>,
) -> Vec<String> {
    [("server", server_variable), ("port", port_variable)]
        .into_iter()
        .filter_map(|(kind, variable)| match variable.filter(|variable| given(Some(variable))) {
            None => Some(format!("The {kind} variable is missing for the Toxiproxy proxy named {proxy}.")),
            Some(variable) if config_variable(spec, variable).is_none() => Some(format!(
                "Found Toxiproxy config for a {kind} variable named {variable}, but there is no such environment variable."
            )),
            Some(_) => None,
        })
        .collect()
}

fn database_errors(spec: &AuroraDeploymentSpec, proxies: &[Proxy]) -> Vec<String> {
    let database_names: Vec<_> = proxies
        .iter()
        .filter_map(|proxy| match &proxy.target {
            ProxyTarget::Database { name } => Some(name.as_deref()),
            _ => None,
        })
        .collect();
    let named: Vec<_> = database_names.iter().flatten().copied().collect();
    let defaults = database_names.iter().filter(|name| name.is_none()).count();
    let mut errors = Vec::new();

    if spec.is_simplified_and_enabled("database") {
        if !named.is_empty() {
            errors.push(
                "Found named database(s) in the Toxiproxy config, although the database config is simplified. Did you mean to use the property \"database\" instead of \"databaseName\"?"
                    .to_owned(),
            );
        }
    } else {
        let configured = spec.sub_key_names("database");
        errors.extend(named.iter().filter(|name| !configured.contains(**name)).map(|name| {
            format!("Found Toxiproxy config for database named {name}, but there is no such database configured.")
        }));
    }

    if defaults > 1 {
        errors.push("The \"database\" property may only be used once in the Toxiproxy config.".to_owned());
    }
    if defaults > 0 && !spec.is_simplified_config("database") {
        errors.push(
            "It is not possible to set up a Toxiproxy proxy with the \"database\" property when the database config is not simplified. Did you mean to use \"databaseName\"?"
                .to_owned(),
        );
    }
    if defaults > 0 && spec.is_simplified_and_disabled("database") {
        errors.push("It is not possible to set up a Toxiproxy proxy for a disabled database.".to_owned());
    }
    errors
}

fn duplicate_errors(proxies: &[Proxy]) -> Vec<String> {
    let mut errors = Vec::new();
    let targets = || proxies.iter().map(|proxy| &proxy.target);

    errors.extend(
        targets()
            .filter_map(|target| match target {
                ProxyTarget::Endpoint { url_variable } => Some(url_variable),
                _ => None,
            })
            .duplicates()
            .map(|variable| format!("The url variable \"{variable}\" is referred to by several proxies.")),
    );
    errors.extend(
        targets()
            .filter_map(|target| match target {
                ProxyTarget::ServerAndPort {
                    server_variable,
                    port_variable,
                } => Some((server_variable, port_variable)),
                _ => None,
            })
            .duplicates()
            .map(|(server, port)| {
                format!(
                    "The server and port variables \"{}\" and \"{}\" are referred to by several proxies.",
                    server.as_deref().unwrap_or_default(),
                    port.as_deref().unwrap_or_default()
                )
            }),
    );
    errors.extend(
        targets()
            .filter_map(|target| match target {
                ProxyTarget::Database { name: Some(name) } => Some(name),
                _ => None,
            })
            .duplicates()
            .map(|name| format!("The database name \"{name}\" is referred to by several proxies.")),
    );
    errors
}

/// Every problem of the proxy config, as generic errors.
pub fn validate_proxies(spec: &AuroraDeploymentSpec) -> Vec<ConfigFieldError> {
    let specs = match proxy_specs(spec) {
        Ok(specs) => specs,
        Err(error) => return vec![ConfigFieldError::generic(error.to_string())],
    };
    let proxies: Vec<_> = specs.iter().filter_map(ProxySpec::to_proxy).collect();

    let mut errors: Vec<_> = specs
        .iter()
        .filter(|proxy_spec| proxy_spec.enabled)
        .filter_map(ProxySpec::invalid_combination)
        .collect();

    for proxy in &proxies {
        match &proxy.target {
            ProxyTarget::Endpoint { url_variable } => {
                errors.extend(endpoint_errors(spec, url_variable));
            }
            ProxyTarget::ServerAndPort {
                server_variable,
                port_variable,
            } => errors.extend(server_and_port_errors(
                spec,
                &proxy.name,
                server_variable.as_ref(),
                port_variable.as_ref(),
            )),
            ProxyTarget::Database { .. } => {}
        }
    }
    errors.extend(database_errors(spec, &proxies));

    if proxies.iter().any(|proxy| proxy.name == MAIN_PROXY_NAME) {
        errors.push(format!(
            "The name \"{MAIN_PROXY_NAME}\" is reserved for the proxy for incoming calls."
        ));
    }
    errors.extend(duplicate_errors(&proxies));

    errors
        .into_iter()
        .map(|message| ConfigFieldError::generic(message).with_field(PROXIES))
        .collect()
}
