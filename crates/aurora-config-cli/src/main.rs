use std::{io::Write as _, path::PathBuf, sync::Arc};

use aurora_config::{
    config::{self, EngineConfig},
    deployment::{self, DeploymentCommand, DeploymentEngine},
    document::{ApplicationRef, AuroraConfig, ConfigDocument},
    features::bundled_features,
    logging::{self, initialize_logging},
    provision::Provisioners,
    source,
    time::SystemClock,
};
use clap::{ArgAction, Args, Parser, Subcommand};
use snafu::{ResultExt as _, Snafu, ensure};
use tracing::{error, info};

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to initialize logging"))]
    Logging { source: logging::Error },

    #[snafu(display("failed to load the engine config"))]
    LoadEngineConfig { source: config::Error },

    #[snafu(display("failed to load the AuroraConfig"))]
    LoadAuroraConfig { source: source::Error },

    #[snafu(display("failed to select the documents of {application}"))]
    SelectDocuments {
        source: deployment::Error,
        application: ApplicationRef,
    },

    #[snafu(display("failed to resolve {application}"))]
    Resolve {
        source: deployment::Error,
        application: ApplicationRef,
    },

    #[snafu(display("failed to generate the resources of {application}"))]
    Generate {
        source: deployment::Error,
        application: ApplicationRef,
    },

    #[snafu(display("failed to render the output"))]
    Render { source: serde_yaml::Error },

    #[snafu(display("failed to write the output"))]
    Write { source: std::io::Error },

    #[snafu(display("{failed} of {total} applications have an invalid configuration"))]
    InvalidApplications { failed: usize, total: usize },
}

/// Validate, inspect and render AuroraConfig without a cluster.
#[derive(Debug, Parser)]
#[command(name = "aurora", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    options: CommonOptions,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Resolve and validate applications. Validates every application when
    /// none is given.
    Validate {
        applications: Vec<ApplicationRef>,
    },

    /// Print the resolved fields of one application and where they came from.
    Spec {
        application: ApplicationRef,

        /// Include fields that were not set in any document
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        include_defaults: bool,
    },

    /// Print the resources of one application.
    Generate {
        application: ApplicationRef,
    },
}

#[derive(Debug, Args)]
struct CommonOptions {
    /// The directory the AuroraConfig is checked out to
    #[arg(long, global = true, env = "AURORA_CONFIG_DIR", default_value = ".")]
    config_dir: PathBuf,

    /// The affiliation the AuroraConfig belongs to
    #[arg(long, global = true, env = "AURORA_AFFILIATION", default_value = "paas")]
    affiliation: String,

    /// Override a document for this run, e.g. `utv/reference.json={"replicas":2}`
    #[arg(long = "override", global = true, value_parser = parse_override)]
    overrides: Vec<ConfigDocument>,

    /// A YAML file with settings of the engine
    #[arg(long, global = true, env = "AURORA_ENGINE_CONFIG")]
    engine_config: Option<PathBuf>,
}

fn parse_override(input: &str) -> Result<ConfigDocument, String> {
    let (name, json) = input
        .split_once('=')
        .ok_or_else(|| format!("override {input:?} must be in the form <file>=<json>"))?;
    ConfigDocument::parse(name, json, true).map_err(|error| error.to_string())
}

struct Session {
    engine: DeploymentEngine,
    config: AuroraConfig,
    overrides: Vec<ConfigDocument>,
}

impl Session {
    fn load(options: CommonOptions) -> Result<Self, Error> {
        let engine_config = match &options.engine_config {
            Some(path) => EngineConfig::from_yaml_file(path).context(LoadEngineConfigSnafu)?,
            None => EngineConfig::default(),
        };
        let config = source::load_directory(&options.config_dir, &options.affiliation)
            .context(LoadAuroraConfigSnafu)?;
        let engine = DeploymentEngine::new(bundled_features(
            &engine_config,
            &Provisioners::offline(),
            Arc::new(SystemClock),
        ));

        Ok(Self {
            engine,
            config,
            overrides: options.overrides,
        })
    }

    fn command(&self, application: &ApplicationRef) -> Result<DeploymentCommand, Error> {
        DeploymentCommand::new(&self.config, application.clone(), self.overrides.clone())
            .context(SelectDocumentsSnafu { application: application.clone() })
    }

    async fn validate(&self, applications: Vec<ApplicationRef>) -> Result<(), Error> {
        let applications = if applications.is_empty() {
            self.config.application_refs()
        } else {
            applications
        };

        let mut failed: usize = 0;
        for application in &applications {
            let result = match self.command(application) {
                Ok(cmd) => self
                    .engine
                    .resolve_and_validate(cmd, true)
                    .await
                    .context(ResolveSnafu { application: application.clone() })
                    .map(|_| ()),
                Err(error) => Err(error),
            };
            match result {
                Ok(()) => info!(%application, "configuration is valid"),
                Err(error) => {
                    failed += 1;
                    error!(%application, "{}", snafu::Report::from_error(error));
                }
            }
        }

        ensure!(
            failed == 0,
            InvalidApplicationsSnafu {
                failed,
                total: applications.len()
            }
        );
        Ok(())
    }

    async fn spec(&self, application: &ApplicationRef, include_defaults: bool) -> Result<String, Error> {
        let context = self
            .engine
            .resolve_and_validate(self.command(application)?, true)
            .await
            .context(ResolveSnafu { application: application.clone() })?;
        serde_yaml::to_string(&context.spec.present(include_defaults)).context(RenderSnafu)
    }

    async fn generate(&self, application: &ApplicationRef) -> Result<String, Error> {
        let context = self
            .engine
            .resolve_and_validate(self.command(application)?, false)
            .await
            .context(ResolveSnafu { application: application.clone() })?;
        let resources = self
            .engine
            .generate_resources(&context)
            .context(GenerateSnafu { application: application.clone() })?;

        let mut output = String::new();
        for resource in &resources {
            output.push_str("---\n");
            output.push_str(&serde_yaml::to_string(&resource.manifest).context(RenderSnafu)?);
        }
        Ok(output)
    }
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    initialize_logging("AURORA_LOG", "aurora").context(LoggingSnafu)?;

    let cli = Cli::parse();
    let session = Session::load(cli.options)?;

    let output = match cli.command {
        Command::Validate { applications } => return session.validate(applications).await,
        Command::Spec {
            application,
            include_defaults,
        } => session.spec(&application, include_defaults).await?,
        Command::Generate { application } => session.generate(&application).await?,
    };
    std::io::stdout()
        .write_all(output.as_bytes())
        .context(WriteSnafu)
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory as _;

    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn overrides_are_parsed() {
        let cli = Cli::parse_from([
            "aurora",
            "spec",
            "utv/reference",
            "--include-defaults",
            "false",
            "--override",
            r#"utv/reference.json={"replicas": 2}"#,
        ]);

        assert_eq!(cli.options.overrides.len(), 1);
        assert!(cli.options.overrides[0].is_override);
        assert!(matches!(
            cli.command,
            Command::Spec { include_defaults: false, .. }
        ));
        assert!(parse_override("utv/reference.json").is_err());
    }
}
