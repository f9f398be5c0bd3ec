//! Reads an AuroraConfig from a checked out directory.
//!
//! `<dir>/*.json` become global and base documents, `<dir>/<env>/*.json`
//! environment and application documents. Anything else is ignored.
use std::path::{Path, PathBuf};

use sha2::{Digest as _, Sha256};
use snafu::{ResultExt as _, Snafu};
use tracing::{debug, info};

use crate::document::{self, AuroraConfig, ConfigDocument};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to list directory {path:?}"))]
    ReadDirectory {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to read {path:?}"))]
    ReadFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse {path:?}"))]
    ParseFile {
        source: document::Error,
        path: PathBuf,
    },
}

/// Loads every document below `root` for `affiliation`. Documents are sorted
/// by name and carry a digest of their contents as version.
pub fn load_directory(root: &Path, affiliation: &str) -> Result<AuroraConfig> {
    let mut documents = Vec::new();
    for entry in list(root)? {
        if entry.is_dir() {
            let Some(environment) = entry.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if environment.starts_with('.') {
                continue;
            }
            for file in list(&entry)? {
                if let Some(document) = read_document(&file, Some(environment))? {
                    documents.push(document);
                }
            }
        } else if let Some(document) = read_document(&entry, None)? {
            documents.push(document);
        }
    }
    documents.sort_by(|a, b| a.name.cmp(&b.name));

    info!(
        directory = %root.display(),
        affiliation,
        documents = documents.len(),
        "loaded AuroraConfig"
    );
    Ok(AuroraConfig::new(affiliation, documents))
}

fn list(path: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(path).context(ReadDirectorySnafu { path })?;
    entries
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<Result<_, _>>()
        .context(ReadDirectorySnafu { path })
}

fn read_document(path: &Path, environment: Option<&str>) -> Result<Option<ConfigDocument>> {
    let Some(file_name) = path
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| name.ends_with(".json") && path.is_file())
    else {
        debug!(path = %path.display(), "skipping non document file");
        return Ok(None);
    };

    let name = match environment {
        Some(environment) => format!("{environment}/{file_name}"),
        None => file_name.to_owned(),
    };
    let text = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
    let version = format!("{:x}", Sha256::digest(&text));
    let document = ConfigDocument::parse(name, &text, false).context(ParseFileSnafu { path })?;
    Ok(Some(document.with_version(version)))
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::document::ConfigFileType;

    fn write(root: &Path, name: &str, contents: &str) {
        let path = root.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("writable directory");
        }
        std::fs::write(path, contents).expect("writable file");
    }

    #[test]
    fn loads_documents_by_folder() {
        let dir = tempfile::tempdir().expect("temporary directory");
        write(dir.path(), "about.json", r#"{"affiliation": "paas"}"#);
        write(dir.path(), "reference.json", r#"{"groupId": "no.skatteetaten"}"#);
        write(dir.path(), "utv/about.json", r#"{"cluster": "utv"}"#);
        write(
            dir.path(),
            "utv/reference.json",
            indoc! {r#"
                {
                  "version": "1",
                  "route": true
                }
            "#},
        );
        write(dir.path(), "README.md", "not a document");
        write(dir.path(), ".git/HEAD", "ref: refs/heads/master");

        let config = load_directory(dir.path(), "paas").expect("valid directory");

        let names: Vec<_> = config.documents.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["about.json", "reference.json", "utv/about.json", "utv/reference.json"]);
        assert_eq!(config.document("utv/about.json").map(|d| d.file_type), Some(ConfigFileType::Env));
        assert!(config.documents.iter().all(|d| d.version.is_some()));
        assert_eq!(config.application_refs().len(), 1);
    }

    #[test]
    fn reports_the_broken_file() {
        let dir = tempfile::tempdir().expect("temporary directory");
        write(dir.path(), "utv/reference.json", "{ not json");

        let error = load_directory(dir.path(), "paas").expect_err("invalid JSON");
        assert!(matches!(error, Error::ParseFile { ref path, .. } if path.ends_with("utv/reference.json")));
    }
}
