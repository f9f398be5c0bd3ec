//! Upstream addresses of proxied endpoints and databases, and the rewritten
//! URLs that point to the proxy instead.
use std::sync::LazyLock;

use regex::Regex;
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use url::Url;

const HTTP_PORT: u16 = 80;
const HTTPS_PORT: u16 = 443;
const POSTGRES_PORT: u16 = 5432;
const ORACLE_PORT: u16 = 1521;

const ORACLE_PREFIX: &str = "jdbc:oracle:thin:@";
const POSTGRES_PREFIX: &str = "jdbc:postgresql:";

static ORACLE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^jdbc:oracle:thin:@(?<protocol>[a-z]+://|//)?(?<host>[^:/?]+)(?::(?<port>[0-9]+))?(?<suffix>.*)$")
        .expect("failed to compile Oracle JDBC URL regex")
});

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse URL {url:?}"))]
    Parse { source: url::ParseError, url: String },

    #[snafu(display("the format of the URL {url:?} is not supported"))]
    Unsupported { url: String },
}

/// A URL of which host and port can be replaced.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UpstreamUrl {
    /// `scheme://host[:port]/...`, such as an HTTP endpoint.
    Plain(Url),

    /// `jdbc:postgresql://host[:port]/db`, stored without the `jdbc:` prefix.
    Postgres(Url),

    /// `jdbc:oracle:thin:@[protocol]host[:port]...`
    Oracle {
        protocol: String,
        host: String,
        port: u16,
        suffix: String,
    },
}

impl UpstreamUrl {
    pub fn parse(text: &str) -> Result<Self, Error> {
        if text.starts_with(ORACLE_PREFIX) {
            let captures = ORACLE_URL.captures(text).context(UnsupportedSnafu { url: text })?;
            let port = match captures.name("port") {
                Some(port) => port.as_str().parse().ok().context(UnsupportedSnafu { url: text })?,
                None => ORACLE_PORT,
            };
            return Ok(Self::Oracle {
                protocol: captures
                    .name("protocol")
                    .map_or_else(String::new, |protocol| protocol.as_str().to_owned()),
                host: captures["host"].to_owned(),
                port,
                suffix: captures["suffix"].to_owned(),
            });
        }

        if let Some(rest) = text.strip_prefix(POSTGRES_PREFIX) {
            // Without a host the driver connects to localhost.
            let url = match rest.strip_prefix("//") {
                Some(_) => format!("postgresql:{rest}"),
                None => format!("postgresql://localhost/{rest}"),
            };
            let url = Url::parse(&url).context(ParseSnafu { url: text })?;
            return Self::Postgres(url).require_host(text);
        }

        if text.starts_with("jdbc:") {
            return UnsupportedSnafu { url: text }.fail();
        }
        let url = Url::parse(text).context(ParseSnafu { url: text })?;
        Self::Plain(url).require_host(text)
    }

    fn require_host(self, text: &str) -> Result<Self, Error> {
        match &self {
            Self::Plain(url) | Self::Postgres(url) if url.host_str().is_none_or(str::is_empty) => {
                UnsupportedSnafu { url: text }.fail()
            }
            _ => Ok(self),
        }
    }

    pub fn host(&self) -> &str {
        match self {
            Self::Plain(url) | Self::Postgres(url) => url.host_str().unwrap_or_default(),
            Self::Oracle { host, .. } => host,
        }
    }

    /// The given port, or the default of the scheme.
    pub fn port(&self) -> u16 {
        match self {
            Self::Plain(url) => url.port().unwrap_or(match url.scheme() {
                "https" => HTTPS_PORT,
                _ => HTTP_PORT,
            }),
            Self::Postgres(url) => url.port().unwrap_or(POSTGRES_PORT),
            Self::Oracle { port, .. } => *port,
        }
    }

    /// `host:port`, as toxiproxy expects its upstream.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host(), self.port())
    }

    /// The same URL pointing to `host:port`.
    pub fn with_address(&self, host: &str, port: u16) -> String {
        match self {
            Self::Plain(url) => replace_address(url, host, port).to_string(),
            Self::Postgres(url) => format!("jdbc:{}", replace_address(url, host, port)),
            Self::Oracle {
                protocol, suffix, ..
            } => format!("{ORACLE_PREFIX}{protocol}{host}:{port}{suffix}"),
        }
    }
}

fn replace_address(url: &Url, host: &str, port: u16) -> Url {
    let mut url = url.clone();
    // Both only fail for URLs without a host, which `parse` rejects.
    let _ = url.set_host(Some(host));
    let _ = url.set_port(Some(port));
    url
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("http://service.example.com/api", "service.example.com:80")]
    #[case("https://service.example.com", "service.example.com:443")]
    #[case("https://service.example.com:8443/x?y=1", "service.example.com:8443")]
    #[case("jdbc:postgresql://pg.example.com:5433/db", "pg.example.com:5433")]
    #[case("jdbc:postgresql://pg.example.com/db", "pg.example.com:5432")]
    #[case("jdbc:postgresql:db", "localhost:5432")]
    #[case("jdbc:oracle:thin:@ora.example.com:1522/service", "ora.example.com:1522")]
    #[case("jdbc:oracle:thin:@//ora.example.com/service", "ora.example.com:1521")]
    fn upstream_addresses(#[case] url: &str, #[case] address: &str) {
        assert_eq!(UpstreamUrl::parse(url).expect("supported URL").address(), address);
    }

    #[rstest]
    #[case("https://service.example.com:8443/x?y=1", "https://localhost:18000/x?y=1")]
    #[case("jdbc:postgresql://pg.example.com/db?ssl=true", "jdbc:postgresql://localhost:18000/db?ssl=true")]
    #[case("jdbc:oracle:thin:@//ora.example.com:1521/service", "jdbc:oracle:thin:@//localhost:18000/service")]
    #[case("jdbc:oracle:thin:@ora.example.com:1521:SID", "jdbc:oracle:thin:@localhost:18000:SID")]
    fn urls_are_pointed_to_the_proxy(#[case] url: &str, #[case] expected: &str) {
        let upstream = UpstreamUrl::parse(url).expect("supported URL");
        assert_eq!(upstream.with_address("localhost", 18000), expected);
    }

    #[rstest]
    #[case("not a url")]
    #[case("jdbc:mysql://db.example.com/db")]
    #[case("mailto:someone@example.com")]
    fn unsupported_urls(#[case] url: &str) {
        assert!(UpstreamUrl::parse(url).is_err());
    }
}
