//! Data source parsing
//!
//! Supports formats:
//! * `np:\\host\pipe\name` (explicit pipe, protocol prefix optional)
//! * `host` (default pipe `sql\query`)
//! * `host\instance` (named instance pipe `MSSQL$instance\sql\query`)
//!
//! `.` and `(local)` name the local machine.

use super::handle::{PipeConfig, PipeConfigBuilder};
use super::pipe::{PipePath, DEFAULT_PIPE_NAME};
use crate::{Error, Result};

const PROTOCOL_PREFIX: &str = "np:";
const INSTANCE_PIPE_PREFIX: &str = "MSSQL$";

/// Parsed data source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSource {
    /// Server host
    pub server: String,
    /// Pipe name below `\pipe\`
    pub pipe_name: String,
    /// Named instance, if the pipe belongs to one
    pub instance: Option<String>,
}

impl DataSource {
    /// Parse a data source string
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let rest = match s.get(..PROTOCOL_PREFIX.len()) {
            Some(prefix) if prefix.eq_ignore_ascii_case(PROTOCOL_PREFIX) => {
                &s[PROTOCOL_PREFIX.len()..]
            }
            _ => s,
        };

        if rest.is_empty() {
            return Err(Error::Config("data source is empty".into()));
        }

        if let Some(unc) = rest.strip_prefix(r"\\") {
            return Self::parse_unc(unc);
        }

        Self::parse_server(rest)
    }

    fn parse_unc(unc: &str) -> Result<Self> {
        // Format: host\pipe\name[\more]
        let mut segments = unc.splitn(3, '\\');
        let host = segments.next().unwrap_or_default();
        let pipe = segments.next().unwrap_or_default();
        let name = segments.next().unwrap_or_default();

        if host.is_empty() {
            return Err(Error::Config(format!(
                r"pipe path '\\{}' has no server name",
                unc
            )));
        }
        if !pipe.eq_ignore_ascii_case("pipe") {
            return Err(Error::Config(format!(
                r"pipe path '\\{}' must have the form \\server\pipe\name",
                unc
            )));
        }
        if name.is_empty() || name.ends_with('\\') {
            return Err(Error::Config(format!(
                r"pipe path '\\{}' has no pipe name",
                unc
            )));
        }

        Ok(Self {
            server: host.to_string(),
            pipe_name: name.to_string(),
            instance: instance_from_pipe_name(name),
        })
    }

    fn parse_server(rest: &str) -> Result<Self> {
        // Format: host[\instance]
        if let Some(pos) = rest.find(':') {
            return Err(Error::Config(format!(
                "unsupported protocol '{}' for a named pipe data source",
                &rest[..=pos]
            )));
        }
        if rest.contains(',') {
            return Err(Error::Config(
                "a port cannot be specified for a named pipe data source".into(),
            ));
        }

        let (host, instance) = match rest.split_once('\\') {
            Some((host, instance)) => (host, Some(instance)),
            None => (rest, None),
        };

        if host.is_empty() {
            return Err(Error::Config(format!(
                "data source '{}' has no server name",
                rest
            )));
        }

        match instance {
            None => Ok(Self {
                server: host.to_string(),
                pipe_name: DEFAULT_PIPE_NAME.to_string(),
                instance: None,
            }),
            Some(instance) if instance.is_empty() || instance.contains('\\') => Err(
                Error::Config(format!("invalid instance name in '{}'", rest)),
            ),
            Some(instance) => Ok(Self {
                server: host.to_string(),
                pipe_name: format!(r"{}{}\{}", INSTANCE_PIPE_PREFIX, instance, DEFAULT_PIPE_NAME),
                instance: Some(instance.to_string()),
            }),
        }
    }

    /// Pipe endpoint this data source names
    pub fn pipe_path(&self) -> PipePath {
        PipePath::new(&self.server, &self.pipe_name)
    }

    /// Start a configuration for this data source
    pub fn to_config(&self) -> PipeConfigBuilder {
        PipeConfig::builder(&self.server).pipe_name(&self.pipe_name)
    }
}

impl std::str::FromStr for DataSource {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Instance name encoded in an `MSSQL$instance\...` pipe name
fn instance_from_pipe_name(name: &str) -> Option<String> {
    let prefix = name.get(..INSTANCE_PIPE_PREFIX.len())?;
    if !prefix.eq_ignore_ascii_case(INSTANCE_PIPE_PREFIX) {
        return None;
    }
    let instance = name[INSTANCE_PIPE_PREFIX.len()..].split('\\').next()?;
    (!instance.is_empty()).then(|| instance.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_explicit_pipe() {
        let ds = DataSource::parse(r"np:\\db01\pipe\sql\query").unwrap();
        assert_eq!(ds.server, "db01");
        assert_eq!(ds.pipe_name, r"sql\query");
        assert_eq!(ds.instance, None);
        assert_eq!(ds.pipe_path().unc(), r"\\db01\pipe\sql\query");
    }

    #[test]
    fn test_parse_without_prefix() {
        let ds = DataSource::parse(r"\\.\pipe\custom").unwrap();
        assert_eq!(ds.server, ".");
        assert_eq!(ds.pipe_name, "custom");
    }

    #[test]
    fn test_prefix_is_case_insensitive() {
        let ds = DataSource::parse(r"NP:\\db01\PIPE\sql\query").unwrap();
        assert_eq!(ds.server, "db01");
    }

    #[test]
    fn test_parse_instance_pipe() {
        let ds = DataSource::parse(r"np:\\db01\pipe\MSSQL$SQLEXPRESS\sql\query").unwrap();
        assert_eq!(ds.instance.as_deref(), Some("SQLEXPRESS"));
    }

    #[test]
    fn test_parse_bare_server() {
        let ds = DataSource::parse("db01").unwrap();
        assert_eq!(ds.server, "db01");
        assert_eq!(ds.pipe_name, DEFAULT_PIPE_NAME);
    }

    #[test]
    fn test_parse_server_with_instance() {
        let ds = DataSource::parse(r"(local)\SQLEXPRESS").unwrap();
        assert_eq!(ds.server, "(local)");
        assert_eq!(ds.pipe_name, r"MSSQL$SQLEXPRESS\sql\query");
        assert_eq!(ds.instance.as_deref(), Some("SQLEXPRESS"));
    }

    #[test]
    fn test_reject_missing_pipe_segment() {
        assert!(DataSource::parse(r"\\db01\share\sql\query").is_err());
        assert!(DataSource::parse(r"\\db01\pipe").is_err());
        assert!(DataSource::parse(r"\\db01\pipe\").is_err());
        assert!(DataSource::parse(r"\\\pipe\sql\query").is_err());
    }

    #[test]
    fn test_reject_other_protocols_and_ports() {
        assert!(DataSource::parse("tcp:db01,1433").is_err());
        assert!(DataSource::parse("db01,1433").is_err());
    }

    #[test]
    fn test_reject_empty() {
        assert!(DataSource::parse("").is_err());
        assert!(DataSource::parse("np:").is_err());
        assert!(DataSource::parse(r"db01\").is_err());
    }

    #[test]
    fn test_to_config() {
        let config = DataSource::parse(r"db01\INST").unwrap().to_config().build();
        assert_eq!(config.server_name, "db01");
        assert_eq!(config.pipe_name, r"MSSQL$INST\sql\query");
    }

    #[test]
    fn test_from_str() {
        let ds: DataSource = "db01".parse().unwrap();
        assert_eq!(ds.server, "db01");
    }
}
