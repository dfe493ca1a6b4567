//! Free-port negotiation for the child's YAML configuration.
//!
//! Every top-level key whose name contains `port` and whose value is a string
//! of comma-separated integers is rewritten: each listed port is replaced by
//! the first port at or above it that a local TCP listener can bind. The
//! rewritten document is written next to the original as `<stem>_new.<ext>`
//! and removed again when the returned [`NegotiatedConfig`] is dropped.
//!
//! Probing releases the listener before the child binds the port, so another
//! process can still win the race. Negotiation is best-effort.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};
use tracing::{debug, info, warn};

/// Errors produced during port negotiation.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    /// The child configuration could not be read.
    #[error("failed to read child config {path}: {source}")]
    Read {
        /// Path that was read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The child configuration is not a YAML mapping.
    #[error("failed to parse child config {path}: {detail}")]
    Parse {
        /// Path that was parsed.
        path: PathBuf,
        /// Decoder error message.
        detail: String,
    },

    /// No free port exists between the requested port and 65535.
    #[error("no free port at or above {requested}")]
    Exhausted {
        /// Port the search started from.
        requested: u16,
    },

    /// The rewritten configuration could not be written.
    #[error("failed to write negotiated config {path}: {detail}")]
    Write {
        /// Destination path.
        path: PathBuf,
        /// Encoder or I/O error message.
        detail: String,
    },
}

/// Configuration key → negotiated ports, in original list order.
pub type PortMapping = BTreeMap<String, Vec<u16>>;

/// A rewritten child configuration on disk.
///
/// The file is deleted when this value is dropped, so every exit path of a
/// run (success, fatal error, or panic unwind) cleans it up.
#[derive(Debug)]
pub struct NegotiatedConfig {
    path: PathBuf,
    mapping: PortMapping,
}

impl NegotiatedConfig {
    /// Path of the rewritten configuration file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ports chosen for each rewritten key.
    pub fn mapping(&self) -> &PortMapping {
        &self.mapping
    }
}

impl Drop for NegotiatedConfig {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed negotiated config"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "failed to remove negotiated config"
            ),
        }
    }
}

/// Return `port` if it can be bound, otherwise the next bindable port above it.
///
/// Each probe binds `0.0.0.0:<port>` and releases it immediately.
///
/// # Errors
///
/// Returns [`PortError::Exhausted`] when every port up to 65535 is taken.
pub fn find_available_port(port: u16) -> Result<u16, PortError> {
    for candidate in port..=u16::MAX {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, candidate)) {
            Ok(listener) => {
                drop(listener);
                return Ok(candidate);
            }
            Err(e) => debug!(port = candidate, error = %e, "port busy"),
        }
    }
    Err(PortError::Exhausted { requested: port })
}

/// Parse a `"30303, 30304"` style list. `None` if any entry is not a port.
pub fn parse_port_list(value: &str) -> Option<Vec<u16>> {
    value
        .split(',')
        .map(|part| part.trim().parse::<u16>().ok())
        .collect()
}

/// Collect the port-bearing top-level keys of a parsed child configuration.
///
/// Keys whose value is a string that does not parse as a port list are left
/// untouched.
pub fn extract_ports(config: &Mapping) -> Vec<(String, Vec<u16>)> {
    let mut found = Vec::new();
    for (key, value) in config {
        let (Some(key), Some(list)) = (key.as_str(), value.as_str()) else {
            continue;
        };
        if !key.contains("port") {
            continue;
        }
        match parse_port_list(list) {
            Some(ports) => found.push((key.to_owned(), ports)),
            None => warn!(key, value = list, "port key is not an integer list, leaving as-is"),
        }
    }
    found
}

/// Negotiate free ports for one key's list, preserving order.
///
/// # Errors
///
/// Returns [`PortError::Exhausted`] if any entry has no free port above it.
pub fn negotiate_list(ports: &[u16]) -> Result<Vec<u16>, PortError> {
    ports.iter().map(|&port| find_available_port(port)).collect()
}

/// Path the rewritten configuration is written to: `<stem>_new<.ext>`.
pub fn negotiated_path(original: &Path) -> PathBuf {
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match original.extension() {
        Some(ext) => format!("{stem}_new.{}", ext.to_string_lossy()),
        None => format!("{stem}_new"),
    };
    original.with_file_name(name)
}

/// Read the child configuration, negotiate free ports, write the rewritten copy.
///
/// The original file is never modified.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, a port range is
/// exhausted, or the new file cannot be written.
pub fn negotiate(config_path: &Path) -> Result<NegotiatedConfig, PortError> {
    let absolute = std::path::absolute(config_path).unwrap_or_else(|_| config_path.to_path_buf());
    info!(path = %absolute.display(), "reading child config");

    let contents = std::fs::read_to_string(&absolute).map_err(|source| PortError::Read {
        path: absolute.clone(),
        source,
    })?;
    let mut document: Mapping =
        serde_yaml::from_str(&contents).map_err(|e| PortError::Parse {
            path: absolute.clone(),
            detail: e.to_string(),
        })?;

    let mut mapping = PortMapping::new();
    for (key, requested) in extract_ports(&document) {
        let negotiated = negotiate_list(&requested)?;
        let rendered = negotiated
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        info!(key = %key, from = ?requested, to = %rendered, "negotiated ports");
        document.insert(Value::String(key.clone()), Value::String(rendered));
        mapping.insert(key, negotiated);
    }

    let path = negotiated_path(&absolute);
    let rendered = serde_yaml::to_string(&document).map_err(|e| PortError::Write {
        path: path.clone(),
        detail: e.to_string(),
    })?;
    std::fs::write(&path, rendered).map_err(|e| PortError::Write {
        path: path.clone(),
        detail: e.to_string(),
    })?;

    Ok(NegotiatedConfig { path, mapping })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_port_list_trims_entries() {
        assert_eq!(parse_port_list("30303, 30304"), Some(vec![30303, 30304]));
        assert_eq!(parse_port_list("8545"), Some(vec![8545]));
        assert_eq!(parse_port_list("http://localhost:8545"), None);
        assert_eq!(parse_port_list("70000"), None);
    }

    #[test]
    fn negotiated_path_keeps_extension() {
        assert_eq!(
            negotiated_path(Path::new("/repo/hermezconfig-bali.yaml")),
            PathBuf::from("/repo/hermezconfig-bali_new.yaml")
        );
        assert_eq!(
            negotiated_path(Path::new("/repo/config")),
            PathBuf::from("/repo/config_new")
        );
    }

    #[test]
    fn extract_ports_skips_non_port_and_non_string_keys() {
        let doc: Mapping = serde_yaml::from_str(
            "datadir: /data\nhttp.port: \"8545\"\nprivate.api.ports: 9090\nportal.url: http://x\n",
        )
        .expect("yaml");
        let found = extract_ports(&doc);
        assert_eq!(found, vec![("http.port".to_owned(), vec![8545])]);
    }
}
