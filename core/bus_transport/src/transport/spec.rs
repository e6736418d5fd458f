//! Listen spec parsing and normalization
//!
//! Specs look like `unix:path=/run/bus.sock` or `unix:abstract=bus`, with
//! further comma-separated `key=value` arguments allowed after the prefix.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use super::{TransportError, TRANSPORT_NAME};

/// Argument key under which the resolved bind address is recorded
pub const SPEC_KEY: &str = "_spec";

const PATH_KEY: &str = "path";
const ABSTRACT_KEY: &str = "abstract";

/// Where a listening socket gets bound
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAddress {
    /// Filesystem socket
    Path(PathBuf),
    /// Abstract-namespace socket (name without the leading marker)
    Abstract(String),
}

impl fmt::Display for BindAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindAddress::Path(path) => write!(f, "{}", path.display()),
            BindAddress::Abstract(name) => write!(f, "@{}", name),
        }
    }
}

/// A normalized listen spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenSpec {
    canonical: String,
    args: BTreeMap<String, String>,
    bind: BindAddress,
}

impl ListenSpec {
    /// Canonical form, `unix:path=<path>` or `unix:abstract=<name>`
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// All parsed arguments, including the reserved `_spec` entry
    pub fn args(&self) -> &BTreeMap<String, String> {
        &self.args
    }

    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }

    pub fn bind_address(&self) -> &BindAddress {
        &self.bind
    }
}

impl fmt::Display for ListenSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// Split `<transport>:k1=v1,k2=v2` into an argument map.
pub fn parse_arguments(
    transport: &str,
    spec: &str,
) -> Result<BTreeMap<String, String>, TransportError> {
    let rest = spec
        .trim()
        .strip_prefix(transport)
        .and_then(|s| s.strip_prefix(':'))
        .ok_or_else(|| {
            TransportError::BadTransportArgs(format!(
                "spec \"{}\" is not a {} spec",
                spec, transport
            ))
        })?;

    let mut args = BTreeMap::new();
    for pair in rest.split(',').filter(|p| !p.trim().is_empty()) {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            TransportError::BadTransportArgs(format!("argument \"{}\" is not key=value", pair))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(TransportError::BadTransportArgs(format!(
                "argument \"{}\" has an empty key",
                pair
            )));
        }
        args.insert(key.to_string(), value.to_string());
    }

    Ok(args)
}

/// Normalize a textual listen spec.
///
/// Exactly one of `path` / `abstract` must be non-empty after trimming.
pub fn normalize(spec: &str) -> Result<ListenSpec, TransportError> {
    let mut args = parse_arguments(TRANSPORT_NAME, spec)?;

    let path = args.get(PATH_KEY).map(|v| v.trim().to_string()).unwrap_or_default();
    let name = args.get(ABSTRACT_KEY).map(|v| v.trim().to_string()).unwrap_or_default();

    let (canonical, bind) = match (path.is_empty(), name.is_empty()) {
        (false, true) => {
            args.insert(PATH_KEY.to_string(), path.clone());
            (
                format!("{}:{}={}", TRANSPORT_NAME, PATH_KEY, path),
                BindAddress::Path(PathBuf::from(path)),
            )
        }
        (true, false) => {
            args.insert(ABSTRACT_KEY.to_string(), name.clone());
            (
                format!("{}:{}={}", TRANSPORT_NAME, ABSTRACT_KEY, name),
                BindAddress::Abstract(name),
            )
        }
        (false, false) => {
            return Err(TransportError::BadTransportArgs(format!(
                "spec \"{}\" sets both path and abstract",
                spec
            )))
        }
        (true, true) => {
            return Err(TransportError::BadTransportArgs(format!(
                "spec \"{}\" needs a path or abstract name",
                spec
            )))
        }
    };

    args.insert(SPEC_KEY.to_string(), bind.to_string());

    Ok(ListenSpec {
        canonical,
        args,
        bind,
    })
}
