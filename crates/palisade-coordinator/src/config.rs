//! Environment configuration
//!
//! The Coordinator is configured entirely through environment variables,
//! mirroring how it is deployed as a container entrypoint.

use std::env;
use std::path::PathBuf;

/// Recognized environment variables
pub mod keys {
    /// Address the marble (mesh) listener binds to
    pub const MESH_ADDR: &str = "PALISADE_MESH_ADDR";
    /// Address the client REST listener binds to
    pub const CLIENT_ADDR: &str = "PALISADE_CLIENT_ADDR";
    /// Comma-separated DNS names for the Coordinator's certificates
    pub const DNS_NAMES: &str = "PALISADE_DNS_NAMES";
    /// Directory holding the sealed state
    pub const SEAL_DIR: &str = "PALISADE_SEAL_DIR";
    /// Verbose logging; never enable in production
    pub const DEV_MODE: &str = "PALISADE_DEV_MODE";
}

const MESH_ADDR_DEFAULT: &str = "0.0.0.0:2001";
const CLIENT_ADDR_DEFAULT: &str = "0.0.0.0:4433";
const DNS_NAMES_DEFAULT: &str = "localhost";

#[derive(Debug, Clone)]
pub struct Config {
    pub mesh_addr: String,
    pub client_addr: String,
    pub dns_names: Vec<String>,
    pub seal_dir: PathBuf,
    pub dev_mode: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let mesh_addr = env::var(keys::MESH_ADDR).unwrap_or_else(|_| MESH_ADDR_DEFAULT.into());
        let client_addr =
            env::var(keys::CLIENT_ADDR).unwrap_or_else(|_| CLIENT_ADDR_DEFAULT.into());
        let dns_names = parse_dns_names(
            &env::var(keys::DNS_NAMES).unwrap_or_else(|_| DNS_NAMES_DEFAULT.into()),
        );
        let seal_dir = env::var(keys::SEAL_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| env::temp_dir().join("palisade"));
        let dev_mode = matches!(
            env::var(keys::DEV_MODE).as_deref(),
            Ok("1") | Ok("true") | Ok("on")
        );

        Self {
            mesh_addr,
            client_addr,
            dns_names,
            seal_dir,
            dev_mode,
        }
    }
}

fn parse_dns_names(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_names_split_and_trimmed() {
        assert_eq!(
            parse_dns_names("coordinator.mesh, localhost ,10.0.0.1"),
            vec!["coordinator.mesh", "localhost", "10.0.0.1"]
        );
        assert_eq!(parse_dns_names("localhost"), vec!["localhost"]);
        assert!(parse_dns_names(",").is_empty());
    }
}
