//! Named hub environments.
//!
//! Each environment pairs a short name with the websocket URL of the hub
//! endpoint. The environment is chosen once at startup, by flag or the
//! `GANGLION_ENVIRONMENT` variable.

use anyhow::{bail, Result};

/// Describes a hub endpoint (prod, dev, local).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    /// Short environment name.
    pub name: &'static str,
    /// Websocket URL of the hub endpoint.
    pub url: &'static str,
}

/// The known environments.
const ENVIRONMENTS: &[Environment] = &[
    Environment {
        name: "prod",
        url: "wss://ganglion.textualize.io/app-service/",
    },
    Environment {
        name: "dev",
        url: "wss://textualize-dev.io/app-service/",
    },
    Environment {
        name: "local",
        url: "ws://127.0.0.1:8080/app-service/",
    },
];

/// Look up an [`Environment`] by name.
///
/// # Errors
///
/// Returns an error naming the unknown environment.
pub fn get_environment(name: &str) -> Result<Environment> {
    for environment in ENVIRONMENTS {
        if environment.name == name {
            return Ok(environment.clone());
        }
    }
    bail!("invalid environment {name:?} (expected one of prod, dev, local)");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_environments_resolve() {
        assert_eq!(get_environment("local").unwrap().name, "local");
        assert!(get_environment("dev").unwrap().url.starts_with("wss://"));
    }

    #[test]
    fn test_unknown_environment_errors() {
        assert!(get_environment("staging").is_err());
    }
}
