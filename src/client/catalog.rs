//! Named relay locations.
//!
//! A `servers.json` file maps a location id to a relay endpoint:
//!
//! ```json
//! {
//!   "servers": {
//!     "italy": {
//!       "country": "Italy",
//!       "host": "203.0.113.10",
//!       "port": 8888,
//!       "description": "Milan"
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::client::config::{ClientConfig, DEFAULT_RELAY_PORT};
use crate::error::{Error, Result};

/// One relay node entry.
#[derive(Clone, Serialize, Deserialize)]
pub struct Location {
    /// Human-readable country name
    #[serde(default)]
    pub country: String,
    /// Relay host; empty or the `your_<id>_server_ip` placeholder when unconfigured
    #[serde(default)]
    pub host: String,
    /// Relay port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Shared password for this relay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_RELAY_PORT
}

impl Location {
    /// Whether `host` has been filled in for location `id`.
    pub fn is_configured(&self, id: &str) -> bool {
        let placeholder = format!("your_{}_server_ip", id.to_lowercase());
        !self.host.trim().is_empty() && self.host != placeholder
    }

    /// Client configuration for this relay. An explicit `password` wins
    /// over the one stored in the catalog.
    pub fn client_config(&self, password: Option<String>) -> ClientConfig {
        ClientConfig::new(self.host.trim(), self.port)
            .with_password(password.or_else(|| self.password.clone()))
    }
}

/// Location id → relay endpoint mapping.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct LocationCatalog {
    #[serde(default)]
    servers: BTreeMap<String, Location>,
}

impl LocationCatalog {
    /// Load a catalog from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        let catalog = Self::from_json(&content)?;
        tracing::debug!(path = %path.display(), locations = catalog.len(), "loaded location catalog");
        Ok(catalog)
    }

    /// Parse a catalog from JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::config(format!("invalid location catalog: {}", e)))
    }

    /// Number of locations.
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Whether the catalog has no locations.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Iterate over `(id, location)` in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Location)> {
        self.servers.iter().map(|(id, loc)| (id.as_str(), loc))
    }

    /// Case-insensitive lookup.
    pub fn get(&self, id: &str) -> Option<&Location> {
        self.servers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(id))
            .map(|(_, loc)| loc)
    }

    /// Look up a location that is ready to connect to.
    pub fn resolve(&self, id: &str) -> Result<&Location> {
        let location = self.get(id).ok_or_else(|| {
            let known: Vec<&str> = self.servers.keys().map(String::as_str).collect();
            Error::config(format!(
                "unknown location '{}' (available: {})",
                id,
                known.join(", ")
            ))
        })?;
        if !location.is_configured(id) {
            return Err(Error::config(format!(
                "location '{}' has no relay host configured",
                id
            )));
        }
        Ok(location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "servers": {
            "israel": {
                "country": "Israel",
                "host": "your_israel_server_ip",
                "port": 8888,
                "description": "Tel Aviv"
            },
            "italy": {
                "country": "Italy",
                "host": "203.0.113.10",
                "description": "Milan",
                "password": "stored"
            },
            "empty": {
                "country": "Nowhere"
            }
        }
    }"#;

    #[test]
    fn test_parse_and_defaults() {
        let catalog = LocationCatalog::from_json(SAMPLE).unwrap();
        assert_eq!(catalog.len(), 3);
        let italy = catalog.get("italy").unwrap();
        assert_eq!(italy.port, DEFAULT_RELAY_PORT);
        assert_eq!(italy.country, "Italy");

        let ids: Vec<&str> = catalog.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["empty", "israel", "italy"]);
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let catalog = LocationCatalog::from_json(SAMPLE).unwrap();
        assert!(catalog.get("ITALY").is_some());
        assert_eq!(catalog.resolve("Italy").unwrap().host, "203.0.113.10");
    }

    #[test]
    fn test_unconfigured_locations_rejected() {
        let catalog = LocationCatalog::from_json(SAMPLE).unwrap();
        assert!(matches!(catalog.resolve("israel"), Err(Error::Config(_))));
        assert!(matches!(catalog.resolve("empty"), Err(Error::Config(_))));
        assert!(matches!(catalog.resolve("atlantis"), Err(Error::Config(_))));
    }

    #[test]
    fn test_client_config_password_precedence() {
        let catalog = LocationCatalog::from_json(SAMPLE).unwrap();
        let italy = catalog.resolve("italy").unwrap();

        let config = italy.client_config(None);
        assert_eq!(config.relay_addr(), "203.0.113.10:8888");
        assert_eq!(config.password.as_deref(), Some("stored"));

        let config = italy.client_config(Some("override".into()));
        assert_eq!(config.password.as_deref(), Some("override"));
    }

    #[test]
    fn test_missing_servers_key() {
        let catalog = LocationCatalog::from_json("{}").unwrap();
        assert!(catalog.is_empty());
        assert!(LocationCatalog::from_json("not json").is_err());
    }
}
