use std::collections::HashMap;

use chrono::TimeDelta;
use config::{Config as ConfigLib, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::crl::CrlReason;
use crate::crypto::{CryptoResult, SignatureAlgorithm};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub crl: CrlConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrlConfig {
    /// CRL file to maintain
    pub path: String,
    /// PEM encoded RSA key of the CA
    pub ca_key: String,
    /// PEM encoded CA certificate whose subject becomes the CRL issuer
    #[serde(default)]
    pub ca_cert: Option<String>,
    /// Issuer common name used when no CA certificate is configured
    pub issuer: String,
    /// e.g. `SHA256withRSA`
    pub signing_algorithm: String,
    /// CRLReason code recorded for new entries
    pub revocation_reason: u32,
    /// Validity of a freshly initialized CRL
    pub validity_hours: i64,
    /// Write PEM rather than DER
    pub pem: bool,
}

impl CrlConfig {
    pub fn signing_algorithm(&self) -> CryptoResult<SignatureAlgorithm> {
        self.signing_algorithm.parse()
    }

    pub fn revocation_reason(&self) -> CrlReason {
        CrlReason::from(self.revocation_reason)
    }

    pub fn validity(&self) -> TimeDelta {
        TimeDelta::hours(self.validity_hours)
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_sources(None)
    }

    pub fn load_with_sources(
        env_vars: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = ConfigLib::builder()
            .set_default("crl.path", "crl/ca.crl")?
            .set_default("crl.ca_key", "config/ca.key")?
            .set_default("crl.issuer", "crl-rewriter")?
            .set_default("crl.signing_algorithm", "SHA256withRSA")?
            .set_default("crl.revocation_reason", 9)?
            .set_default("crl.validity_hours", 24)?
            .set_default("crl.pem", true)?
            .add_source(File::with_name("config/settings").required(false));

        // If env_vars is provided, we use it instead of system environment
        // This is to avoid systems variables pollution across tests
        if let Some(vars) = env_vars {
            for (key, value) in vars {
                builder = builder.set_override(&key, value)?;
            }
        } else {
            // Should be in the format APP_CRL__PATH or APP_CRL__CA_KEY
            builder = builder.add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );
        }

        builder.build()?.try_deserialize()
    }
}
