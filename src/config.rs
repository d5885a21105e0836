//! Runtime configuration.
//!
//! Every section has defaults, so an empty JSON object is a valid config.
//! [`Config::from_env`] layers environment overrides on top of an optional
//! JSON file named by `BRIEFLOW_CONFIG`.

use std::env;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::domain::division::DivisionPolicy;
use crate::error::Result;
use crate::notification::{DispatchConfig, MailConfig};
use crate::policy::AttachmentLimits;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Lead time and request types per division
    pub divisions: DivisionPolicy,
    pub attachments: AttachmentLimits,
    pub dispatch: DispatchConfig,
    pub mail: MailConfig,
}

impl Config {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config = serde_json::from_str(json).context("Invalid configuration JSON")?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json_str(&json)
    }

    /// Load configuration from the environment.
    ///
    /// Reads a `.env` file if present, starts from the JSON file named by
    /// `BRIEFLOW_CONFIG` (or defaults), then applies `RESEND_API_KEY`,
    /// `BRIEFLOW_MAIL_FROM`, `BRIEFLOW_MAIL_ENDPOINT` and
    /// `BRIEFLOW_MAX_UPLOAD_BYTES`.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match lookup("BRIEFLOW_CONFIG") {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(api_key) = lookup("RESEND_API_KEY") {
            config.mail.api_key = Some(api_key);
        }
        if let Some(from) = lookup("BRIEFLOW_MAIL_FROM") {
            config.mail.from = from;
        }
        if let Some(endpoint) = lookup("BRIEFLOW_MAIL_ENDPOINT") {
            url::Url::parse(&endpoint)
                .with_context(|| format!("BRIEFLOW_MAIL_ENDPOINT is not a valid URL: {}", endpoint))?;
            config.mail.endpoint = endpoint;
        }
        if let Some(max) = lookup("BRIEFLOW_MAX_UPLOAD_BYTES") {
            config.attachments.max_upload_bytes = max
                .trim()
                .parse()
                .context("BRIEFLOW_MAX_UPLOAD_BYTES must be a valid number")?;
        }

        Ok(config)
    }
}
