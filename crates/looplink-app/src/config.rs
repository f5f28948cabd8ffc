use looplink_crypto::PubKey;

use crate::error::AppError;

/// Environment variable carrying the host's public key (hex).
pub const HOST_PK_ENV: &str = "LOOPLINK_HOST_PK";

/// Application identity and the host it talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub app_name: String,
    pub app_version: String,
    pub host_pk: PubKey,
}

impl AppConfig {
    pub fn new(app_name: impl Into<String>, app_version: impl Into<String>, host_pk: PubKey) -> Self {
        Self {
            app_name: app_name.into(),
            app_version: app_version.into(),
            host_pk,
        }
    }

    /// Build the config for an app launched by a host, which passes its
    /// public key through [`HOST_PK_ENV`].
    pub fn from_env(app_name: impl Into<String>, app_version: impl Into<String>) -> Result<Self, AppError> {
        let raw = std::env::var(HOST_PK_ENV)
            .map_err(|_| AppError::Config(format!("{HOST_PK_ENV} is not set")))?;
        Self::with_host_hex(app_name, app_version, &raw)
    }

    fn with_host_hex(
        app_name: impl Into<String>,
        app_version: impl Into<String>,
        raw: &str,
    ) -> Result<Self, AppError> {
        let host_pk: PubKey = raw
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("invalid {HOST_PK_ENV}: {e}")))?;
        Ok(Self::new(app_name, app_version, host_pk))
    }
}
