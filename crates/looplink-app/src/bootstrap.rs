//! Process bootstrap for applications launched by a host.
//!
//! A host first runs `<app> ll-setup` to learn the application's metadata,
//! then launches it normally with the host key in the environment and the
//! frame transport on stdin/stdout.

use std::io::Write;
use std::path::Path;

use looplink_core::{FramedTransport, PROTOCOL_VERSION};
use looplink_crypto::PubKey;
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::error::AppError;
use crate::session::AppSession;

/// Argument that asks an application to print its metadata and exit.
pub const SETUP_CMD_NAME: &str = "ll-setup";

/// Application metadata as reported to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub app_name: String,
    pub app_version: String,
    pub protocol_version: String,
    /// Known only once the host has launched the app.
    #[serde(skip)]
    pub host: PubKey,
}

impl Meta {
    /// Metadata of an app that has not been bound to a host yet.
    pub fn new(app_name: impl Into<String>, app_version: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            app_version: app_version.into(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            host: PubKey::NULL,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            host: config.host_pk,
            ..Self::new(config.app_name.as_str(), config.app_version.as_str())
        }
    }
}

/// Whether `args` is a setup invocation (`<app> ll-setup`).
///
/// The executable's file name must match `app_name`; a mismatch is a
/// configuration error.
pub fn describe_requested<S: AsRef<str>>(args: &[S], app_name: &str) -> Result<bool, AppError> {
    let [exe, cmd] = args else {
        return Ok(false);
    };
    if cmd.as_ref() != SETUP_CMD_NAME {
        return Ok(false);
    }

    let exe = exe.as_ref();
    let base = Path::new(exe)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(exe);
    if base != app_name {
        return Err(AppError::Config(format!(
            "registered name '{app_name}' does not match executable name '{base}'"
        )));
    }
    Ok(true)
}

/// Write `meta` as one line of JSON.
pub fn write_meta<W: Write>(mut out: W, meta: &Meta) -> Result<(), AppError> {
    serde_json::to_writer(&mut out, meta)
        .map_err(|e| AppError::Io(std::io::Error::other(e)))?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

/// Start a session over this process's stdin and stdout.
pub fn setup_stdio(config: AppConfig) -> AppSession<FramedTransport> {
    let transport = FramedTransport::new(tokio::io::stdin(), tokio::io::stdout());
    AppSession::setup(config, transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use looplink_crypto::StaticKeypair;

    #[test]
    fn test_describe_requested() {
        assert!(describe_requested(&["/usr/lib/apps/echo", "ll-setup"], "echo").unwrap());
        assert!(!describe_requested(&["echo"], "echo").unwrap());
        assert!(!describe_requested(&["echo", "serve"], "echo").unwrap());
        assert!(!describe_requested(&["echo", "ll-setup", "extra"], "echo").unwrap());
    }

    #[test]
    fn test_describe_requested_name_mismatch() {
        assert!(matches!(
            describe_requested(&["./chat", "ll-setup"], "echo"),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn test_meta_json_omits_host() {
        let config = AppConfig::new("echo", "1.2.0", StaticKeypair::generate().public_key());
        let meta = Meta::from_config(&config);

        let mut out = Vec::new();
        write_meta(&mut out, &meta).unwrap();
        let line = String::from_utf8(out).unwrap();
        assert!(line.ends_with('\n'));

        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["app_name"], "echo");
        assert_eq!(value["app_version"], "1.2.0");
        assert_eq!(value["protocol_version"], "0.0.1");
        assert!(value.get("host").is_none());

        let parsed: Meta = serde_json::from_str(&line).unwrap();
        assert!(parsed.host.is_null());
    }
}
