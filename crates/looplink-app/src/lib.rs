//! Application side of Looplink.
//!
//! An application talks to its host over one transport and opens or
//! accepts any number of loops through it. Each loop is exposed as a
//! [`LoopConn`] byte stream.
//!
//! ```no_run
//! # async fn run() -> Result<(), looplink_app::AppError> {
//! let config = looplink_app::AppConfig::from_env("echo", "1.0.0")?;
//! let session = looplink_app::setup_stdio(config);
//! let conn = session.accept().await?;
//! # drop(conn);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod pipe;
pub mod registry;
pub mod session;

pub use bootstrap::{describe_requested, setup_stdio, write_meta, Meta, SETUP_CMD_NAME};
pub use config::{AppConfig, HOST_PK_ENV};
pub use error::AppError;
pub use pipe::LoopConn;
pub use registry::{LoopRegistry, RegistryError};
pub use session::{AppListener, AppSession};
