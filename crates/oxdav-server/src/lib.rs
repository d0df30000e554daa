//! HTTP front end for the oxdav plugin pipeline.
//!
//! [`WebDavServer`] accepts connections with hyper and hands every request to
//! a fresh pipeline built by an [`oxdav_plugins::ServerFactory`].
//! [`ServerConfig`] describes the listener and the demo data set served by
//! the `oxdav` binary.
//!
//! ```no_run
//! use oxdav_server::{ServerConfig, WebDavServer};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = ServerConfig::default();
//! let server = WebDavServer::start(&config, config.build_factory()?).await?;
//! println!("Serving at {}", server.url());
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod server;

pub use config::{ConfigError, SeedFile, ServerConfig};
pub use server::WebDavServer;
