//! Fence library — policy-driven command sandboxing.
//!
//! This crate provides the building blocks for running untrusted shell
//! commands inside a confinement that restricts network egress, filesystem
//! access, command invocations, and SSH usage.
//!
//! # Modules
//!
//! - [`config`] — Declarative policy model, template inheritance, validation.
//! - [`paths`] — Path normalization, glob expansion, dangerous-file catalog.
//! - [`analyzer`] — Shell-command preflight against command deny rules.
//! - [`hosts`] — Wildcard host pattern matching.
//! - [`proxy`] — Filtering HTTP CONNECT and SOCKS5 proxies plus SSH inspection.
//! - [`manager`] — Proxy/bridge lifecycle and command wrapping.
//! - [`sandbox`] — Platform confinement builders (bubblewrap, Seatbelt).
//!
//! # Example
//!
//! ```no_run
//! use fence::config::Config;
//! use fence::manager::{ManagerOptions, SandboxManager};
//!
//! let config = Config::default();
//! let mut manager = SandboxManager::initialize(config, ManagerOptions::default()).unwrap();
//! let wrapped = manager.wrap_command("curl https://example.com").unwrap();
//! // caller executes `wrapped` via a shell, then:
//! manager.cleanup();
//! ```

pub mod analyzer;
pub mod cli;
pub mod config;
pub mod errors;
pub mod hosts;
pub mod manager;
pub mod paths;
pub mod proxy;
pub mod sandbox;
pub mod tracing_init;
