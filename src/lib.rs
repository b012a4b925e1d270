//! Surok - service discovery driven configuration agent
//!
//! Watches application declarations, resolves the services they depend on
//! through Mesos-DNS or the Marathon API, renders configuration files and
//! environment variables from templates, and reloads the application when
//! a rendered artifact changes.

pub mod agent;
pub mod config;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod store;
pub mod templating;
