#![warn(missing_docs)]

//! Strand administrative surface.
//!
//! The configuration contract consumed by the REST layer: every mutation
//! field is validated independently with all failures aggregated into one
//! report, and the validated result is applied to the cluster service
//! graph. Status queries read membership, election and security state.

pub mod admin;
pub mod config;

pub use admin::{AdminError, ClusterAdmin, NodeStatus, NodeStatusEntry};
pub use config::{
    AuthPatch, AuthSettings, ConfigError, ElectionTrigger, FieldError, SettingsPatch,
    ValidatedSettings,
};
