//! Ballast engine: the registry façade and update/enforcement flows the
//! external API surface dispatches to.

#![forbid(unsafe_code)]

pub mod enforce;
pub mod objects;
pub mod registry;
pub mod update;

pub use enforce::Enforcer;
pub use objects::{
    all_types, ActionProgress, ComponentTimes, PolicyData, Revision, RevisionStatus,
};
pub use registry::Registry;
pub use update::{PolicyUpdateResult, PolicyUpdater, UpdateOpts};
