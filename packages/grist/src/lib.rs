//! `grist` is a programmable build engine.
//!
//! The "build file" is an ordinary program: it declares file and phony
//! rules against a [`Build`], attaches async actions that produce the
//! targets, and then hands control to the driver, which resolves the
//! requested targets into a dependency graph and executes it in parallel
//! with make-style up-to-date semantics.

pub mod driver;
pub mod graph;
pub mod log;
pub mod registry;
pub mod resource;
pub mod rule;
pub mod sync;
pub mod uri;

mod fresh;
mod sched;

pub use driver::Args;
pub use log::LogLevel;
pub use registry::{Build, FileOpts, MetaValue, PhonyOpts, RegistryError};
pub use resource::{LocalFs, Resource, ResourceError, Resources};
pub use rule::{Action, Job, JobKind, action};
pub use uri::{Uri, UriError};
