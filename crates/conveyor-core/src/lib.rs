//! Core domain types and traits for the Conveyor delivery pipeline.
//!
//! This crate contains:
//! - Resource identifiers and the shared error type
//! - Stack definitions, rendered templates and deferred output references
//! - The stack dependency graph (deploy ordering)
//! - Pipeline stages, execution plans, triggers and run events
//! - Build specifications and image tags
//! - Collaborator traits: executors, registries, template providers,
//!   deploy targets, source providers, artifact and secret stores

pub mod artifact;
pub mod build;
pub mod deployer;
pub mod error;
pub mod executor;
pub mod graph;
pub mod id;
pub mod pipeline;
pub mod registry;
pub mod secret;
pub mod source;
pub mod stack;
pub mod template;

pub use error::{Error, Result};
pub use id::ResourceId;
