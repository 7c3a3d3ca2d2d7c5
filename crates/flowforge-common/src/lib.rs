//! Shared domain types for the FlowForge plugin platform.
//!
//! A ForgeHook is a container image plus a [`Manifest`] describing how to run
//! it. The manifest model is pure data and validation; everything that acts
//! on a manifest lives in the `flowforge` crate.

pub mod manifest;

pub use manifest::{
    Dependency, DependencyKind, Endpoint, EnvVarDecl, HealthCheckPolicy, HttpMethod, ImageRef,
    LifecycleHooks, Manifest, ManifestError, RateLimit, ResourceHints,
};
