//! Core domain types and shared logic for tidemark.
//!
//! This crate defines the data model used across the other crates:
//! - Upload and index lifecycle states
//! - Commit graphs and ref descriptions
//! - The nearest-upload graph builder
//! - Upload visibility tokens and package identities
//! - Configuration

pub mod commit_graph;
pub mod config;
pub mod error;
pub mod graph;
pub mod hash;
pub mod package;
pub mod upload;

pub use commit_graph::{CommitGraph, RefDescription, RefType};
pub use error::{Error, Result};
pub use graph::{CommitGraphView, Envelope, Graph, LinkRow, NearestUploadsRow, UploadMeta};
pub use hash::upload_token;
pub use package::PackageKey;
pub use upload::{IndexState, UploadState};
