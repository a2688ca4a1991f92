//! distri — a package store whose packages are self-contained, immutable,
//! content-addressed squashfs images, composed at runtime by a read-only
//! overlay FUSE filesystem and produced by a hermetic build sandbox.
//!
//! The crate is organized leaves-first:
//!
//! - [`squashfs`] reads and writes the on-disk image format
//! - [`pkg`] parses and orders package identifiers
//! - [`textproto`] and [`meta`] handle metadata and recipe files
//! - [`store`] resolves identifiers to images, locally or over HTTP
//! - [`fuse`] presents every installed image under a single mount point
//! - [`resolve`] computes runtime-dependency closures
//! - [`build`] runs a single hermetic package build
//! - [`batch`] schedules many builds over the recipe graph

pub mod batch;
pub mod build;
pub mod digest;
pub mod env;
pub mod error;
pub mod fuse;
pub mod meta;
pub mod pkg;
pub mod resolve;
pub mod squashfs;
pub mod store;
pub mod textproto;

pub use crate::error::Error;
pub use crate::pkg::PackageId;
pub use crate::store::Store;
