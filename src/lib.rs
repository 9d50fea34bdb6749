//! Distributed domain decomposition and halo exchange for particle simulations.
//!
//! Particles are ordered along a space filling curve, a cornerstone octree
//! is balanced over the particles of all ranks, and contiguous ranges of its
//! leaves are assigned to the ranks. Every rank then builds a focused tree
//! around its own range to find the halo particles it needs from its peers.
//! The entry point is [Domain].
#![cfg_attr(feature = "strict", deny(warnings), deny(unused_crate_dependencies))]
#![warn(missing_docs)]

pub mod assignment;
pub mod backend;
pub mod comm;
pub mod config;
pub mod constants;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod focus;
pub mod geometry;
pub mod halos;
pub mod hilbert;
pub mod morton;
pub mod octree;
pub mod particles;
pub mod sfc;
pub mod sort;
pub mod tools;

pub use assignment::SpaceCurveAssignment;
pub use backend::{Backend, BackendKind, HostBackend, ThreadPoolBackend};
pub use comm::local::{LocalCluster, LocalComm};
pub use comm::Communicator;
pub use config::{DomainConfig, HaloRadius};
pub use domain::{Domain, SyncReport, SyncStage};
pub use error::{CommError, DomainError, ImbalanceError, Result};
pub use focus::FocusedOctree;
pub use geometry::{BoundaryKind, DomainBox};
pub use halos::{HaloPlan, SendList};
pub use octree::Octree;
pub use particles::ParticleSet;
pub use sfc::{CurveKind, SfcKey};
