//! # capsule-core
//!
//! Core library for capsuled - the on-device capsule activation daemon.
//!
//! A capsule is a signed, self-contained filesystem image bundled with a
//! manifest. This crate holds everything about capsules that does not touch
//! the kernel: opened handles and their identity rules, the package
//! repository that tracks pre-installed and data-side copies, the policy
//! that picks which copy of each capsule to activate, the database of live
//! mounts, and the activation-manifest model published for the rest of the
//! OS.
//!
//! The daemon itself (loop devices, dm-verity, mounts, sessions) lives in
//! the `capsuled` crate.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod capsule;
pub mod database;
pub mod manifest;
pub mod repository;
pub mod selection;

pub use capsule::{CapsuleError, CapsuleHandle, CapsuleSource, Partition};
pub use database::{MountedCapsuleDatabase, MountedRecord};
pub use repository::{CapsuleRepository, RepositoryError};
pub use selection::select_for_activation;
