//! Cluster-wide state shared by the heartbeat transports.
//!
//! Implements:
//! - Heartbeat envelope (authenticated encryption)
//! - Cluster state store and membership table
//! - Local status source

mod crypt;
mod status;
mod store;

pub use crypt::{Crypt, Identity};
pub use status::{LocalStatus, StatusSource};
pub use store::{AdmissionEvent, ClusterStateEntry, ClusterStore, Membership};
