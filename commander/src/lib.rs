//! Read-only diagnostics for Helm v3 releases stored in a Kubernetes cluster.
//!
//! Release payloads are read straight from the cluster's Secrets/ConfigMaps
//! (no helm binary involved), decoded, and fed to the analysis layers:
//! the release store, the owner detector, the drift engine, the local repo
//! resolver and the doctor.

pub mod constants;
pub mod doctor;
pub mod drift;
pub mod error;
pub mod kube;
pub mod owner;
pub mod release;
pub mod repo;
