//! MaroonedPods admission decisions
//!
//! Decides what happens to a pod at admission time: marooned pods are
//! patched with the scheduling gate, the finalizer and a toleration plus
//! node selector pinning them to their future node, and only the
//! controller's service account may lift the gate afterwards.
//!
//! HTTP serving and TLS are left to whatever hosts the webhook; this crate
//! maps an `AdmissionReview` request to its response.

pub mod decision;
pub mod error;
pub mod review;

pub use decision::{
    AdmissionSettings, Decision, PatchOperation, decide_create, mutate_pod_create, validate_pod_update,
};
pub use error::AdmissionError;
pub use review::{AdmissionRequest, AdmissionResponse, AdmissionReview, review};
