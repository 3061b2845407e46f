//! MaroonedPods CRD Definitions
//!
//! Kubernetes resource types, well-known labels and pod predicates shared by
//! the MaroonedPods gate controller and admission hook.

pub mod config;
pub mod labels;
pub mod pod;
pub mod virtual_machine_instance;
pub mod warm_pool;

pub use config::*;
pub use virtual_machine_instance::*;
pub use warm_pool::*;
