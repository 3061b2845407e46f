//! Prints the CustomResourceDefinitions owned by MaroonedPods as YAML.
//!
//! `cargo run -p crds --bin crdgen > config/crd/maroonedpods.yaml`

use crds::MaroonedPodsConfig;
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&MaroonedPodsConfig::crd())?);
    Ok(())
}
