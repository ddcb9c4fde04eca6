//! Prints the CRD manifests as a multi-document YAML stream.

use crds::{KopsConfig, KopsControlPlane};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&KopsConfig::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&KopsControlPlane::crd())?);
    Ok(())
}
