//! Prints the CustomResourceDefinitions owned by the GPU inventory controller
//! as a multi-document YAML stream, ready for `kubectl apply -f -`.

use crds::{GpuDevice, GpuNodeInventory};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crds = [GpuDevice::crd(), GpuNodeInventory::crd()];
    for crd in &crds {
        print!("---\n{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}
