use csi_driver_operator_apis::ClusterCSIDriver;
use kube::CustomResourceExt;
use serde_yaml;

pub fn main() {
    println!("{}", serde_yaml::to_string(&ClusterCSIDriver::crd()).unwrap());
}
