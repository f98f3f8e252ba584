use std::fs;
use std::path::Path;

use velero_e2e::k8s::configmap::{configmap_from_yaml_data, CONFIGMAP_DATA_KEY};
use velero_e2e::k8s::storage::{renamed_storage_class_manifest, E2E_STORAGE_CLASS, E2E_STORAGE_CLASS_2};
use velero_e2e::policy::ResourcePolicies;

const PROVIDERS: [&str; 5] = ["kind", "aws", "azure", "gcp", "vsphere"];

#[test]
fn every_provider_manifest_defines_the_e2e_class() {
    for provider in PROVIDERS {
        let path = Path::new("testdata/storage-class").join(format!("{provider}.yaml"));
        let content = fs::read_to_string(&path).unwrap();
        assert!(
            content.contains(&format!("name: {E2E_STORAGE_CLASS}\n")),
            "{provider}.yaml"
        );
    }
}

#[test]
fn kind_manifest_renames_to_second_class() {
    let path = Path::new("testdata/storage-class/kind.yaml");
    let before = fs::read_to_string(path).unwrap();

    let renamed = renamed_storage_class_manifest(path, E2E_STORAGE_CLASS, E2E_STORAGE_CLASS_2).unwrap();
    let content = fs::read_to_string(renamed.path()).unwrap();
    assert!(content.contains(&format!("name: {E2E_STORAGE_CLASS_2}\n")));
    assert!(!content.contains(&format!("name: {E2E_STORAGE_CLASS}\n")));
    assert_eq!(fs::read_to_string(path).unwrap(), before);
}

#[test]
fn policy_configmap_payload_parses_back() {
    let policies = ResourcePolicies::e2e_default();
    let cm = configmap_from_yaml_data(&policies.to_yaml().unwrap(), "cm-resource-policies-sc", "velero");
    let data = cm.data.unwrap();
    assert_eq!(ResourcePolicies::from_yaml(&data[CONFIGMAP_DATA_KEY]).unwrap(), policies);
}
