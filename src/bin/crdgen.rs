// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

//! CRD YAML Generator
//!
//! Generates Kubernetes CRD YAML files from the Rust types in src/crd.rs,
//! keeping the manifests in deploy/crds/ in sync with the code.
//!
//! Usage:
//!   cargo run --bin crdgen

use kube::CustomResourceExt;
use kube_valet::crd::{ClusterPodAssignmentRule, NodeAssignmentGroup, PodAssignmentRule};
use std::fs;
use std::path::Path;

const GENERATED_HEADER: &str = "# Copyright (c) 2025 Domo, Inc.
# SPDX-License-Identifier: MIT
#
# This file is AUTO-GENERATED from src/crd.rs
# DO NOT EDIT MANUALLY - Run `cargo run --bin crdgen` to regenerate
#
";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let output_dir = Path::new("deploy/crds");

    fs::create_dir_all(output_dir)?;

    println!("Generating CRD YAML files from src/crd.rs...");

    generate_crd::<NodeAssignmentGroup>("nodeassignmentgroups.crd.yaml", output_dir)?;
    generate_crd::<PodAssignmentRule>("podassignmentrules.crd.yaml", output_dir)?;
    generate_crd::<ClusterPodAssignmentRule>("clusterpodassignmentrules.crd.yaml", output_dir)?;

    println!("Successfully generated CRD YAML files in deploy/crds/");

    Ok(())
}

fn generate_crd<T>(filename: &str, output_dir: &Path) -> Result<(), Box<dyn std::error::Error>>
where
    T: CustomResourceExt,
{
    let crd = T::crd();
    let yaml = serde_yaml::to_string(&crd)?;

    let content = format!("{GENERATED_HEADER}{yaml}");

    let output_path = output_dir.join(filename);
    fs::write(&output_path, content)?;

    println!("  Generated {filename}");

    Ok(())
}
