// build.rs - Build metadata and feature validation for petra-bridge
//
// Stamps build information consumed by `petra_bridge::build_info` and rejects
// feature combinations that cannot produce a working binary.

use std::collections::HashSet;
use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=Cargo.toml");

    set_build_env_vars();

    let enabled_features = collect_enabled_features();

    if let Err(e) = validate_feature_dependencies(&enabled_features) {
        panic!("Feature validation failed: {}", e);
    }
}

/// Set build environment variables that the code expects
fn set_build_env_vars() {
    println!(
        "cargo:rustc-env=PETRA_BRIDGE_BUILD_TIMESTAMP={}",
        chrono::Utc::now().to_rfc3339()
    );

    let rustc_version = Command::new(env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string()))
        .arg("--version")
        .output()
        .ok()
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=PETRA_BRIDGE_RUSTC_VERSION={}", rustc_version);

    let git_hash = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=PETRA_BRIDGE_GIT_HASH={}", git_hash);
}

/// Collect all enabled feature flags from environment variables
fn collect_enabled_features() -> HashSet<String> {
    env::vars()
        .filter_map(|(key, _)| {
            key.strip_prefix("CARGO_FEATURE_")
                .map(|name| name.to_lowercase().replace('_', "-"))
        })
        .collect()
}

/// Check feature dependencies
fn validate_feature_dependencies(features: &HashSet<String>) -> Result<(), String> {
    // Prometheus output is only reachable through the status server
    let dependencies = [("metrics", vec!["web"])];

    for (feature, deps) in dependencies {
        if features.contains(feature) {
            for dep in deps {
                if !features.contains(dep) {
                    return Err(format!(
                        "Feature '{}' requires '{}' to be enabled",
                        feature, dep
                    ));
                }
            }
        }
    }

    Ok(())
}
