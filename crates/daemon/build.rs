use std::env;
use std::process::Command;

/// `git describe` of the checkout, when there is one
fn describe_checkout() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--always", "--dirty", "--tags"])
        .output()
        .ok()
        .filter(|output| output.status.success())?;
    let described = String::from_utf8(output.stdout).ok()?;
    Some(described.trim().to_string()).filter(|s| !s.is_empty())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=.git/HEAD");

    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".into());
    let repo_version = describe_checkout()
        .or_else(|| env::var("CARGO_PKG_VERSION").ok())
        .unwrap_or_else(|| "unknown".into());
    let built_at = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");

    for (key, value) in [
        ("BUILD_PROFILE", profile),
        ("REPO_VERSION", repo_version),
        ("BUILD_TIMESTAMP", built_at.to_string()),
    ] {
        println!("cargo:rustc-env={key}={value}");
    }
}
