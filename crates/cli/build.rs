//! Embeds the agent binary into the host driver.
//!
//! Searches for a prebuilt `apf-agent` (the `APF_AGENT_BIN` env var wins,
//! then the usual target directories) and copies it into `OUT_DIR` for
//! `include_bytes!`. When none is found an empty placeholder is embedded
//! instead, turning the problem into a clear runtime error rather than a
//! build failure.

use std::env;
use std::fs;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-env-changed=APF_AGENT_BIN");
    println!("cargo:rerun-if-changed=../agent/src");

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let dest = out_dir.join("apf-agent.bin");

    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(path) = env::var("APF_AGENT_BIN") {
        candidates.push(PathBuf::from(path));
    }
    for dir in [
        "../../target/x86_64-unknown-linux-musl/agent-release",
        "../../target/x86_64-unknown-linux-musl/release",
        "../../target/aarch64-unknown-linux-musl/agent-release",
        "../../target/aarch64-unknown-linux-musl/release",
        "../../target/release",
        "../../target/debug",
    ] {
        candidates.push(PathBuf::from(dir).join("apf-agent"));
    }

    for candidate in &candidates {
        if candidate.is_file() {
            match fs::read(candidate) {
                Ok(data) if !data.is_empty() => {
                    fs::write(&dest, &data).unwrap();
                    eprintln!(
                        "cargo:warning=Embedded agent from {} ({} bytes)",
                        candidate.display(),
                        data.len()
                    );
                    return;
                }
                _ => continue,
            }
        }
    }

    fs::write(&dest, b"").unwrap();
    eprintln!("cargo:warning=No prebuilt agent binary found, embedding empty placeholder");
}
