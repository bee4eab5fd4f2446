//! Gets the agent into the container before anything else happens: wrap the
//! embedded binary in a tar archive and pipe it through the container
//! runtime's copy command, then build the exec command whose stdin/stdout
//! become the multiplexed pipe.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use apf_common::{AGENT_PATH, Error, Result};

/// The agent binary baked in by build.rs; empty when no prebuilt agent was
/// found at build time.
const EMBEDDED_AGENT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/apf-agent.bin"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRuntime {
    Docker,
    Kubernetes,
    Podman,
}

/// A resolved copy/exec target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    runtime: ContainerRuntime,
    /// Kubernetes namespace; `None` for the container runtimes.
    namespace: Option<String>,
    /// Container id, or pod name for Kubernetes.
    name: String,
}

impl Target {
    /// Parse the CLI target id. Kubernetes pods are addressed as
    /// `namespace/pod`; anything else is taken verbatim.
    pub fn parse(runtime: ContainerRuntime, raw: &str) -> Result<Self> {
        match runtime {
            ContainerRuntime::Kubernetes => {
                let (namespace, pod) = raw.split_once('/').ok_or_else(|| {
                    Error::Bootstrap(format!(
                        "invalid kubernetes pod id {raw:?}, expected {{namespace}}/{{pod}}"
                    ))
                })?;
                if namespace.is_empty() || pod.is_empty() {
                    return Err(Error::Bootstrap(format!(
                        "invalid kubernetes pod id {raw:?}, expected {{namespace}}/{{pod}}"
                    )));
                }
                Ok(Self {
                    runtime,
                    namespace: Some(namespace.to_string()),
                    name: pod.to_string(),
                })
            }
            _ => Ok(Self {
                runtime,
                namespace: None,
                name: raw.to_string(),
            }),
        }
    }

    /// Command that unpacks a tar archive read from stdin at the container
    /// root.
    fn copy_command(&self) -> Vec<String> {
        match (&self.runtime, &self.namespace) {
            (ContainerRuntime::Docker, _) => {
                vec!["docker".into(), "cp".into(), "-".into(), format!("{}:/", self.name)]
            }
            (ContainerRuntime::Podman, _) => {
                vec!["podman".into(), "cp".into(), "-".into(), format!("{}:/", self.name)]
            }
            (ContainerRuntime::Kubernetes, Some(namespace)) => vec![
                "kubectl".into(),
                "exec".into(),
                "-i".into(),
                "-n".into(),
                namespace.clone(),
                self.name.clone(),
                "--".into(),
                "tar".into(),
                "xf".into(),
                "-".into(),
                "-C".into(),
                "/".into(),
            ],
            (ContainerRuntime::Kubernetes, None) => unreachable!("parse always sets a namespace"),
        }
    }

    /// Command that runs the copied agent with piped stdin/stdout.
    fn exec_command(&self, debug: bool) -> Vec<String> {
        let mut args = match (&self.runtime, &self.namespace) {
            (ContainerRuntime::Docker, _) => {
                vec!["docker".into(), "exec".into(), "-i".into(), self.name.clone()]
            }
            (ContainerRuntime::Podman, _) => {
                vec!["podman".into(), "exec".into(), "-i".into(), self.name.clone()]
            }
            (ContainerRuntime::Kubernetes, Some(namespace)) => vec![
                "kubectl".into(),
                "exec".into(),
                "-i".into(),
                "-n".into(),
                namespace.clone(),
                self.name.clone(),
            ],
            (ContainerRuntime::Kubernetes, None) => unreachable!("parse always sets a namespace"),
        };
        args.push(AGENT_PATH.to_string());
        if debug {
            args.push("-d".to_string());
        }
        args
    }
}

/// Tar archive holding the agent binary at the container-root path.
fn agent_archive_from(binary: &[u8]) -> Result<Vec<u8>> {
    if binary.is_empty() {
        return Err(Error::Bootstrap(
            "no agent binary embedded in this build; build one first \
             (`cargo build -p apf-agent --release`, or point APF_AGENT_BIN at it) \
             and rebuild apf"
                .into(),
        ));
    }
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(binary.len() as u64);
    header.set_mode(0o755);
    header.set_cksum();
    builder
        .append_data(&mut header, AGENT_PATH.trim_start_matches('/'), binary)
        .map_err(|e| Error::Bootstrap(format!("failed to build agent archive: {e}")))?;
    builder
        .into_inner()
        .map_err(|e| Error::Bootstrap(format!("failed to finish agent archive: {e}")))
}

/// Copy the agent into the container. Fatal on any failure; nothing has been
/// spawned yet.
pub async fn install_agent(target: &Target) -> Result<()> {
    let archive = agent_archive_from(EMBEDDED_AGENT)?;
    let args = target.copy_command();
    info!(command = ?args, "copying agent into container");

    let mut command = Command::new(&args[0]);
    command
        .args(&args[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = command.spawn()?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Bootstrap("copy command has no stdin".into()))?;
    stdin.write_all(&archive).await?;
    drop(stdin);

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(Error::Bootstrap(format!(
            "{} failed ({}): {}",
            args[0],
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    debug!("agent copied");
    Ok(())
}

/// The exec command whose pipes will carry the multiplexer.
pub fn agent_command(target: &Target, debug: bool) -> Command {
    let args = target.exec_command(debug);
    info!(command = ?args, "starting agent");
    let mut command = Command::new(&args[0]);
    command.args(&args[1..]);
    command
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_commands() {
        let target = Target::parse(ContainerRuntime::Docker, "cafe1234").expect("parse failed");
        assert_eq!(
            target.copy_command(),
            vec!["docker", "cp", "-", "cafe1234:/"]
        );
        assert_eq!(
            target.exec_command(false),
            vec!["docker", "exec", "-i", "cafe1234", "/apf-agent"]
        );
        assert_eq!(
            target.exec_command(true),
            vec!["docker", "exec", "-i", "cafe1234", "/apf-agent", "-d"]
        );
    }

    #[test]
    fn podman_commands() {
        let target = Target::parse(ContainerRuntime::Podman, "deadbeef").expect("parse failed");
        assert_eq!(
            target.copy_command(),
            vec!["podman", "cp", "-", "deadbeef:/"]
        );
        assert_eq!(
            target.exec_command(false),
            vec!["podman", "exec", "-i", "deadbeef", "/apf-agent"]
        );
    }

    #[test]
    fn kubernetes_commands() {
        let target =
            Target::parse(ContainerRuntime::Kubernetes, "staging/web-0").expect("parse failed");
        assert_eq!(
            target.copy_command(),
            vec![
                "kubectl", "exec", "-i", "-n", "staging", "web-0", "--", "tar", "xf", "-", "-C",
                "/"
            ]
        );
        assert_eq!(
            target.exec_command(true),
            vec!["kubectl", "exec", "-i", "-n", "staging", "web-0", "/apf-agent", "-d"]
        );
    }

    #[test]
    fn kubernetes_target_requires_namespace_and_pod() {
        assert!(Target::parse(ContainerRuntime::Kubernetes, "just-a-pod").is_err());
        assert!(Target::parse(ContainerRuntime::Kubernetes, "/pod").is_err());
        assert!(Target::parse(ContainerRuntime::Kubernetes, "ns/").is_err());
    }

    #[test]
    fn archive_holds_the_agent_at_the_root() {
        let binary = b"#!/bin/true\n";
        let archive = agent_archive_from(binary).expect("archive failed");

        let mut reader = tar::Archive::new(&archive[..]);
        let mut entries = reader.entries().expect("entries failed");
        let entry = entries
            .next()
            .expect("archive is empty")
            .expect("bad entry");
        assert_eq!(
            entry.path().expect("path failed").to_string_lossy(),
            "apf-agent"
        );
        assert_eq!(entry.header().mode().expect("mode failed") & 0o777, 0o755);
        assert_eq!(entry.header().size().expect("size failed"), binary.len() as u64);
        assert!(entries.next().is_none(), "archive has extra entries");
    }

    #[test]
    fn empty_agent_binary_is_a_bootstrap_error() {
        let err = agent_archive_from(b"").unwrap_err();
        assert!(matches!(err, Error::Bootstrap(_)), "got {err:?}");
    }
}
