use crate::conveyor::{pack_base, ConveyorPacker};
use crate::sandbox::shell_quote;
use crate::RuntimeError;
use fs2::FileExt;
use kiln_bundle::{write_atomic, Bundle};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

const LAYOUT_TAG: &str = "kiln";

/// Where an OCI image comes from, as understood by `skopeo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Docker,
    DockerArchive,
    DockerDaemon,
    OciLayout,
    OciArchive,
}

impl Transport {
    pub fn bootstrap(self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::DockerArchive => "docker-archive",
            Self::DockerDaemon => "docker-daemon",
            Self::OciLayout => "oci",
            Self::OciArchive => "oci-archive",
        }
    }
}

/// Build the `skopeo` source reference for a definition header.
pub fn source_reference(
    transport: Transport,
    header: &BTreeMap<String, String>,
) -> Result<String, RuntimeError> {
    let from = header
        .get("from")
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
        .ok_or_else(|| RuntimeError::MissingHeader {
            bootstrap: transport.bootstrap().to_owned(),
            key: "from".to_owned(),
        })?;

    Ok(match transport {
        Transport::Docker => {
            let from = from.trim_start_matches("docker://").trim_start_matches('/');
            let registry = header.get("registry").map(|r| r.trim().trim_end_matches('/'));
            let namespace = header.get("namespace").map(|n| n.trim().trim_matches('/'));
            match (registry, namespace) {
                (Some(r), Some(n)) if !r.is_empty() && !n.is_empty() => {
                    format!("docker://{r}/{n}/{from}")
                }
                (Some(r), _) if !r.is_empty() => format!("docker://{r}/{from}"),
                (_, Some(n)) if !n.is_empty() => format!("docker://{n}/{from}"),
                _ => format!("docker://{from}"),
            }
        }
        Transport::DockerArchive => format!("docker-archive:{from}"),
        Transport::DockerDaemon => format!("docker-daemon:{from}"),
        Transport::OciLayout => format!("oci:{from}"),
        Transport::OciArchive => format!("oci-archive:{from}"),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ImageConfig {
    #[serde(default)]
    config: ContainerConfig,
}

/// The runtime part of an OCI image config.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Entrypoint", default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", default)]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "Env", default)]
    pub env: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", default)]
    pub working_dir: Option<String>,
}

fn quote_all(words: &[String]) -> String {
    words.iter().map(|w| shell_quote(w)).collect::<Vec<_>>().join(" ")
}

/// Runscript that mirrors `ENTRYPOINT`/`CMD`: user arguments replace `CMD`.
pub fn oci_runscript(cfg: &ContainerConfig) -> Option<String> {
    let entrypoint = cfg.entrypoint.as_deref().unwrap_or_default();
    let cmd = cfg.cmd.as_deref().unwrap_or_default();
    if entrypoint.is_empty() && cmd.is_empty() {
        return None;
    }

    let mut script = String::from("#!/bin/sh\n");
    if let Some(dir) = cfg.working_dir.as_deref().filter(|d| !d.is_empty()) {
        let _ = writeln!(script, "cd {} || exit 1", shell_quote(dir));
    }
    let ep = quote_all(entrypoint);
    if ep.is_empty() {
        script.push_str("if [ $# -gt 0 ]; then\n    exec \"$@\"\nfi\n");
    } else {
        let _ = write!(script, "if [ $# -gt 0 ]; then\n    exec {ep} \"$@\"\nfi\n");
    }
    let full: Vec<String> = entrypoint.iter().chain(cmd).cloned().collect();
    let _ = writeln!(script, "exec {}", quote_all(&full));
    Some(script)
}

/// Environment script exporting the image's `Env` entries.
pub fn oci_env_script(cfg: &ContainerConfig) -> Option<String> {
    let env = cfg.env.as_deref().filter(|e| !e.is_empty())?;
    let mut script = String::from("#!/bin/sh\n");
    for entry in env {
        let Some((key, value)) = entry.split_once('=') else {
            continue;
        };
        if key.is_empty() || !key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
            continue;
        }
        let _ = writeln!(script, "export {key}={}", shell_quote(value));
    }
    Some(script)
}

/// OCI and Docker sources: `skopeo copy` into an OCI layout in the image
/// cache, then `umoci raw unpack` into the rootfs.
pub struct OciConveyorPacker {
    transport: Transport,
    config: Option<ContainerConfig>,
}

impl OciConveyorPacker {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            config: None,
        }
    }

    fn fetch_layout(&self, reference: &str, cache_root: &Path) -> Result<PathBuf, RuntimeError> {
        let layout = cache_root
            .join("oci")
            .join(blake3::hash(reference.as_bytes()).to_hex().as_str());
        fs::create_dir_all(&layout)?;
        let lock = File::create(layout.with_extension("lock"))?;
        lock.lock_exclusive()?;

        info!("fetching {reference}");
        let dest = format!("oci:{}:{LAYOUT_TAG}", layout.display());
        run_tool(Command::new("skopeo").args(["copy", reference, &dest]), "skopeo copy")?;
        Ok(layout)
    }

    fn inspect_config(layout: &Path) -> Result<ContainerConfig, RuntimeError> {
        let image = format!("oci:{}:{LAYOUT_TAG}", layout.display());
        let output = Command::new("skopeo")
            .args(["inspect", "--config", &image])
            .output()
            .map_err(|e| RuntimeError::ExecFailed(format!("skopeo inspect failed to start: {e}")))?;
        if !output.status.success() {
            return Err(RuntimeError::ExecFailed(format!(
                "skopeo inspect failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        let parsed: ImageConfig = serde_json::from_slice(&output.stdout)
            .map_err(|e| RuntimeError::ExecFailed(format!("invalid image config: {e}")))?;
        Ok(parsed.config)
    }
}

impl ConveyorPacker for OciConveyorPacker {
    fn name(&self) -> &'static str {
        self.transport.bootstrap()
    }

    fn requires_cache(&self) -> bool {
        true
    }

    fn get(&mut self, bundle: &mut Bundle) -> Result<(), RuntimeError> {
        let cache_root = bundle
            .opts
            .image_cache
            .clone()
            .ok_or_else(|| RuntimeError::CacheRequired(self.name().to_owned()))?;
        let reference = source_reference(self.transport, &bundle.recipe.header)?;
        let layout = self.fetch_layout(&reference, &cache_root)?;

        // umoci creates the rootfs itself.
        let rootfs = bundle.rootfs();
        fs::remove_dir(&rootfs)?;
        let image = format!("{}:{LAYOUT_TAG}", layout.display());
        let mut unpack = Command::new("umoci");
        unpack.args(["raw", "unpack"]);
        if crate::sandbox::current_euid() != 0 {
            unpack.arg("--rootless");
        }
        unpack.args(["--image", &image]).arg(&rootfs);
        debug!("unpacking {image} into {}", rootfs.display());
        run_tool(&mut unpack, "umoci raw unpack")?;

        self.config = Some(Self::inspect_config(&layout)?);
        Ok(())
    }

    fn pack(&mut self, bundle: &mut Bundle) -> Result<(), RuntimeError> {
        if let Some(cfg) = &self.config {
            let layout = bundle.layout();
            if let Some(runscript) = oci_runscript(cfg) {
                write_atomic(&layout.runscript(), runscript.as_bytes(), 0o755)?;
            }
            if let Some(env) = oci_env_script(cfg) {
                write_atomic(
                    &layout.env_dir().join("10-docker2singularity.sh"),
                    env.as_bytes(),
                    0o755,
                )?;
            }
        }
        pack_base(bundle)
    }
}

fn run_tool(cmd: &mut Command, what: &str) -> Result<(), RuntimeError> {
    let output = cmd
        .output()
        .map_err(|e| RuntimeError::ExecFailed(format!("{what} not found or failed to start: {e}")))?;
    if !output.status.success() {
        return Err(RuntimeError::ExecFailed(format!(
            "{what} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn docker_reference_uses_registry_and_namespace() {
        let h = header(&[
            ("from", "app:1.0"),
            ("registry", "registry.example.com"),
            ("namespace", "team"),
        ]);
        assert_eq!(
            source_reference(Transport::Docker, &h).unwrap(),
            "docker://registry.example.com/team/app:1.0"
        );
        let h = header(&[("from", "alpine:3.19")]);
        assert_eq!(
            source_reference(Transport::Docker, &h).unwrap(),
            "docker://alpine:3.19"
        );
    }

    #[test]
    fn archive_references() {
        let h = header(&[("from", "/tmp/img.tar")]);
        assert_eq!(
            source_reference(Transport::DockerArchive, &h).unwrap(),
            "docker-archive:/tmp/img.tar"
        );
        assert_eq!(
            source_reference(Transport::OciArchive, &h).unwrap(),
            "oci-archive:/tmp/img.tar"
        );
    }

    #[test]
    fn missing_from_fails() {
        assert!(matches!(
            source_reference(Transport::OciLayout, &BTreeMap::new()),
            Err(RuntimeError::MissingHeader { .. })
        ));
    }

    #[test]
    fn config_parses_from_inspect_output() {
        let json = r#"{"architecture":"amd64","config":{"Entrypoint":["/entry.sh"],"Cmd":["serve","--port","80"],"Env":["PATH=/usr/bin:/bin","GREETING=it's ok"],"WorkingDir":"/srv"}}"#;
        let parsed: ImageConfig = serde_json::from_str(json).unwrap();
        let cfg = parsed.config;
        assert_eq!(cfg.entrypoint.as_deref(), Some(&["/entry.sh".to_owned()][..]));

        let run = oci_runscript(&cfg).unwrap();
        assert!(run.starts_with("#!/bin/sh\ncd '/srv' || exit 1\n"));
        assert!(run.contains("exec '/entry.sh' \"$@\""));
        assert!(run.contains("exec '/entry.sh' 'serve' '--port' '80'"));

        let env = oci_env_script(&cfg).unwrap();
        assert!(env.contains("export PATH='/usr/bin:/bin'"));
        assert!(env.contains("export GREETING='it'\\''s ok'"));
    }

    #[test]
    fn cmd_only_runscript_lets_args_replace_cmd() {
        let cfg = ContainerConfig {
            cmd: Some(vec!["sh".to_owned()]),
            ..ContainerConfig::default()
        };
        let run = oci_runscript(&cfg).unwrap();
        assert!(run.contains("    exec \"$@\"\n"));
        assert!(run.ends_with("exec 'sh'\n"));
    }

    #[test]
    fn no_entrypoint_or_cmd_keeps_placeholder() {
        assert!(oci_runscript(&ContainerConfig::default()).is_none());
        assert!(oci_env_script(&ContainerConfig::default()).is_none());
    }

    #[test]
    fn get_without_cache_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut bundle = Bundle::new(dir.path(), "oci-").unwrap();
        bundle
            .recipe
            .header
            .insert("from".to_owned(), "alpine".to_owned());
        let err = OciConveyorPacker::new(Transport::Docker)
            .get(&mut bundle)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::CacheRequired(_)));
    }
}
