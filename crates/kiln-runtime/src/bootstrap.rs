use crate::conveyor::ConveyorPacker;
use crate::RuntimeError;
use kiln_bundle::Bundle;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info};

/// Host tool that builds a distribution rootfs from package mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapTool {
    Debootstrap,
    Yum,
    Zypper,
    Arch,
    Busybox,
}

impl BootstrapTool {
    pub fn bootstrap(self) -> &'static str {
        match self {
            Self::Debootstrap => "debootstrap",
            Self::Yum => "yum",
            Self::Zypper => "zypper",
            Self::Arch => "arch",
            Self::Busybox => "busybox",
        }
    }

    /// The executable that must be on the host.
    pub fn program(self) -> &'static str {
        match self {
            Self::Debootstrap => "debootstrap",
            Self::Yum => "yum",
            Self::Zypper => "zypper",
            Self::Arch => "pacstrap",
            Self::Busybox => "curl",
        }
    }
}

/// Packages from the `include` header plus the `INCLUDE` environment
/// variable, split on whitespace and commas.
pub fn include_list(header: &BTreeMap<String, String>, env_include: Option<&str>) -> Vec<String> {
    header
        .get("include")
        .map(String::as_str)
        .into_iter()
        .chain(env_include)
        .flat_map(|s| s.split(|c: char| c.is_whitespace() || c == ','))
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn required<'a>(
    tool: BootstrapTool,
    header: &'a BTreeMap<String, String>,
    key: &str,
) -> Result<&'a str, RuntimeError> {
    header
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| RuntimeError::MissingHeader {
            bootstrap: tool.bootstrap().to_owned(),
            key: key.to_owned(),
        })
}

/// Mirror URL with `%{OSVERSION}` substituted.
fn mirror(tool: BootstrapTool, header: &BTreeMap<String, String>) -> Result<String, RuntimeError> {
    let url = required(tool, header, "mirrorurl")?;
    let version = header.get("osversion").map_or("", |v| v.trim());
    Ok(url.replace("%{OSVERSION}", version))
}

/// The commands that populate `rootfs`, in order. Config files a tool needs
/// are returned alongside as `(path, content)` pairs.
pub fn bootstrap_commands(
    tool: BootstrapTool,
    header: &BTreeMap<String, String>,
    includes: &[String],
    rootfs: &Path,
    scratch: &Path,
) -> Result<(Vec<Vec<String>>, Vec<(std::path::PathBuf, String)>), RuntimeError> {
    let root = rootfs.to_string_lossy().into_owned();
    let mut files = Vec::new();
    let commands = match tool {
        BootstrapTool::Debootstrap => {
            let suite = required(tool, header, "osversion")?;
            let mut cmd = vec!["debootstrap".to_owned(), "--variant=minbase".to_owned()];
            if !includes.is_empty() {
                cmd.push(format!("--include={}", includes.join(",")));
            }
            cmd.extend([suite.to_owned(), root, mirror(tool, header)?]);
            vec![cmd]
        }
        BootstrapTool::Yum => {
            let conf = scratch.join("yum.conf");
            let mut content = String::from(
                "[main]\ncachedir=/var/cache/yum-bootstrap\nkeepcache=0\ndebuglevel=2\n\
                 logfile=/var/log/yum.log\nsyslog_device=/dev/null\nexactarch=1\nobsoletes=1\n\
                 gpgcheck=0\nplugins=1\nreposdir=0\ndeltarpm=0\n",
            );
            let _ = write!(
                content,
                "\n[base]\nname=Linux $releasever - $basearch\nbaseurl={}\nenabled=1\n",
                mirror(tool, header)?
            );
            if let Some(update) = header.get("updateurl").filter(|u| !u.trim().is_empty()) {
                let _ = write!(
                    content,
                    "\n[updates]\nname=Linux $releasever - $basearch updates\nbaseurl={}\nenabled=1\n",
                    update.trim()
                );
            }
            files.push((conf.clone(), content));

            let mut cmd = vec![
                "yum".to_owned(),
                "-c".to_owned(),
                conf.to_string_lossy().into_owned(),
                "--installroot".to_owned(),
                root,
                "-y".to_owned(),
            ];
            if let Some(version) = header.get("osversion").filter(|v| !v.trim().is_empty()) {
                cmd.push(format!("--releasever={}", version.trim()));
            }
            cmd.extend(["install".to_owned(), "/etc/redhat-release".to_owned(), "coreutils".to_owned()]);
            cmd.extend(includes.iter().cloned());
            vec![cmd]
        }
        BootstrapTool::Zypper => {
            let repo = vec![
                "zypper".to_owned(),
                "--non-interactive".to_owned(),
                "--root".to_owned(),
                root.clone(),
                "addrepo".to_owned(),
                mirror(tool, header)?,
                "repo-oss".to_owned(),
            ];
            let mut install = vec![
                "zypper".to_owned(),
                "--non-interactive".to_owned(),
                "--gpg-auto-import-keys".to_owned(),
                "--root".to_owned(),
                root,
                "install".to_owned(),
                "--no-recommends".to_owned(),
                "zypper".to_owned(),
            ];
            install.extend(includes.iter().cloned());
            vec![repo, install]
        }
        BootstrapTool::Arch => {
            let mut cmd = vec![
                "pacstrap".to_owned(),
                "-c".to_owned(),
                "-d".to_owned(),
                "-G".to_owned(),
                "-M".to_owned(),
                root,
                "base".to_owned(),
            ];
            cmd.extend(includes.iter().cloned());
            vec![cmd]
        }
        BootstrapTool::Busybox => {
            let bin = rootfs.join("bin/busybox");
            vec![vec![
                "curl".to_owned(),
                "-fSL".to_owned(),
                "-o".to_owned(),
                bin.to_string_lossy().into_owned(),
                mirror(tool, header)?,
            ]]
        }
    };
    Ok((commands, files))
}

/// OS bootstrap sources driven by a host tool.
pub struct OsBootstrapConveyorPacker {
    tool: BootstrapTool,
}

impl OsBootstrapConveyorPacker {
    pub fn new(tool: BootstrapTool) -> Self {
        Self { tool }
    }
}

impl ConveyorPacker for OsBootstrapConveyorPacker {
    fn name(&self) -> &'static str {
        self.tool.bootstrap()
    }

    fn get(&mut self, bundle: &mut Bundle) -> Result<(), RuntimeError> {
        let env_include = std::env::var("INCLUDE").ok();
        let includes = include_list(&bundle.recipe.header, env_include.as_deref());
        let rootfs = bundle.rootfs();
        let (commands, files) = bootstrap_commands(
            self.tool,
            &bundle.recipe.header,
            &includes,
            &rootfs,
            &bundle.tmp_dir(),
        )?;

        for (path, content) in files {
            fs::write(path, content)?;
        }
        if self.tool == BootstrapTool::Busybox {
            fs::create_dir_all(rootfs.join("bin"))?;
            fs::create_dir_all(rootfs.join("etc"))?;
        }

        info!("bootstrapping {} rootfs", self.tool.bootstrap());
        for argv in commands {
            let Some((program, args)) = argv.split_first() else {
                continue;
            };
            debug!("running {}", argv.join(" "));
            let status = Command::new(program).args(args).status().map_err(|e| {
                RuntimeError::ExecFailed(format!("{program} not found or failed to start: {e}"))
            })?;
            if !status.success() {
                return Err(RuntimeError::ExecFailed(format!(
                    "{} bootstrap failed: {program} exited with {status}",
                    self.tool.bootstrap()
                )));
            }
        }

        if self.tool == BootstrapTool::Busybox {
            finish_busybox(&rootfs)?;
        }
        Ok(())
    }
}

fn finish_busybox(rootfs: &Path) -> Result<(), RuntimeError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(rootfs.join("bin/busybox"), fs::Permissions::from_mode(0o755))?;
        let sh = rootfs.join("bin/sh");
        if fs::symlink_metadata(&sh).is_err() {
            std::os::unix::fs::symlink("busybox", sh)?;
        }
    }
    fs::write(rootfs.join("etc/passwd"), "root:!:0:0:root:/root:/bin/sh\n")?;
    fs::write(rootfs.join("etc/group"), "root:x:0:\n")?;
    Ok(())
}
