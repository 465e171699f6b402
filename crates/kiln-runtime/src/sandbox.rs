use crate::RuntimeError;
use kiln_bundle::Bundle;
use kiln_schema::Script;
use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// `PATH` every build script sees.
pub const SCRIPT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Where `%post` may append environment for the finished image.
pub const SCRIPT_ENVIRONMENT: &str = "/.singularity.d/env/91-environment.sh";

const DEFAULT_INTERPRETER: &[&str] = &["/bin/sh", "-e", "-x"];

pub(crate) fn shell_quote(s: &str) -> String {
    // Single-quoting in POSIX shell: replace ' with '\'' then wrap in '
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn shell_quote_path(p: &Path) -> String {
    shell_quote(&p.to_string_lossy())
}

/// Safe wrapper around libc::geteuid().
#[allow(unsafe_code)]
pub(crate) fn current_euid() -> u32 {
    // SAFETY: geteuid() takes no arguments and cannot fail.
    unsafe { libc::geteuid() }
}

fn interpreter(script: &Script) -> Vec<String> {
    script.interpreter().unwrap_or_else(|| {
        DEFAULT_INTERPRETER
            .iter()
            .map(|s| (*s).to_owned())
            .collect()
    })
}

fn exit_status(section: &str, status: std::process::ExitStatus) -> Result<(), RuntimeError> {
    if status.success() {
        Ok(())
    } else {
        Err(RuntimeError::ScriptFailed {
            section: section.to_owned(),
            code: status.code(),
        })
    }
}

/// Run a `%pre` script directly on the host, outside any rootfs.
pub fn run_host_script(section: &str, script: &Script) -> Result<(), RuntimeError> {
    let mut file = tempfile::Builder::new()
        .prefix("kiln-")
        .suffix(&format!("-{section}.sh"))
        .tempfile()?;
    file.write_all(script.script.as_bytes())?;
    file.flush()?;

    let argv = interpreter(script);
    info!("running %{section} on the host");
    let status = Command::new(&argv[0])
        .args(&argv[1..])
        .arg(file.path())
        .status()
        .map_err(|e| RuntimeError::ExecFailed(format!("failed to start {}: {e}", argv[0])))?;
    exit_status(section, status)
}

/// How a script sees the bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Run from the host filesystem with the rootfs as working directory
    /// (`%setup`).
    Host,
    /// Run chrooted into the rootfs (`%post`, `%test`).
    Chroot,
}

/// Privileged execution of build scripts against one bundle.
///
/// Scripts run in fresh mount and pid namespaces with an empty environment
/// plus a fixed set of variables and the names the user explicitly allowed.
/// The session `resolv.conf` and `hosts` are bind-mounted read-only over
/// the rootfs copies.
#[derive(Debug, Clone)]
pub struct ScriptSandbox {
    rootfs: PathBuf,
    session_dir: PathBuf,
    allowed_env: Vec<String>,
}

impl ScriptSandbox {
    pub fn new(bundle: &Bundle) -> Result<Self, RuntimeError> {
        let session_dir = bundle.tmp_dir().join("session");
        fs::create_dir_all(&session_dir)?;

        let resolv = fs::read_to_string("/etc/resolv.conf").unwrap_or_default();
        fs::write(session_dir.join("resolv.conf"), resolv)?;
        let hosts = fs::read_to_string("/etc/hosts")
            .unwrap_or_else(|_| "127.0.0.1\tlocalhost\n::1\tlocalhost\n".to_owned());
        fs::write(session_dir.join("hosts"), hosts)?;

        Ok(Self {
            rootfs: bundle.rootfs(),
            session_dir,
            allowed_env: bundle.opts.allowed_env.clone(),
        })
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// The complete environment handed to a script. `lookup` reads host
    /// variables; only allow-listed names are consulted.
    pub fn environment(
        &self,
        mode: ExecMode,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Vec<(String, String)> {
        let (rootfs, environment) = match mode {
            ExecMode::Host => (
                self.rootfs.to_string_lossy().into_owned(),
                self.rootfs
                    .join(SCRIPT_ENVIRONMENT.trim_start_matches('/'))
                    .to_string_lossy()
                    .into_owned(),
            ),
            ExecMode::Chroot => ("/".to_owned(), SCRIPT_ENVIRONMENT.to_owned()),
        };
        let mut env = vec![
            ("PATH".to_owned(), SCRIPT_PATH.to_owned()),
            ("LANG".to_owned(), "C".to_owned()),
            ("HOME".to_owned(), "/root".to_owned()),
            ("SINGULARITY_ROOTFS".to_owned(), rootfs),
            ("SINGULARITY_ENVIRONMENT".to_owned(), environment),
        ];
        for name in &self.allowed_env {
            if env.iter().any(|(k, _)| k == name) {
                continue;
            }
            if let Some(value) = lookup(name) {
                env.push((name.clone(), value));
            }
        }
        env
    }

    /// Shell program run inside the new namespaces: mounts, then `exec` of
    /// the script.
    pub fn setup_script(&self, mode: ExecMode, argv: &[String]) -> String {
        let qr = shell_quote_path(&self.rootfs);
        let mut script = String::from("set -e\n");

        let _ = writeln!(script, "mount -t proc proc {qr}/proc 2>/dev/null || true");
        let _ = writeln!(script, "mount --rbind /sys {qr}/sys 2>/dev/null && mount --make-rslave {qr}/sys 2>/dev/null || true");
        let _ = writeln!(script, "mount --rbind /dev {qr}/dev 2>/dev/null && mount --make-rslave {qr}/dev 2>/dev/null || true");

        for name in ["resolv.conf", "hosts"] {
            let src = shell_quote_path(&self.session_dir.join(name));
            let dst = shell_quote_path(&self.rootfs.join("etc").join(name));
            let _ = writeln!(script, "mkdir -p {qr}/etc");
            let _ = writeln!(script, "if [ -L {dst} ]; then rm -f {dst}; fi; touch {dst}");
            let _ = writeln!(script, "mount --bind {src} {dst}");
            let _ = writeln!(script, "mount -o remount,ro,bind {dst}");
        }

        let quoted: Vec<String> = argv.iter().map(|a| shell_quote(a)).collect();
        match mode {
            ExecMode::Host => {
                let _ = writeln!(script, "cd {qr}");
                let _ = writeln!(script, "exec {}", quoted.join(" "));
            }
            ExecMode::Chroot => {
                let _ = writeln!(script, "exec chroot {qr} {}", quoted.join(" "));
            }
        }
        script
    }

    fn unshare_command() -> Command {
        let mut cmd = Command::new("unshare");
        if current_euid() != 0 {
            cmd.args(["--user", "--map-root-user"]);
        }
        cmd.args(["--mount", "--pid", "--fork", "--kill-child=SIGTERM"]);
        cmd
    }

    /// Run one build section's script in the sandbox.
    pub fn run(&self, section: &str, script: &Script, mode: ExecMode) -> Result<(), RuntimeError> {
        let file_name = format!(".kiln-{section}.script");
        let (host_path, script_arg) = match mode {
            ExecMode::Host => {
                let p = self.session_dir.join(&file_name);
                (p.clone(), p.to_string_lossy().into_owned())
            }
            ExecMode::Chroot => (self.rootfs.join(&file_name), format!("/{file_name}")),
        };
        fs::write(&host_path, &script.script)?;

        let mut argv = interpreter(script);
        argv.push(script_arg);
        let setup = self.setup_script(mode, &argv);

        let mut cmd = Self::unshare_command();
        cmd.arg("/bin/sh").arg("-c").arg(&setup);
        cmd.env_clear();
        cmd.envs(self.environment(mode, |k| std::env::var(k).ok()));

        info!("running %{section}");
        debug!("%{section} interpreter: {}", argv.join(" "));
        let result = cmd
            .status()
            .map_err(|e| RuntimeError::ExecFailed(format!("failed to start sandbox for %{section}: {e}")));
        let _ = fs::remove_file(&host_path);
        exit_status(section, result?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox(dir: &Path) -> (Bundle, ScriptSandbox) {
        let mut bundle = Bundle::new(dir, "sb-").unwrap();
        bundle.opts.allowed_env = vec!["HTTP_PROXY".to_owned(), "PATH".to_owned()];
        let sb = ScriptSandbox::new(&bundle).unwrap();
        (bundle, sb)
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("hello"), "'hello'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn session_files_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let (_bundle, sb) = sandbox(dir.path());
        assert!(sb.session_dir().join("resolv.conf").is_file());
        assert!(sb.session_dir().join("hosts").is_file());
    }

    #[test]
    fn environment_is_fixed_plus_allow_list() {
        let dir = tempfile::tempdir().unwrap();
        let (_bundle, sb) = sandbox(dir.path());
        let lookup = |k: &str| match k {
            "HTTP_PROXY" => Some("http://proxy:3128".to_owned()),
            "PATH" => Some("/home/user/bin".to_owned()),
            "AWS_SECRET_ACCESS_KEY" => Some("secret".to_owned()),
            _ => None,
        };
        let env = sb.environment(ExecMode::Chroot, lookup);
        let get = |k: &str| env.iter().find(|(n, _)| n == k).map(|(_, v)| v.as_str());
        assert_eq!(get("PATH"), Some(SCRIPT_PATH));
        assert_eq!(get("HTTP_PROXY"), Some("http://proxy:3128"));
        assert_eq!(get("SINGULARITY_ROOTFS"), Some("/"));
        assert_eq!(get("SINGULARITY_ENVIRONMENT"), Some(SCRIPT_ENVIRONMENT));
        assert_eq!(get("AWS_SECRET_ACCESS_KEY"), None);
    }

    #[test]
    fn host_mode_environment_points_into_rootfs() {
        let dir = tempfile::tempdir().unwrap();
        let (bundle, sb) = sandbox(dir.path());
        let env = sb.environment(ExecMode::Host, |_| None);
        let rootfs = bundle.rootfs().to_string_lossy().into_owned();
        assert!(env.contains(&("SINGULARITY_ROOTFS".to_owned(), rootfs)));
    }

    #[test]
    fn setup_script_binds_session_files_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let (_bundle, sb) = sandbox(dir.path());
        let argv = vec!["/bin/sh".to_owned(), "-e".to_owned(), "/.kiln-post.script".to_owned()];
        let script = sb.setup_script(ExecMode::Chroot, &argv);
        assert!(script.contains("mount -t proc"));
        assert_eq!(script.matches("remount,ro,bind").count(), 2);
        assert!(script.contains("resolv.conf"));
        assert!(script.contains("exec chroot "));
        assert!(script.trim_end().ends_with("'/bin/sh' '-e' '/.kiln-post.script'"));
    }

    #[test]
    fn host_mode_does_not_chroot() {
        let dir = tempfile::tempdir().unwrap();
        let (_bundle, sb) = sandbox(dir.path());
        let script = sb.setup_script(ExecMode::Host, &["/bin/sh".to_owned()]);
        assert!(!script.contains("chroot"));
        assert!(script.contains("\ncd '"));
    }

    #[test]
    fn interpreter_defaults_and_overrides() {
        assert_eq!(interpreter(&Script::new("true")), vec!["/bin/sh", "-e", "-x"]);
        let script = Script {
            args: "-c /bin/bash".to_owned(),
            script: "true".to_owned(),
        };
        assert_eq!(interpreter(&script), vec!["/bin/bash"]);
    }

    #[test]
    fn host_script_reports_exit_code() {
        run_host_script("pre", &Script::new("true")).unwrap();
        let err = run_host_script("pre", &Script::new("exit 3")).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::ScriptFailed { ref section, code: Some(3) } if section == "pre"
        ));
    }
}
