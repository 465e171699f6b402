use super::{colorize_status, EXIT_FAILURE, EXIT_SUCCESS};
use kiln_core::BuildConfig;
use kiln_runtime::{
    check_assembler_prereqs, check_build_prereqs, check_exec_allowed, format_missing,
    registered_bootstraps, ImageFormat,
};
use std::path::Path;

pub fn run(bootstrap: Option<&str>, json_output: bool) -> Result<u8, String> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    let config = match BuildConfig::load_default() {
        Ok(config) => {
            checks.push(Check::pass("config", "Build configuration readable"));
            config
        }
        Err(e) => {
            all_pass = false;
            checks.push(Check::fail("config", &format!("Build configuration: {e}")));
            BuildConfig::default()
        }
    }
    .with_env(|k| std::env::var(k).ok());

    check_prereqs(&mut checks, &mut all_pass, bootstrap);
    check_assembler(&mut checks);

    let tmp_dir = config.tmp_dir();
    check_tmp_dir(&tmp_dir, &mut checks, &mut all_pass);
    check_disk_space(&tmp_dir, &mut checks);

    match config.cache_dir() {
        Some(dir) => checks.push(Check::info(
            "image_cache",
            &format!("Image cache at {}", dir.display()),
        )),
        None => checks.push(Check::info(
            "image_cache",
            "Image cache disabled (docker, oci, library and shub builds will fail)",
        )),
    }

    print_results(&checks, all_pass, json_output)
}

fn check_prereqs(checks: &mut Vec<Check>, all_pass: &mut bool, bootstrap: Option<&str>) {
    let keyword = bootstrap.unwrap_or("scratch");
    if !registered_bootstraps().any(|b| b.eq_ignore_ascii_case(keyword.trim())) {
        *all_pass = false;
        checks.push(Check::fail(
            "build_prereqs",
            &format!("Unknown bootstrap '{keyword}'"),
        ));
        return;
    }
    let missing = check_build_prereqs(keyword);
    if missing.is_empty() {
        checks.push(Check::pass(
            "build_prereqs",
            &format!("Build prerequisites for '{keyword}' satisfied"),
        ));
    } else {
        *all_pass = false;
        checks.push(Check::fail(
            "build_prereqs",
            &format!(
                "Missing prerequisites: {}",
                format_missing(&missing)
            ),
        ));
    }
}

fn check_assembler(checks: &mut Vec<Check>) {
    if check_assembler_prereqs(ImageFormat::Squashfs).is_empty() {
        checks.push(Check::pass("squashfs", "mksquashfs available"));
    } else {
        checks.push(Check::warn(
            "squashfs",
            "mksquashfs not found; only sandbox and tar images can be written",
        ));
    }
}

fn check_tmp_dir(tmp_dir: &Path, checks: &mut Vec<Check>, all_pass: &mut bool) {
    match check_exec_allowed(tmp_dir) {
        Ok(flags) if flags.nodev => checks.push(Check::warn(
            "tmp_dir",
            &format!("{} is mounted nodev; device files in images will not work", tmp_dir.display()),
        )),
        Ok(_) => checks.push(Check::pass(
            "tmp_dir",
            &format!("Build directory {} allows execution", tmp_dir.display()),
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail("tmp_dir", &e.to_string()));
        }
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, String> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&json).map_err(|e| e.to_string())?
        );
    } else {
        println!("Kiln Doctor\n");
        for check in checks {
            let icon = match check.status.as_str() {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} [{}] {}", colorize_status(&check.status), check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: String,
    status: String,
    message: String,
}

impl Check {
    fn new(name: &str, status: &str, message: &str) -> Self {
        Self {
            name: name.to_owned(),
            status: status.to_owned(),
            message: message.to_owned(),
        }
    }

    fn pass(name: &str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}

fn check_disk_space(path: &Path, checks: &mut Vec<Check>) {
    let Ok(c_path) = std::ffi::CString::new(path.to_string_lossy().as_bytes()) else {
        return;
    };

    // SAFETY: zeroed statvfs is a valid initial state for the struct.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: statvfs with a valid, NUL-terminated path and a properly
    // zeroed output struct is well-defined. The struct is only read after
    // the call succeeds.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &raw mut stat) };
    if ret != 0 {
        return;
    }

    #[allow(clippy::unnecessary_cast)]
    let avail_mb = (stat.f_bavail as u64 * stat.f_frsize as u64) / (1024 * 1024);

    if avail_mb < 1024 {
        checks.push(Check::warn(
            "disk_space",
            &format!("Low space for builds: {avail_mb} MB available in {}", path.display()),
        ));
    } else {
        checks.push(Check::pass(
            "disk_space",
            &format!("Disk space: {} GB available for builds", avail_mb / 1024),
        ));
    }
}
