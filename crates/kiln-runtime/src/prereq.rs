use crate::assemble::ImageFormat;
use crate::bootstrap::BootstrapTool;
use std::fmt;
use std::process::Command;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn require(missing: &mut Vec<MissingPrereq>, prereq: MissingPrereq) {
    if !command_exists(prereq.name) {
        missing.push(prereq);
    }
}

const UNSHARE: MissingPrereq = MissingPrereq {
    name: "unshare",
    purpose: "namespaces for build scripts",
    install_hint: "part of util-linux (usually pre-installed)",
};

const CHROOT: MissingPrereq = MissingPrereq {
    name: "chroot",
    purpose: "running %post and %test inside the image",
    install_hint: "part of coreutils (usually pre-installed)",
};

const CURL: MissingPrereq = MissingPrereq {
    name: "curl",
    purpose: "downloading base images",
    install_hint: "zypper install curl | apt install curl | dnf install curl | pacman -S curl",
};

const SKOPEO: MissingPrereq = MissingPrereq {
    name: "skopeo",
    purpose: "fetching OCI and Docker images",
    install_hint: "zypper install skopeo | apt install skopeo | dnf install skopeo | pacman -S skopeo",
};

const UMOCI: MissingPrereq = MissingPrereq {
    name: "umoci",
    purpose: "unpacking OCI image layers",
    install_hint: "zypper install umoci | apt install umoci | dnf install umoci | pacman -S umoci",
};

const UNSQUASHFS: MissingPrereq = MissingPrereq {
    name: "unsquashfs",
    purpose: "unpacking squashfs base images",
    install_hint: "install squashfs-tools",
};

const MKSQUASHFS: MissingPrereq = MissingPrereq {
    name: "mksquashfs",
    purpose: "writing squashfs images",
    install_hint: "install squashfs-tools",
};

/// Check the host tools a build with the given bootstrap needs.
/// Returns a list of missing items. Empty list means all prerequisites are met.
pub fn check_build_prereqs(bootstrap: &str) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();
    require(&mut missing, UNSHARE);
    require(&mut missing, CHROOT);

    match bootstrap.trim().to_ascii_lowercase().as_str() {
        "docker" | "docker-archive" | "docker-daemon" | "oci" | "oci-archive" => {
            require(&mut missing, SKOPEO);
            require(&mut missing, UMOCI);
        }
        "library" | "shub" => {
            require(&mut missing, CURL);
            require(&mut missing, UNSQUASHFS);
        }
        "localimage" => require(&mut missing, UNSQUASHFS),
        "debootstrap" => require(&mut missing, tool_prereq(BootstrapTool::Debootstrap)),
        "yum" => require(&mut missing, tool_prereq(BootstrapTool::Yum)),
        "zypper" => require(&mut missing, tool_prereq(BootstrapTool::Zypper)),
        "arch" => require(&mut missing, tool_prereq(BootstrapTool::Arch)),
        "busybox" => require(&mut missing, CURL),
        _ => {}
    }
    missing
}

fn tool_prereq(tool: BootstrapTool) -> MissingPrereq {
    let (purpose, install_hint) = match tool {
        BootstrapTool::Debootstrap => ("Debian/Ubuntu bootstrap", "apt install debootstrap | dnf install debootstrap"),
        BootstrapTool::Yum => ("RPM bootstrap", "dnf install yum | apt install yum"),
        BootstrapTool::Zypper => ("openSUSE bootstrap", "zypper is only available on SUSE hosts"),
        BootstrapTool::Arch => ("Arch Linux bootstrap", "pacman -S arch-install-scripts"),
        BootstrapTool::Busybox => ("downloading busybox", CURL.install_hint),
    };
    MissingPrereq {
        name: tool.program(),
        purpose,
        install_hint,
    }
}

/// Check the host tools an output format needs.
pub fn check_assembler_prereqs(format: ImageFormat) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();
    if format == ImageFormat::Squashfs {
        require(&mut missing, MKSQUASHFS);
    }
    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nKiln requires these tools to build images.");
    msg
}
