use kiln_bundle::Options;
use kiln_core::{Build, BuildRequest, CoreError};
use kiln_runtime::ImageFormat;
use kiln_schema::parse_all;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

fn sections(names: &[&str]) -> Options {
    Options {
        sections: names.iter().map(|s| (*s).to_owned()).collect(),
        ..Options::default()
    }
}

fn request(work: &Path, text: &str, dest: &str, opts: Options) -> BuildRequest {
    BuildRequest {
        definitions: parse_all(text).unwrap(),
        dest: work.join(dest),
        format: ImageFormat::Sandbox,
        opts,
        tmp_dir: work.join("tmp"),
        files_root: work.to_path_buf(),
    }
}

fn read_labels(image: &Path) -> BTreeMap<String, String> {
    let text = fs::read_to_string(image.join(".singularity.d/labels.json")).unwrap();
    serde_json::from_str(&text).unwrap()
}

fn leftover_bundles(work: &Path) -> usize {
    match fs::read_dir(work.join("tmp")) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("build-temp-"))
            .count(),
        Err(_) => 0,
    }
}

/// A sandbox with existing metadata, as a previous build would leave it.
fn base_sandbox(work: &Path) -> PathBuf {
    let base = work.join("base");
    fs::create_dir_all(base.join(".singularity.d")).unwrap();
    fs::create_dir_all(base.join("etc")).unwrap();
    fs::write(base.join("etc/os-release"), "ID=test\n").unwrap();
    fs::write(base.join(".singularity.d/labels.json"), r#"{"A":"1"}"#).unwrap();
    base
}

#[test]
fn scratch_build_writes_base_skeleton() {
    let work = tempfile::tempdir().unwrap();
    let req = request(work.path(), "Bootstrap: scratch\n", "image", sections(&["none"]));
    Build::new(req).unwrap().full().unwrap();

    let image = work.path().join("image");
    for path in [
        ".singularity.d/env/01-base.sh",
        ".singularity.d/runscript",
        ".singularity.d/Singularity",
        "etc/hosts",
        "etc/resolv.conf",
    ] {
        assert!(image.join(path).exists(), "missing {path}");
    }
    assert!(fs::symlink_metadata(image.join("singularity"))
        .unwrap()
        .file_type()
        .is_symlink());
    assert_eq!(leftover_bundles(work.path()), 0);
}

#[test]
fn localimage_sandbox_keeps_existing_labels() {
    let work = tempfile::tempdir().unwrap();
    let base = base_sandbox(work.path());
    let text = format!("Bootstrap: localimage\nFrom: {}\n%labels\nA 2\nB 3\n", base.display());
    let req = request(work.path(), &text, "image", sections(&["labels"]));
    Build::new(req).unwrap().full().unwrap();

    let image = work.path().join("image");
    assert_eq!(fs::read_to_string(image.join("etc/os-release")).unwrap(), "ID=test\n");
    let labels = read_labels(&image);
    assert_eq!(labels.get("A").map(String::as_str), Some("1"));
    assert_eq!(labels.get("B").map(String::as_str), Some("3"));
    assert_eq!(
        labels
            .get("org.label-schema.usage.singularity.deffile.bootstrap")
            .map(String::as_str),
        Some("localimage")
    );
}

#[test]
fn localimage_labels_overwritten_with_force() {
    let work = tempfile::tempdir().unwrap();
    let base = base_sandbox(work.path());
    let text = format!("Bootstrap: localimage\nFrom: {}\n%labels\nA 2\n", base.display());
    let mut opts = sections(&["labels"]);
    opts.force = true;
    let req = request(work.path(), &text, "image", opts);
    Build::new(req).unwrap().full().unwrap();
    let labels = read_labels(&work.path().join("image"));
    assert_eq!(labels.get("A").map(String::as_str), Some("2"));
}

#[test]
fn multi_stage_copies_between_stages() {
    let work = tempfile::tempdir().unwrap();
    fs::write(work.path().join("tool"), "built tool").unwrap();
    let text = "\
Bootstrap: scratch
Stage: build

%files
tool /out/tool

Bootstrap: scratch
Stage: final

%files from build
/out/tool /usr/local/bin/tool
";
    let req = request(work.path(), text, "image", sections(&["files"]));
    let summary = Build::new(req).unwrap().full().unwrap();
    assert_eq!(summary.stages, vec!["build".to_owned(), "final".to_owned()]);

    let image = work.path().join("image");
    assert_eq!(
        fs::read_to_string(image.join("usr/local/bin/tool")).unwrap(),
        "built tool"
    );
    assert!(!image.join("out").exists());
    assert_eq!(leftover_bundles(work.path()), 0);
}

#[test]
fn missing_stage_fails_before_any_bundle_exists() {
    let work = tempfile::tempdir().unwrap();
    let text = "\
Bootstrap: scratch
Stage: build

Bootstrap: scratch
%files from devel
/out/tool /tool
";
    let req = request(work.path(), text, "image", sections(&["files"]));
    let err = Build::new(req).unwrap_err();
    assert!(matches!(err, CoreError::StageNotFound { ref stage, .. } if stage == "devel"));
    assert!(err.is_validation());
    assert_eq!(leftover_bundles(work.path()), 0);
    assert!(!work.path().join("image").exists());
}

#[test]
fn headerless_stage_in_multi_stage_file_is_rejected() {
    let work = tempfile::tempdir().unwrap();
    let mut definitions = parse_all("Bootstrap: scratch\n").unwrap();
    definitions.push(kiln_schema::parse_definition("%post\ntrue\n").unwrap());
    let req = BuildRequest {
        definitions,
        ..request(work.path(), "Bootstrap: scratch\n", "image", sections(&["none"]))
    };
    assert!(matches!(Build::new(req).unwrap_err(), CoreError::Validation(_)));
}

#[test]
fn apps_are_materialized_into_image() {
    let work = tempfile::tempdir().unwrap();
    let text = "\
Bootstrap: scratch

%apprun foo
exec foo \"$@\"

%applabels foo
Maintainer alice

%appinstall bar
make install
";
    let req = request(work.path(), text, "image", sections(&["none"]));
    Build::new(req).unwrap().full().unwrap();

    let image = work.path().join("image");
    assert!(image.join("scif/apps/foo/scif/runscript").is_file());
    assert!(image.join("scif/apps/bar/bin").is_dir());
    assert!(image.join("scif/data/bar/output").is_dir());

    let global = fs::read_to_string(image.join(".singularity.d/env/94-appsbase.sh")).unwrap();
    assert!(global.contains("SCIF_APPRUN_foo="));
    assert!(!global.contains("SCIF_APPRUN_bar="));

    let labels: BTreeMap<String, String> = serde_json::from_str(
        &fs::read_to_string(image.join("scif/apps/foo/scif/labels.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(labels.get("Maintainer").map(String::as_str), Some("alice"));
    assert_eq!(labels.get("SCIF_APP_NAME").map(String::as_str), Some("foo"));
}

#[test]
fn tar_format_writes_archive() {
    let work = tempfile::tempdir().unwrap();
    let mut req = request(
        work.path(),
        "Bootstrap: scratch\n%runscript\nexec /bin/true\n",
        "image.tar",
        sections(&["runscript"]),
    );
    req.format = ImageFormat::Tar;
    let summary = Build::new(req).unwrap().full().unwrap();
    assert_eq!(summary.format, "tar");

    let mut archive = tar::Archive::new(fs::File::open(work.path().join("image.tar")).unwrap());
    let names: Vec<String> = archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect();
    assert!(names.iter().any(|n| n.ends_with(".singularity.d/runscript")));
}

#[test]
fn update_rebuilds_existing_sandbox_and_rotates_definition() {
    let work = tempfile::tempdir().unwrap();
    let req = request(work.path(), "Bootstrap: scratch\n%labels\nA 1\n", "image", sections(&["labels"]));
    Build::new(req).unwrap().full().unwrap();
    let image = work.path().join("image");
    fs::write(image.join("marker"), "from first build").unwrap();

    let mut opts = sections(&["labels"]);
    opts.update = true;
    let req = request(work.path(), "Bootstrap: scratch\n%labels\nB 2\n", "image", opts);
    Build::new(req).unwrap().full().unwrap();

    assert_eq!(fs::read_to_string(image.join("marker")).unwrap(), "from first build");
    let labels = read_labels(&image);
    assert_eq!(labels.get("A").map(String::as_str), Some("1"));
    assert_eq!(labels.get("B").map(String::as_str), Some("2"));
    assert!(image
        .join(".singularity.d/bootstrap_history/Singularity0")
        .is_file());
}

#[test]
fn update_without_force_restamps_build_labels() {
    let work = tempfile::tempdir().unwrap();
    let req = request(work.path(), "Bootstrap: scratch\n%labels\nA 1\n", "image", sections(&["labels"]));
    Build::new(req).unwrap().full().unwrap();
    let image = work.path().join("image");

    let mut stale = read_labels(&image);
    stale.insert(
        "org.label-schema.build-date".to_owned(),
        "2001-01-01T00:00:00Z".to_owned(),
    );
    stale.insert(
        "org.label-schema.usage.kiln.version".to_owned(),
        "0.0.0".to_owned(),
    );
    fs::write(
        image.join(".singularity.d/labels.json"),
        serde_json::to_string(&stale).unwrap(),
    )
    .unwrap();

    let mut opts = sections(&["labels"]);
    opts.update = true;
    let req = request(work.path(), "Bootstrap: scratch\n%labels\nA 2\n", "image", opts);
    Build::new(req).unwrap().full().unwrap();

    let labels = read_labels(&image);
    assert_ne!(
        labels.get("org.label-schema.build-date").map(String::as_str),
        Some("2001-01-01T00:00:00Z")
    );
    assert_eq!(
        labels.get("org.label-schema.usage.kiln.version").map(String::as_str),
        Some(env!("CARGO_PKG_VERSION"))
    );
    assert_eq!(labels.get("A").map(String::as_str), Some("1"));
}
