use crate::apps::Apps;
use crate::concurrency::{clear_cleanup_hooks, register_cleanup_hook, shutdown_requested};
use crate::lifecycle::{validate_transition, StageState};
use crate::metadata::insert_metadata;
use crate::CoreError;
use kiln_bundle::{Bundle, Options};
use kiln_runtime::{
    copy_path, copy_tree, run_host_script, unmount, ConveyorPacker, ExecMode, ScriptSandbox,
};
use kiln_schema::{Definition, FilesSection, Script};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One definition's worth of build state: its conveyor and its bundle.
pub struct Stage {
    conveyor: Box<dyn ConveyorPacker>,
    bundle: Bundle,
    state: StageState,
    update_from: Option<PathBuf>,
    sandbox: Option<ScriptSandbox>,
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name())
            .field("conveyor", &self.conveyor.name())
            .field("bundle", &self.bundle.path())
            .field("state", &self.state)
            .finish()
    }
}

impl Stage {
    /// Create the stage's bundle under `tmp_dir`.
    pub fn new(
        definition: Definition,
        opts: Options,
        conveyor: Box<dyn ConveyorPacker>,
        tmp_dir: &Path,
    ) -> Result<Self, CoreError> {
        let mut bundle = Bundle::new(tmp_dir, "build-temp-")?;
        bundle.recipe = definition;
        bundle.opts = opts;
        debug!(
            "stage {} uses bootstrap '{}' in {}",
            bundle.recipe.stage_name().unwrap_or("-"),
            conveyor.name(),
            bundle.path().display()
        );
        Ok(Self {
            conveyor,
            bundle,
            state: StageState::Created,
            update_from: None,
            sandbox: None,
        })
    }

    /// Seed the rootfs from an existing sandbox instead of the conveyor.
    pub fn update_from(&mut self, sandbox: PathBuf) {
        self.update_from = Some(sandbox);
    }

    pub fn name(&self) -> Option<&str> {
        self.bundle.recipe.stage_name()
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn bundle(&self) -> &Bundle {
        &self.bundle
    }

    pub fn bundle_mut(&mut self) -> &mut Bundle {
        &mut self.bundle
    }

    pub fn rootfs(&self) -> PathBuf {
        self.bundle.rootfs()
    }

    pub fn advance(&mut self, to: StageState) -> Result<(), CoreError> {
        validate_transition(self.state, to)?;
        debug!("stage {}: {} -> {to}", self.label(), self.state);
        self.state = to;
        Ok(())
    }

    fn label(&self) -> &str {
        self.name().unwrap_or("(unnamed)")
    }

    fn checkpoint(&self) -> Result<(), CoreError> {
        if shutdown_requested() {
            return Err(CoreError::Interrupted);
        }
        Ok(())
    }

    fn run_script(&mut self, section: &str, script: &Script, mode: ExecMode) -> Result<(), CoreError> {
        let sandbox = match self.sandbox.take() {
            Some(sandbox) => sandbox,
            None => ScriptSandbox::new(&self.bundle)?,
        };
        let sandbox = self.sandbox.insert(sandbox);
        sandbox.run(section, script, mode)?;
        Ok(())
    }

    /// Run every phase up to and including `%test`.
    ///
    /// `prior` holds the finished stages this one may copy from; relative
    /// host paths in `%files` and `%appfiles` resolve against `files_root`.
    pub fn run(&mut self, prior: &[Stage], files_root: &Path) -> Result<(), CoreError> {
        info!("starting stage {}", self.label());

        let pre = self.bundle.recipe.build_data.scripts.pre.clone();
        if self.bundle.run_section("pre") && !pre.is_empty() {
            run_host_script("pre", &pre)?;
        }
        self.checkpoint()?;

        match self.update_from.clone() {
            Some(existing) => {
                info!("updating existing sandbox {}", existing.display());
                copy_tree(&existing, &self.bundle.rootfs())?;
            }
            None => {
                let fetched = self.conveyor.get(&mut self.bundle);
                self.register_mounts();
                fetched?;
            }
        }
        self.advance(StageState::Fetched)?;
        self.checkpoint()?;

        self.conveyor.pack(&mut self.bundle)?;
        self.advance(StageState::Packed)?;

        let apps = Apps::from_definition(&self.bundle.recipe);
        apps.materialize(self.bundle.layout(), files_root)?;
        self.advance(StageState::AppsMaterialized)?;
        self.checkpoint()?;

        let groups = self.bundle.recipe.build_data.files.clone();
        if self.bundle.run_section("files") {
            for group in groups.iter().filter(|g| g.source_stage().is_some()) {
                self.copy_from_stage(group, prior)?;
            }
        }
        self.advance(StageState::FilesFromStages)?;

        let setup = self.bundle.recipe.build_data.scripts.setup.clone();
        if self.bundle.run_section("setup") && !setup.is_empty() {
            self.run_script("setup", &setup, ExecMode::Host)?;
        }
        self.advance(StageState::SetupRun)?;
        self.checkpoint()?;

        if self.bundle.run_section("files") {
            for group in groups.iter().filter(|g| g.source_stage().is_none()) {
                copy_group(group, &self.bundle, |src| {
                    let path = Path::new(src);
                    if path.is_absolute() {
                        path.to_path_buf()
                    } else {
                        files_root.join(path)
                    }
                })?;
            }
        }
        self.advance(StageState::FilesFromHost)?;

        let mut post = self.bundle.recipe.build_data.scripts.post.clone();
        let installs = apps.install_script();
        if !installs.is_empty() {
            post.script.push_str(&installs);
        }
        if self.bundle.run_section("post") && !post.is_empty() {
            self.run_script("post", &post, ExecMode::Chroot)?;
        }
        self.advance(StageState::PostRun)?;
        self.checkpoint()?;

        insert_metadata(&self.bundle)?;
        self.advance(StageState::MetadataInserted)?;

        let test = self.bundle.recipe.build_data.scripts.test.clone();
        if !self.bundle.opts.no_test && self.bundle.run_section("test") && !test.is_empty() {
            self.run_script("test", &test, ExecMode::Chroot)?;
        }
        self.advance(StageState::Tested)?;
        Ok(())
    }

    fn copy_from_stage(&self, group: &FilesSection, prior: &[Stage]) -> Result<(), CoreError> {
        let wanted = group.source_stage().unwrap_or_default();
        let source = prior
            .iter()
            .find(|s| s.name() == Some(wanted))
            .ok_or_else(|| CoreError::StageNotFound {
                stage: wanted.to_owned(),
                referenced_by: self.label().to_owned(),
            })?;
        info!("copying files from stage {wanted}");
        let layout = source.bundle().layout();
        copy_group(group, &self.bundle, |src| layout.in_rootfs(src))
    }

    /// Hand mounts held by the conveyor to the interrupt handler, which
    /// releases them before it deletes the bundle.
    fn register_mounts(&self) {
        for mnt in self.conveyor.mount_points() {
            debug!("registering {} for interrupt cleanup", mnt.display());
            register_cleanup_hook(
                self.bundle.path(),
                Box::new(move || {
                    if let Err(e) = unmount(&mnt) {
                        warn!("failed to release {}: {e}", mnt.display());
                    }
                }),
            );
        }
    }

    /// Release conveyor resources. Failures are logged only.
    pub fn clean_up(&mut self) {
        if let Err(e) = self.conveyor.clean_up() {
            warn!("cleanup of {} conveyor failed: {e}", self.conveyor.name());
        }
        clear_cleanup_hooks(self.bundle.path());
    }
}

/// Copy one `%files` group into the bundle rootfs. Sources are glob patterns;
/// several matches are copied into `dst` as a directory.
fn copy_group(
    group: &FilesSection,
    bundle: &Bundle,
    resolve: impl Fn(&str) -> PathBuf,
) -> Result<(), CoreError> {
    for file in &group.files {
        let src = resolve(&file.src);
        let dst = bundle.layout().in_rootfs(&file.dst);
        let matches = expand(&src)?;
        if matches.is_empty() {
            return Err(CoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no files match {}", src.display()),
            )));
        }
        if matches.len() > 1 || file.dst.ends_with('/') {
            fs::create_dir_all(&dst)?;
        }
        for path in matches {
            debug!("copying {} -> {}", path.display(), dst.display());
            copy_path(&path, &dst)?;
        }
    }
    Ok(())
}

fn expand(pattern: &Path) -> Result<Vec<PathBuf>, CoreError> {
    let text = pattern.to_string_lossy();
    let paths = glob::glob(&text)
        .map_err(|e| CoreError::Validation(format!("invalid file pattern '{text}': {e}")))?;
    let mut out = Vec::new();
    for path in paths {
        out.push(path.map_err(glob::GlobError::into_error)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_runtime::select_conveyor_packer;
    use kiln_schema::parse_definition;

    fn stage(tmp: &Path, text: &str, sections: &[&str]) -> Stage {
        let def = parse_definition(text).unwrap();
        let conveyor = select_conveyor_packer(def.bootstrap().unwrap_or("scratch")).unwrap();
        let opts = Options {
            sections: sections.iter().map(|s| (*s).to_owned()).collect(),
            ..Options::default()
        };
        Stage::new(def, opts, conveyor, tmp).unwrap()
    }

    #[test]
    fn scratch_stage_reaches_tested() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = stage(dir.path(), "Bootstrap: scratch\nStage: one\n", &["none"]);
        s.run(&[], dir.path()).unwrap();
        assert_eq!(s.state(), StageState::Tested);
        assert_eq!(s.name(), Some("one"));
        assert!(s.bundle().layout().labels_file().is_file());
    }

    #[test]
    fn host_files_are_copied() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::write(dir.path().join("b.txt"), "b").unwrap();
        let mut s = stage(
            dir.path(),
            "Bootstrap: scratch\n%files\na.txt /opt/a.txt\n*.txt /data\n",
            &["files"],
        );
        s.run(&[], dir.path()).unwrap();
        let rootfs = s.rootfs();
        assert_eq!(fs::read_to_string(rootfs.join("opt/a.txt")).unwrap(), "a");
        assert!(rootfs.join("data/a.txt").is_file());
        assert!(rootfs.join("data/b.txt").is_file());
    }

    #[test]
    fn file_destination_stays_inside_rootfs() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        let tmp = dir.path().join("tmp");
        let mut s = stage(
            &tmp,
            "Bootstrap: scratch\n%files\na.txt ../../../escaped.txt\n",
            &["files"],
        );
        s.run(&[], dir.path()).unwrap();
        assert_eq!(fs::read_to_string(s.rootfs().join("escaped.txt")).unwrap(), "a");
        assert!(!tmp.join("escaped.txt").exists());
        assert!(!dir.path().join("escaped.txt").exists());
    }

    #[test]
    fn missing_host_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = stage(dir.path(), "Bootstrap: scratch\n%files\nnope.txt\n", &["files"]);
        assert!(s.run(&[], dir.path()).is_err());
    }

    #[test]
    fn files_from_prior_stage() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = stage(dir.path(), "Bootstrap: scratch\nStage: devel\n", &["none"]);
        first.run(&[], dir.path()).unwrap();
        fs::create_dir_all(first.rootfs().join("out")).unwrap();
        fs::write(first.rootfs().join("out/bin"), "binary").unwrap();

        let mut second = stage(
            dir.path(),
            "Bootstrap: scratch\nStage: final\n%files from devel\n/out/bin /usr/bin/tool\n",
            &["files"],
        );
        second.run(std::slice::from_ref(&first), dir.path()).unwrap();
        assert_eq!(
            fs::read_to_string(second.rootfs().join("usr/bin/tool")).unwrap(),
            "binary"
        );
    }

    #[test]
    fn unknown_source_stage_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = stage(
            dir.path(),
            "Bootstrap: scratch\n%files from ghost\n/x /x\n",
            &["files"],
        );
        let err = s.run(&[], dir.path()).unwrap_err();
        assert!(matches!(err, CoreError::StageNotFound { ref stage, .. } if stage == "ghost"));
    }

    #[test]
    fn update_seeds_rootfs_from_existing_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("existing");
        fs::create_dir_all(existing.join("etc")).unwrap();
        fs::write(existing.join("etc/marker"), "kept").unwrap();
        let mut s = stage(dir.path(), "Bootstrap: scratch\n", &["none"]);
        s.update_from(existing);
        s.run(&[], dir.path()).unwrap();
        assert_eq!(fs::read_to_string(s.rootfs().join("etc/marker")).unwrap(), "kept");
    }

    #[test]
    fn advance_rejects_backwards_moves() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = stage(dir.path(), "Bootstrap: scratch\n", &["none"]);
        s.advance(StageState::Packed).unwrap();
        assert!(s.advance(StageState::Fetched).is_err());
    }
}
