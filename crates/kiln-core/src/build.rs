use crate::concurrency::{
    install_signal_handler, register_cleanup, unregister_cleanup, BuildLock, UmaskGuard,
};
use crate::lifecycle::StageState;
use crate::stage::Stage;
use crate::CoreError;
use kiln_bundle::Options;
use kiln_runtime::{
    check_exec_allowed, select_assembler, select_conveyor_packer, Assembler, ConveyorPacker,
    ImageFormat, RuntimeError,
};
use kiln_schema::Definition;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Everything needed to start a build.
#[derive(Debug)]
pub struct BuildRequest {
    /// One definition per stage, in build order. The last one is assembled.
    pub definitions: Vec<Definition>,
    pub dest: PathBuf,
    pub format: ImageFormat,
    pub opts: Options,
    /// Parent directory for stage bundles.
    pub tmp_dir: PathBuf,
    /// Base for relative host paths in `%files`.
    pub files_root: PathBuf,
}

/// What a finished build produced.
#[derive(Debug, Clone, Serialize)]
pub struct BuildSummary {
    pub destination: PathBuf,
    pub format: String,
    pub stages: Vec<String>,
    /// Bundles left on disk because cleanup was disabled.
    pub kept_bundles: Vec<PathBuf>,
}

struct StagePlan {
    definition: Definition,
    conveyor: Box<dyn ConveyorPacker>,
}

/// A validated, locked build, ready to run.
///
/// Construction performs every check that can fail without touching the
/// filesystem; [`full`](Self::full) runs the stages and assembles.
pub struct Build {
    plans: Vec<StagePlan>,
    assembler: Box<dyn Assembler>,
    dest: PathBuf,
    opts: Options,
    tmp_dir: PathBuf,
    files_root: PathBuf,
    _lock: BuildLock,
}

impl std::fmt::Debug for Build {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Build")
            .field("stages", &self.plans.len())
            .field("assembler", &self.assembler.name())
            .field("dest", &self.dest)
            .finish_non_exhaustive()
    }
}

fn stage_label(def: &Definition, index: usize) -> String {
    def.stage_name()
        .map_or_else(|| format!("stage {}", index + 1), str::to_owned)
}

impl Build {
    pub fn new(req: BuildRequest) -> Result<Self, CoreError> {
        let BuildRequest {
            definitions,
            dest,
            format,
            opts,
            tmp_dir,
            files_root,
        } = req;

        if definitions.is_empty() {
            return Err(CoreError::Validation("no definitions to build".to_owned()));
        }
        opts.validate()?;

        if definitions.len() > 1 {
            if let Some(i) = definitions.iter().position(|d| d.header.is_empty()) {
                return Err(CoreError::Validation(format!(
                    "stage {} has no header; every stage of a multi-stage build needs one",
                    i + 1
                )));
            }
        }

        let mut plans = Vec::with_capacity(definitions.len());
        let mut seen: HashSet<String> = HashSet::new();
        for (i, definition) in definitions.into_iter().enumerate() {
            let label = stage_label(&definition, i);
            let bootstrap = definition.bootstrap().ok_or_else(|| {
                CoreError::Validation(format!("{label}: missing 'bootstrap' header"))
            })?;
            let conveyor = select_conveyor_packer(bootstrap)?;
            if conveyor.requires_cache() && opts.image_cache.is_none() {
                return Err(RuntimeError::CacheRequired(bootstrap.to_owned()).into());
            }
            for group in &definition.build_data.files {
                if let Some(source) = group.source_stage() {
                    if !seen.contains(source) {
                        return Err(CoreError::StageNotFound {
                            stage: source.to_owned(),
                            referenced_by: label,
                        });
                    }
                }
            }
            if let Some(name) = definition.stage_name() {
                seen.insert(name.to_owned());
            }
            plans.push(StagePlan {
                definition,
                conveyor,
            });
        }

        let assembler = select_assembler(format, opts.force || opts.update);
        if opts.encryption_key.is_some() && !assembler.supports_encryption() {
            return Err(RuntimeError::EncryptionUnsupported(assembler.name().to_owned()).into());
        }

        if opts.update {
            if format != ImageFormat::Sandbox || !dest.is_dir() {
                return Err(CoreError::Validation(format!(
                    "--update needs an existing sandbox directory at {}",
                    dest.display()
                )));
            }
        } else if !opts.force && std::fs::symlink_metadata(&dest).is_ok() {
            return Err(RuntimeError::DestinationExists(dest.clone()).into());
        }

        check_exec_allowed(&tmp_dir)?;
        check_exec_allowed(&dest)?;

        let lock_path = BuildLock::path_for(&tmp_dir, &dest);
        let lock = BuildLock::try_acquire(&lock_path)?.ok_or_else(|| {
            CoreError::Validation(format!("another build is writing {}", dest.display()))
        })?;

        debug!("build validated: {} stage(s) -> {}", plans.len(), dest.display());
        Ok(Self {
            plans,
            assembler,
            dest,
            opts,
            tmp_dir,
            files_root,
            _lock: lock,
        })
    }

    /// Run every stage in order, assemble the last one, then clean up.
    ///
    /// Cleanup runs on success and failure alike; its errors are logged and
    /// never replace the build result.
    pub fn full(self) -> Result<BuildSummary, CoreError> {
        let _umask = UmaskGuard::set(0o022);
        install_signal_handler();

        let Self {
            plans,
            assembler,
            dest,
            opts,
            tmp_dir,
            files_root,
            _lock,
        } = self;

        let mut stages: Vec<Stage> = Vec::with_capacity(plans.len());
        let result = run_stages(
            plans,
            &mut stages,
            assembler.as_ref(),
            &dest,
            &opts,
            &tmp_dir,
            &files_root,
        );

        for stage in &mut stages {
            stage.clean_up();
        }
        let kept_bundles = remove_bundles(&mut stages, opts.no_cleanup);

        result?;
        info!("build complete: {}", dest.display());
        Ok(BuildSummary {
            destination: dest,
            format: assembler.name().to_owned(),
            stages: stages
                .iter()
                .enumerate()
                .map(|(i, s)| s.name().map_or_else(|| format!("stage {}", i + 1), str::to_owned))
                .collect(),
            kept_bundles,
        })
    }
}

fn run_stages(
    plans: Vec<StagePlan>,
    stages: &mut Vec<Stage>,
    assembler: &dyn Assembler,
    dest: &Path,
    opts: &Options,
    tmp_dir: &Path,
    files_root: &Path,
) -> Result<(), CoreError> {
    let count = plans.len();
    for (i, plan) in plans.into_iter().enumerate() {
        let mut stage = Stage::new(plan.definition, opts.clone(), plan.conveyor, tmp_dir)?;
        register_cleanup(stage.bundle().path());
        if opts.update && i + 1 == count {
            stage.update_from(dest.to_path_buf());
        }
        stages.push(stage);

        let (prior, current) = stages.split_at_mut(i);
        let Some(stage) = current.first_mut() else {
            return Err(CoreError::Validation("stage list out of order".to_owned()));
        };
        stage.run(prior, files_root)?;
    }

    let Some(last) = stages.last_mut() else {
        return Err(CoreError::Validation("no stages were run".to_owned()));
    };
    info!("assembling {} image at {}", assembler.name(), dest.display());
    assembler.assemble(last.bundle(), dest)?;
    last.advance(StageState::Assembled)?;
    Ok(())
}

fn remove_bundles(stages: &mut [Stage], keep: bool) -> Vec<PathBuf> {
    let mut kept = Vec::new();
    for stage in stages {
        let path = stage.bundle().path().to_path_buf();
        unregister_cleanup(&path);
        if keep {
            info!("keeping build directory {}", path.display());
            kept.push(path);
            continue;
        }
        if let Err(e) = stage.bundle_mut().remove() {
            warn!("failed to remove {}: {e}", path.display());
        }
    }
    kept
}
