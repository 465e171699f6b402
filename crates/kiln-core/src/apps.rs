use crate::CoreError;
use kiln_bundle::{confine, write_atomic, BundleLayout};
use kiln_runtime::copy_path;
use kiln_schema::{parse_file_lines, parse_label_lines, AppName, AppSectionKind, Definition, FileTransport};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

/// Label every app's `labels.json` carries with the app's own name.
pub const APP_NAME_LABEL: &str = "SCIF_APP_NAME";

/// One SCI-F app: everything the `%app*` sections declared for a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct App {
    pub name: AppName,
    pub install: String,
    pub files: Vec<FileTransport>,
    pub env: String,
    pub test: String,
    pub help: String,
    pub run: String,
    pub start: String,
    pub labels: BTreeMap<String, String>,
}

impl App {
    pub fn new(name: AppName) -> Self {
        Self {
            name,
            install: String::new(),
            files: Vec::new(),
            env: String::new(),
            test: String::new(),
            help: String::new(),
            run: String::new(),
            start: String::new(),
            labels: BTreeMap::new(),
        }
    }

    /// In-image root, `/scif/apps/<name>`.
    pub fn root(&self) -> String {
        format!("/scif/apps/{}", self.name)
    }

    pub fn data(&self) -> String {
        format!("/scif/data/{}", self.name)
    }

    fn base_env(&self) -> String {
        let root = self.root();
        let data = self.data();
        format!(
            "#!/bin/sh\n\
             SCIF_APPNAME={name}\n\
             SCIF_APPROOT=\"{root}\"\n\
             SCIF_APPMETA=\"{root}/scif\"\n\
             SCIF_DATA=\"/scif/data\"\n\
             SCIF_APPDATA=\"{data}\"\n\
             SCIF_APPINPUT=\"{data}/input\"\n\
             SCIF_APPOUTPUT=\"{data}/output\"\n\
             export SCIF_APPDATA SCIF_APPNAME SCIF_APPROOT SCIF_APPMETA SCIF_APPINPUT SCIF_APPOUTPUT SCIF_DATA\n",
            name = self.name,
        )
    }
}

fn append_body(target: &mut String, body: &str) {
    if body.is_empty() {
        return;
    }
    if !target.is_empty() {
        target.push('\n');
    }
    target.push_str(body);
}

fn script(body: &str) -> String {
    format!("#!/bin/sh\n\n{body}\n")
}

/// Collects `%app*` sections of one stage and writes the SCI-F tree.
///
/// The name→app map is behind a lock so sections may be handed in from
/// several threads; everything else reads it after collection is done.
#[derive(Debug, Default)]
pub struct Apps {
    apps: Mutex<BTreeMap<AppName, App>>,
    order: Mutex<Vec<AppName>>,
}

impl Apps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_definition(def: &Definition) -> Self {
        let apps = Self::new();
        for name in &def.app_order {
            apps.ensure(name);
        }
        for section in &def.app_sections {
            apps.handle_section(section.kind, &section.app, &section.body);
        }
        apps
    }

    fn ensure(&self, name: &AppName) {
        let mut apps = self.apps.lock().unwrap_or_else(PoisonError::into_inner);
        if !apps.contains_key(name) {
            apps.insert(name.clone(), App::new(name.clone()));
            self.order
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(name.clone());
        }
    }

    /// Fold one app section into its app, creating the app on first sight.
    pub fn handle_section(&self, kind: AppSectionKind, name: &AppName, body: &str) {
        self.ensure(name);
        let mut apps = self.apps.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(app) = apps.get_mut(name) else {
            return;
        };
        match kind {
            AppSectionKind::Install => append_body(&mut app.install, body),
            AppSectionKind::Files => app.files.extend(parse_file_lines(body)),
            AppSectionKind::Env => append_body(&mut app.env, body),
            AppSectionKind::Test => append_body(&mut app.test, body),
            AppSectionKind::Help => append_body(&mut app.help, body),
            AppSectionKind::Run => append_body(&mut app.run, body),
            AppSectionKind::Start => append_body(&mut app.start, body),
            AppSectionKind::Labels => app.labels.extend(parse_label_lines(body)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.apps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    pub fn get(&self, name: &str) -> Option<App> {
        self.apps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&AppName::new(name))
            .cloned()
    }

    /// Apps in order of first appearance.
    pub fn apps(&self) -> Vec<App> {
        let apps = self.apps.lock().unwrap_or_else(PoisonError::into_inner);
        self.order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|name| apps.get(name).cloned())
            .collect()
    }

    /// Write every app's tree, then the global `94-appsbase.sh`.
    ///
    /// `files_root` resolves relative `%appfiles` sources.
    pub fn materialize(&self, layout: &BundleLayout, files_root: &Path) -> Result<(), CoreError> {
        let apps = self.apps();
        if apps.is_empty() {
            return Ok(());
        }
        for app in &apps {
            info!("installing app {}", app.name);
            materialize_app(app, layout, files_root)?;
        }
        let global = global_env(&apps, layout);
        write_atomic(&layout.apps_env_script(), global.as_bytes(), 0o755)?;
        Ok(())
    }

    /// `%appinstall` scriptlets, each run from its app root with the app's
    /// base environment sourced. Appended to `%post`.
    pub fn install_script(&self) -> String {
        let mut out = String::new();
        for app in self.apps() {
            if app.install.trim().is_empty() {
                continue;
            }
            let root = app.root();
            let _ = write!(
                out,
                "\ncd /\n. {root}/scif/env/01-base.sh\ncd {root}\n{}\ncd /\n",
                app.install
            );
        }
        out
    }
}

fn materialize_app(app: &App, layout: &BundleLayout, files_root: &Path) -> Result<(), CoreError> {
    let root = layout.app_root(&app.name);
    let meta = root.join("scif");
    let data = layout.app_data(&app.name);
    for dir in [
        root.join("bin"),
        root.join("lib"),
        meta.join("env"),
        data.join("input"),
        data.join("output"),
    ] {
        fs::create_dir_all(dir)?;
    }

    write_atomic(&meta.join("env/01-base.sh"), app.base_env().as_bytes(), 0o755)?;
    if !app.env.trim().is_empty() {
        write_atomic(
            &meta.join("env/90-environment.sh"),
            format!("#!/bin/sh\n# Custom environment shell code should follow\n\n{}\n", app.env).as_bytes(),
            0o755,
        )?;
    }
    if !app.run.trim().is_empty() {
        write_atomic(&meta.join("runscript"), script(&app.run).as_bytes(), 0o755)?;
    }
    if !app.test.trim().is_empty() {
        write_atomic(&meta.join("test"), script(&app.test).as_bytes(), 0o755)?;
    }
    if !app.start.trim().is_empty() {
        write_atomic(&meta.join("startscript"), script(&app.start).as_bytes(), 0o755)?;
    }
    if !app.help.trim().is_empty() {
        write_atomic(&meta.join("runscript.help"), format!("{}\n", app.help).as_bytes(), 0o644)?;
    }

    let mut labels = app.labels.clone();
    labels.insert(APP_NAME_LABEL.to_owned(), app.name.to_string());
    let json = serde_json::to_string_pretty(&labels)?;
    write_atomic(&meta.join("labels.json"), json.as_bytes(), 0o644)?;

    for file in &app.files {
        let src = files_root.join(&file.src);
        let dst = confine(&root, &file.dst);
        debug!("app {}: copying {} -> {}", app.name, src.display(), dst.display());
        copy_path(&src, &dst)?;
    }
    Ok(())
}

fn global_env(apps: &[App], layout: &BundleLayout) -> String {
    let mut out = String::from("#!/bin/sh\n");
    for app in apps {
        let name = &app.name;
        let root = app.root();
        let meta = layout.app_root(name).join("scif");
        let _ = write!(
            out,
            "\nSCIF_APPDATA_{name}={data}\n\
             SCIF_APPMETA_{name}={root}/scif\n\
             SCIF_APPROOT_{name}={root}\n\
             SCIF_APPBIN_{name}={root}/bin\n\
             SCIF_APPLIB_{name}={root}/lib\n\
             export SCIF_APPDATA_{name} SCIF_APPROOT_{name} SCIF_APPMETA_{name} SCIF_APPBIN_{name} SCIF_APPLIB_{name}\n",
            data = app.data(),
        );

        let optional = [
            ("SCIF_APPENV", "env/90-environment.sh"),
            ("SCIF_APPLABELS", "labels.json"),
            ("SCIF_APPRUN", "runscript"),
            ("SCIF_APPTEST", "test"),
            ("SCIF_APPSTART", "startscript"),
        ];
        for (var, rel) in optional {
            if meta.join(rel).is_file() {
                let _ = write!(out, "{var}_{name}={root}/scif/{rel}\nexport {var}_{name}\n");
            }
        }
    }
    out
}
