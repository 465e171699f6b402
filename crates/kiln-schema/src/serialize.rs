use crate::definition::{Definition, Script};
use std::fmt::Write as _;

/// Render a definition back into definition-file text.
///
/// The output re-parses to an equal [`Definition`] for every modeled field
/// except `raw`. Comments and section ordering of the original are not kept.
pub fn write_definition(def: &Definition) -> String {
    let mut out = String::new();

    if let Some(bootstrap) = def.header.get("bootstrap") {
        let _ = writeln!(out, "bootstrap: {bootstrap}");
    }
    for (key, value) in def.header.iter().filter(|(k, _)| *k != "bootstrap") {
        let _ = writeln!(out, "{key}: {value}");
    }

    let image = &def.image_data.scripts;
    let build = &def.build_data.scripts;

    write_script(&mut out, "help", &image.help);

    if !def.image_data.labels.is_empty() {
        out.push_str("\n%labels\n");
        for (key, value) in &def.image_data.labels {
            if value.is_empty() {
                let _ = writeln!(out, "{key}");
            } else {
                let _ = writeln!(out, "{key} {value}");
            }
        }
    }

    for group in &def.build_data.files {
        out.push_str("\n%files");
        if !group.args.is_empty() {
            let _ = write!(out, " {}", group.args);
        }
        out.push('\n');
        for file in &group.files {
            let _ = writeln!(out, "{} {}", file.src, file.dst);
        }
    }

    write_script(&mut out, "environment", &image.environment);
    write_script(&mut out, "pre", &build.pre);
    write_script(&mut out, "setup", &build.setup);
    write_script(&mut out, "post", &build.post);
    write_script(&mut out, "runscript", &image.runscript);
    write_script(&mut out, "startscript", &image.startscript);
    if image.test.is_empty() && image.test.args.is_empty() {
        write_script(&mut out, "test", &build.test);
    } else {
        write_script(&mut out, "test", &image.test);
    }

    for section in &def.app_sections {
        let _ = write!(out, "\n%{} {}\n", section.kind.section_name(), section.app);
        if !section.body.is_empty() {
            let _ = writeln!(out, "{}", section.body);
        }
    }

    for (name, body) in &def.custom_data {
        let _ = write!(out, "\n%{name}\n");
        if !body.is_empty() {
            let _ = writeln!(out, "{body}");
        }
    }

    // Empty sections carry no data, but a definition needs at least one
    // header line or section to parse.
    if out.is_empty() {
        out.push_str("%help\n");
    }

    out
}

fn write_script(out: &mut String, name: &str, script: &Script) {
    if script.is_empty() && script.args.is_empty() {
        return;
    }
    let _ = write!(out, "\n%{name}");
    if !script.args.is_empty() {
        let _ = write!(out, " {}", script.args);
    }
    out.push('\n');
    if !script.script.is_empty() {
        let _ = writeln!(out, "{}", script.script);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_definition;

    fn reparse(def: &Definition) -> Definition {
        let mut back = parse_definition(&write_definition(def)).unwrap();
        back.raw.clear();
        back
    }

    #[test]
    fn serialize_then_parse_is_stable() {
        let input = "\
Bootstrap: docker
From: ubuntu:22.04
Stage: build

%labels
Author alice
Empty

%files from base
/src/a /dst/a
%files
/etc/hosts

%environment
export A=1

%setup
touch $SINGULARITY_ROOTFS/marker

%post -c /bin/bash

  echo indented
echo done

%runscript
exec \"$@\"

%startscript
start-daemon

%test
true

%appinstall foo
make install
%applabels foo
K V
%apprun bar
exec bar
";
        let mut def = parse_definition(input).unwrap();
        def.raw.clear();
        assert_eq!(reparse(&def), def);
        assert_eq!(reparse(&reparse(&def)), def);
    }

    #[test]
    fn header_first_is_bootstrap() {
        let def = parse_definition("From: alpine\nBootstrap: docker\n").unwrap();
        let text = write_definition(&def);
        assert!(text.starts_with("bootstrap: docker\nfrom: alpine\n"));
    }

    #[test]
    fn headerless_definition_roundtrips() {
        let mut def = parse_definition("%post\necho hi\n").unwrap();
        def.raw.clear();
        assert_eq!(reparse(&def), def);
    }

    #[test]
    fn empty_sections_serialize_to_parseable_text() {
        for input in ["%post\n", "%labels\n", "%files\n", "%help\n\n"] {
            let mut def = parse_definition(input).unwrap();
            def.raw.clear();
            let text = write_definition(&def);
            assert!(!text.is_empty(), "{input:?}");
            assert_eq!(reparse(&def), def, "{input:?}");
        }
    }

    #[test]
    fn build_only_test_is_written() {
        let mut def = Definition::default();
        def.header.insert("bootstrap".to_owned(), "scratch".to_owned());
        def.build_data.scripts.test = Script::new("true");
        let back = reparse(&def);
        assert_eq!(back.build_data.scripts.test.script, "true");
    }
}
