use super::{json_pretty, EXIT_SUCCESS};
use kiln_schema::{parse_definition_file, write_definition, Definition};
use std::path::Path;

pub fn run(path: &Path, serialize: bool, from_json: bool) -> Result<u8, String> {
    let definitions = if from_json {
        read_json(path)?
    } else {
        parse_definition_file(path)
            .map_err(|e| format!("definition error: {}: {e}", path.display()))?
    };

    if serialize {
        let text: Vec<String> = definitions.iter().map(write_definition).collect();
        print!("{}", text.join("\n"));
    } else if let [single] = definitions.as_slice() {
        println!("{}", json_pretty(single)?);
    } else {
        println!("{}", json_pretty(&definitions)?);
    }
    Ok(EXIT_SUCCESS)
}

/// Accept either one JSON definition or an array of them.
fn read_json(path: &Path) -> Result<Vec<Definition>, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    if content.trim_start().starts_with('[') {
        serde_json::from_str(&content)
            .map_err(|e| format!("definition error: invalid definition JSON: {e}"))
    } else {
        Definition::from_json(&content)
            .map(|d| vec![d])
            .map_err(|e| format!("definition error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_json_accepts_object_and_array() {
        let dir = tempfile::tempdir().unwrap();
        let def = kiln_schema::parse_definition("Bootstrap: scratch\n").unwrap();

        let one = dir.path().join("one.json");
        std::fs::write(&one, def.to_json().unwrap()).unwrap();
        assert_eq!(read_json(&one).unwrap(), vec![def.clone()]);

        let many = dir.path().join("many.json");
        std::fs::write(&many, serde_json::to_string(&vec![def.clone(), def]).unwrap()).unwrap();
        assert_eq!(read_json(&many).unwrap().len(), 2);
    }

    #[test]
    fn read_json_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(read_json(&path).unwrap_err().starts_with("definition error:"));
    }
}
