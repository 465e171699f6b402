//! Definition file parsing and serialization for Kiln.
//!
//! This crate defines the recipe layer: the section-oriented definition file
//! scanner (`parse_definition`, `parse_all`), the structured `Definition` it
//! produces, the text serializer (`write_definition`) that re-ingests
//! losslessly, and the JSON form used to hand definitions between tools.

pub mod definition;
pub mod parser;
pub mod section;
pub mod serialize;
pub mod types;

pub use definition::{
    parse_file_lines, parse_label_lines, AppSection, BuildData, BuildScripts, Definition,
    DefinitionError, FileTransport, FilesSection, ImageData, ImageScripts, Script,
};
pub use parser::{parse_all, parse_definition, parse_definition_file};
pub use section::{is_header_key, is_valid_app_name, AppSectionKind, SectionKind, HEADER_KEYS};
pub use serialize::write_definition;
pub use types::{AppName, StageName};
