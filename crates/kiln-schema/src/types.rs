//! Newtype wrappers for names that appear in definition files.
//!
//! All newtypes serialize/deserialize as plain strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_newtype!(
    /// Name of a SCI-F app declared through `%app*` sections.
    AppName
);

string_newtype!(
    /// Name of a build stage, taken from the `Stage:` header.
    StageName
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_name_display_and_compare() {
        let name = AppName::new("foo");
        assert_eq!(name.to_string(), "foo");
        assert_eq!(name, "foo");
        assert_eq!(name.as_str(), "foo");
    }

    #[test]
    fn serializes_as_plain_string() {
        let name = StageName::from("build");
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"build\"");
        let back: StageName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, name);
    }
}
