//! Macro for defining typed names.

/// Defines a typed name with a fixed prefix.
///
/// The generated newtype wraps a ULID and provides `new()`, `parse()`,
/// `Display`/`FromStr` in the `{prefix}-{ulid}` form, and string serde.
///
/// ```ignore
/// define_name!(DeploymentName, "bpv");
///
/// let name = DeploymentName::new();
/// let parsed: DeploymentName = name.to_string().parse()?;
/// ```
#[macro_export]
macro_rules! define_name {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $name {
            /// The prefix for this name type.
            pub const PREFIX: &'static str = $prefix;

            /// Allocates a fresh name.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn ulid(&self) -> $crate::Ulid {
                self.0
            }

            /// Parses a name in the `{prefix}-{ulid}` form. The ULID part is
            /// accepted in either case.
            pub fn parse(s: &str) -> Result<Self, $crate::NameError> {
                if s.is_empty() {
                    return Err($crate::NameError::Empty);
                }

                let Some((prefix, ulid_str)) = s.split_once('-') else {
                    return Err($crate::NameError::MissingSeparator);
                };

                if prefix != Self::PREFIX {
                    return Err($crate::NameError::InvalidPrefix {
                        expected: Self::PREFIX,
                        actual: prefix.to_string(),
                    });
                }

                let ulid = $crate::Ulid::from_string(&ulid_str.to_ascii_uppercase())
                    .map_err(|e| $crate::NameError::InvalidUlid(e.to_string()))?;

                Ok(Self(ulid))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(
                    f,
                    "{}-{}",
                    Self::PREFIX,
                    self.0.to_string().to_ascii_lowercase()
                )
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::NameError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}
