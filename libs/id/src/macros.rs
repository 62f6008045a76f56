//! Macros for defining typed ID types.

/// Macro to define a typed numeric ID with a specific prefix.
///
/// This generates a newtype wrapper around an unsigned integer with:
/// - A `PREFIX` constant used by the labelled form (`app_42`)
/// - `new()` to wrap a raw value (zero is rejected)
/// - `parse()` accepting either `42` or `app_42`
/// - `Display` (bare number) and `FromStr` implementations
/// - `Serialize` and `Deserialize` as plain numbers
/// - `Ord`, `Hash`, and other standard traits
///
/// Upstream systems use zero to mean "unset", so a zero ID never parses.
///
/// # Example
///
/// ```ignore
/// define_id!(AppId, "app", u32);
///
/// let app_id = AppId::new(42)?;
/// let parsed: AppId = "app_42".parse()?;
/// assert_eq!(app_id, parsed);
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal, $repr:ty) => {
        /// A typed ID for this resource type.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($repr);

        impl $name {
            /// The prefix for the labelled form of this ID.
            pub const PREFIX: &'static str = $prefix;

            /// Wraps a raw value, rejecting zero.
            pub fn new(raw: $repr) -> Result<Self, $crate::IdError> {
                if raw == 0 {
                    return Err($crate::IdError::Zero {
                        kind: Self::PREFIX,
                    });
                }
                Ok(Self(raw))
            }

            /// Returns the raw value.
            #[must_use]
            pub const fn get(&self) -> $repr {
                self.0
            }

            /// Parses an ID from either its bare or labelled form.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                let s = s.trim();
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                let digits = match s.split_once('_') {
                    Some((prefix, rest)) => {
                        if prefix != Self::PREFIX {
                            return Err($crate::IdError::InvalidPrefix {
                                expected: Self::PREFIX,
                                actual: prefix.to_string(),
                            });
                        }
                        rest
                    }
                    None => s,
                };

                let raw = digits
                    .parse::<$repr>()
                    .map_err(|e| $crate::IdError::InvalidNumber(e.to_string()))?;

                Self::new(raw)
            }

            /// Formats the labelled form, e.g. `app_42`.
            #[must_use]
            pub fn label(&self) -> String {
                format!("{}_{}", Self::PREFIX, self.0)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<$repr> for $name {
            type Error = $crate::IdError;

            fn try_from(raw: $repr) -> Result<Self, Self::Error> {
                Self::new(raw)
            }
        }

        impl From<$name> for $repr {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                <$repr as serde::Serialize>::serialize(&self.0, serializer)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let raw = <$repr as serde::Deserialize>::deserialize(deserializer)?;
                Self::new(raw).map_err(serde::de::Error::custom)
            }
        }
    };
}
