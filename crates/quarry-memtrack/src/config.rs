//! Configuration for the worker's memory accounting (private module)

use crate::internal_prelude::*;

/// Memory accounting configuration for a worker process
///
/// This is where the process-wide limits are specified.  Handed to
/// [`TrackerRegistry::new`](crate::TrackerRegistry::new) at startup.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Config {
    /// Byte cap for the process root tracker
    pub(crate) process_limit: ByteQty,

    /// Byte cap for the query pool root, if any
    pub(crate) query_pool_limit: Option<ByteQty>,

    /// Byte cap for the load root, if any
    pub(crate) load_limit: Option<ByteQty>,
}

/// Memory accounting configuration (builder)
///
/// Deserializable, so the worker's config file can carry a `[memory]`
/// section; quantities accept `"8 GiB"`-style strings.
//
// Hand-rolled rather than `#[derive(Builder)]`: there are only three
// setters, and this way the builder docs can describe the cross-field
// invariants, which are not per-field properties.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq, Default)]
pub struct ConfigBuilder {
    /// Byte cap for the process root tracker
    ///
    /// Mandatory.  Everything the worker charges is bounded by this.
    process_limit: Option<ByteQty>,

    /// Byte cap for the query pool root
    ///
    /// Optional; must not exceed `process_limit`.
    query_pool_limit: Option<ByteQty>,

    /// Byte cap for the load root
    ///
    /// Optional; must not exceed `process_limit`.
    load_limit: Option<ByteQty>,
}

impl Config {
    /// Start building a [`Config`]
    ///
    /// Returns a fresh default [`ConfigBuilder`].
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

impl ConfigBuilder {
    /// Set the process-wide byte cap
    pub fn process_limit(&mut self, value: impl Into<ByteQty>) -> &mut Self {
        self.process_limit = Some(value.into());
        self
    }

    /// Set the query pool byte cap
    pub fn query_pool_limit(&mut self, value: impl Into<ByteQty>) -> &mut Self {
        self.query_pool_limit = Some(value.into());
        self
    }

    /// Set the load byte cap
    pub fn load_limit(&mut self, value: impl Into<ByteQty>) -> &mut Self {
        self.load_limit = Some(value.into());
        self
    }

    /// Build a [`Config`] from the builder
    ///
    /// Returns an error unless `process_limit` has been specified, or if
    /// the field values are invalid or inconsistent.
    pub fn build(&self) -> Result<Config, ConfigBuildError> {
        let process_limit = self
            .process_limit
            .ok_or_else(|| ConfigBuildError::MissingField {
                field: "process_limit".into(),
            })?;

        if process_limit.as_i64() <= 0 {
            return Err(ConfigBuildError::Invalid {
                field: "process_limit".into(),
                problem: "must be positive".into(),
            });
        }

        for (field, sub_limit) in [
            ("query_pool_limit", self.query_pool_limit),
            ("load_limit", self.load_limit),
        ] {
            let Some(sub_limit) = sub_limit else { continue };
            if sub_limit.as_i64() <= 0 {
                return Err(ConfigBuildError::Invalid {
                    field: field.into(),
                    problem: "must be positive".into(),
                });
            }
            if sub_limit > process_limit {
                return Err(ConfigBuildError::Inconsistent {
                    fields: vec![field.into(), "process_limit".into()],
                    problem: format!(
                        "{} exceeds the process limit {}",
                        sub_limit, process_limit
                    ),
                });
            }
        }

        Ok(Config {
            process_limit,
            query_pool_limit: self.query_pool_limit,
            load_limit: self.load_limit,
        })
    }
}
