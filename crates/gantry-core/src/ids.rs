//! Strongly-typed identifiers for domain entities.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! define_id {
    ($name:ident, $prefix:expr) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let uuid_str = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ok(Self(Uuid::parse_str(uuid_str)?))
            }
        }
    };
}

define_id!(PipelineId, "pip");
define_id!(StageId, "stg");
define_id!(JobId, "job");
define_id!(BuildCauseId, "bc");

/// Human-facing locator of a stage run: `pipeline/counter/stage/counter`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct StageLocator {
    pub pipeline_name: String,
    pub pipeline_counter: u32,
    pub stage_name: String,
    pub stage_counter: u32,
}

impl StageLocator {
    pub fn new(
        pipeline_name: impl Into<String>,
        pipeline_counter: u32,
        stage_name: impl Into<String>,
        stage_counter: u32,
    ) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            pipeline_counter,
            stage_name: stage_name.into(),
            stage_counter,
        }
    }
}

impl fmt::Display for StageLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.pipeline_name, self.pipeline_counter, self.stage_name, self.stage_counter
        )
    }
}

impl std::str::FromStr for StageLocator {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || crate::Error::InvalidDependencyRevision(s.to_string());
        let parts: Vec<&str> = s.split('/').collect();
        let [pipeline, pipeline_counter, stage, stage_counter] = parts.as_slice() else {
            return Err(invalid());
        };
        if pipeline.is_empty() || stage.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            pipeline_name: pipeline.to_string(),
            pipeline_counter: pipeline_counter.parse().map_err(|_| invalid())?,
            stage_name: stage.to_string(),
            stage_counter: stage_counter.parse().map_err(|_| invalid())?,
        })
    }
}
