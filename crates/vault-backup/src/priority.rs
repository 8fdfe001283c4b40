//! CPU and I/O scheduling priority of the archival tool.

use thiserror::Error;

use crate::config::Config;
use crate::session::CommandSpec;

pub const ENV_NICE_ADJUSTMENT: &str = "NICE_ADJUSTMENT";
pub const ENV_IONICE_CLASS: &str = "IONICE_CLASS";
pub const ENV_IONICE_CLASS_DATA: &str = "IONICE_CLASS_DATA";

/// `ionice` class used when only class data is given (best-effort).
const DEFAULT_IONICE_CLASS: i32 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PriorityError {
    #[error("{var}: {value:?} is not an integer")]
    NotAnInteger { var: &'static str, value: String },

    #[error("{var}: {value} is outside {min}..={max}")]
    OutOfRange {
        var: &'static str,
        value: i32,
        min: i32,
        max: i32,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrioritySettings {
    pub nice: Option<i32>,
    pub ionice_class: Option<i32>,
    pub ionice_class_data: Option<i32>,
}

impl PrioritySettings {
    pub fn from_config(cfg: &Config) -> Result<Self, PriorityError> {
        Self::parse(
            cfg.nice_adjustment.as_deref(),
            cfg.ionice_class.as_deref(),
            cfg.ionice_class_data.as_deref(),
        )
    }

    /// Parse the three settings. Unset or blank values mean "not set".
    pub fn parse(
        nice: Option<&str>,
        ionice_class: Option<&str>,
        ionice_class_data: Option<&str>,
    ) -> Result<Self, PriorityError> {
        Ok(Self {
            nice: parse_in_range(ENV_NICE_ADJUSTMENT, nice, -20, 19)?,
            ionice_class: parse_in_range(ENV_IONICE_CLASS, ionice_class, 0, 3)?,
            ionice_class_data: parse_in_range(ENV_IONICE_CLASS_DATA, ionice_class_data, 0, 7)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.nice.is_none() && self.ionice_class.is_none() && self.ionice_class_data.is_none()
    }

    /// Prefix such as `ionice -c 2 -n 7 nice -n 10`.
    pub fn wrapper(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.ionice_class.is_some() || self.ionice_class_data.is_some() {
            let class = self.ionice_class.unwrap_or(DEFAULT_IONICE_CLASS);
            out.extend(["ionice".to_string(), "-c".to_string(), class.to_string()]);
            if let Some(data) = self.ionice_class_data {
                out.extend(["-n".to_string(), data.to_string()]);
            }
        }
        if let Some(nice) = self.nice {
            out.extend(["nice".to_string(), "-n".to_string(), nice.to_string()]);
        }
        out
    }

    pub fn apply(&self, command: CommandSpec) -> CommandSpec {
        if self.is_empty() {
            return command;
        }
        command.wrapped_in(&self.wrapper())
    }
}

fn parse_in_range(var: &'static str, raw: Option<&str>, min: i32, max: i32) -> Result<Option<i32>, PriorityError> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let value: i32 = raw.parse().map_err(|_| PriorityError::NotAnInteger {
        var,
        value: raw.to_string(),
    })?;
    if !(min..=max).contains(&value) {
        return Err(PriorityError::OutOfRange { var, value, min, max });
    }
    Ok(Some(value))
}
