//! Rendered forecast parameters.
//!
//! Every [`Parameter`] maps to one rendered map per region and, for the
//! GRIB decoder, to the `shortName` filter it opens the source under.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A forecast field rendered into a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parameter {
    /// 2 metre temperature.
    T2m,
    /// Accumulated total precipitation.
    Apcp,
    /// Synoptic composite (all fields, no decoder filter).
    Synoptic,
}

impl Parameter {
    /// The default parameter set rendered for every forecast file.
    pub const ALL: [Parameter; 3] = [Parameter::T2m, Parameter::Apcp, Parameter::Synoptic];

    /// Wire and object-key name of the parameter.
    pub fn as_str(&self) -> &'static str {
        match self {
            Parameter::T2m => "t2m",
            Parameter::Apcp => "apcp",
            Parameter::Synoptic => "synoptic",
        }
    }

    /// GRIB `shortName` the decoder must filter on, or `None` to open the
    /// whole file.
    pub fn index_filter(&self) -> Option<&'static str> {
        match self {
            Parameter::T2m => Some("2t"),
            Parameter::Apcp => Some("tp"),
            Parameter::Synoptic => None,
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Parameter {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "t2m" => Ok(Parameter::T2m),
            "apcp" => Ok(Parameter::Apcp),
            "synoptic" => Ok(Parameter::Synoptic),
            other => Err(CoreError::Validation(format!(
                "Unknown parameter '{other}'. Must be one of: t2m, apcp, synoptic"
            ))),
        }
    }
}

/// Parse a comma-separated parameter list, e.g. `"t2m,apcp"`.
///
/// Duplicates are collapsed; an empty list is rejected.
pub fn parse_parameter_list(input: &str) -> Result<Vec<Parameter>, CoreError> {
    let mut params = Vec::new();
    for raw in input.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let param: Parameter = raw.parse()?;
        if !params.contains(&param) {
            params.push(param);
        }
    }
    if params.is_empty() {
        return Err(CoreError::Validation(
            "Parameter list must not be empty".to_string(),
        ));
    }
    Ok(params)
}
