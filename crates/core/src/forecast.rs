//! Forecast-hour extraction from source file names.
//!
//! Extraction is total: [`forecast_hour`] always returns a value and falls
//! back to [`ForecastHour::DEFAULT`] (`"000"`) when the model is unknown or
//! the file name does not carry a recognisable hour token.

use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Trailing `_<N>h` token before an optional extension, e.g. `_3h.grib2`.
static ECMWF_STEP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_(\d+)h(?:\.[A-Za-z0-9]+)?$").expect("valid regex"));

/// Zero-padded forecast offset in hours, at least three digits wide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ForecastHour(String);

impl ForecastHour {
    /// Value used whenever the hour cannot be derived.
    pub const DEFAULT: &'static str = "000";

    pub fn from_hours(hours: u32) -> Self {
        Self(format!("{hours:03}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ForecastHour {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl fmt::Display for ForecastHour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the forecast hour for `model` from `source_ref`, or `None` if the
/// reference carries no parsable hour for that model.
///
/// Only the file-name component of `source_ref` is inspected.
///
/// - `gfs`: digits after the last `.f` token (`gfs.t12z.pgrb2.0p25.f003`).
/// - `ecmwf`: `_<N>h` before the extension (`..._00z_3h.grib2`).
/// - Any other model: `None`.
pub fn try_forecast_hour(model: &str, source_ref: &str) -> Option<ForecastHour> {
    let file_name = Path::new(source_ref)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(source_ref);

    match model.to_ascii_lowercase().as_str() {
        "gfs" => {
            let (_, tail) = file_name.rsplit_once(".f")?;
            parse_hours(tail)
        }
        "ecmwf" => {
            let caps = ECMWF_STEP_RE.captures(file_name)?;
            parse_hours(caps.get(1)?.as_str())
        }
        _ => None,
    }
}

/// Total variant of [`try_forecast_hour`]: falls back to `"000"`.
pub fn forecast_hour(model: &str, source_ref: &str) -> ForecastHour {
    try_forecast_hour(model, source_ref).unwrap_or_default()
}

fn parse_hours(digits: &str) -> Option<ForecastHour> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u32>().ok().map(ForecastHour::from_hours)
}
