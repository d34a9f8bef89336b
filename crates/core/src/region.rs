//! Geographic regions maps are cropped to.
//!
//! The region table is configured as a JSON object of
//! `name -> { lon_min, lon_max, lat_min, lat_max }`. Region names end up in
//! object keys, so they are restricted to a filename-safe alphabet.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Maximum length of a region name.
const MAX_REGION_NAME_LEN: usize = 64;

/// Longitude/latitude bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionBounds {
    pub lon_min: f64,
    pub lon_max: f64,
    pub lat_min: f64,
    pub lat_max: f64,
}

impl RegionBounds {
    pub const fn new(lon_min: f64, lon_max: f64, lat_min: f64, lat_max: f64) -> Self {
        Self {
            lon_min,
            lon_max,
            lat_min,
            lat_max,
        }
    }

    /// Validate ranges and ordering.
    ///
    /// - Longitudes must lie in `-180..=360`, latitudes in `-90..=90`.
    /// - Each minimum must be strictly below its maximum.
    pub fn validate(&self) -> Result<(), CoreError> {
        let lon_ok = |v: f64| (-180.0..=360.0).contains(&v);
        let lat_ok = |v: f64| (-90.0..=90.0).contains(&v);

        if !lon_ok(self.lon_min) || !lon_ok(self.lon_max) {
            return Err(CoreError::Validation(format!(
                "Longitude out of range: {}..{}",
                self.lon_min, self.lon_max
            )));
        }
        if !lat_ok(self.lat_min) || !lat_ok(self.lat_max) {
            return Err(CoreError::Validation(format!(
                "Latitude out of range: {}..{}",
                self.lat_min, self.lat_max
            )));
        }
        if self.lon_min >= self.lon_max || self.lat_min >= self.lat_max {
            return Err(CoreError::Validation(
                "Region minimum must be below maximum".to_string(),
            ));
        }
        Ok(())
    }
}

/// A named crop region.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub name: String,
    pub bounds: RegionBounds,
}

impl Region {
    pub fn new(name: impl Into<String>, bounds: RegionBounds) -> Self {
        Self {
            name: name.into(),
            bounds,
        }
    }
}

/// The region table shipped with the service.
pub fn default_regions() -> Vec<Region> {
    vec![
        Region::new("eastern_med", RegionBounds::new(25.0, 40.0, 25.0, 40.0)),
        Region::new("europe", RegionBounds::new(-10.0, 40.0, 25.0, 70.0)),
        Region::new("israel", RegionBounds::new(33.5, 36.5, 29.0, 33.5)),
        Region::new("middle_east", RegionBounds::new(25.0, 60.0, 10.0, 45.0)),
    ]
}

/// Validate a region name.
///
/// Rules:
/// - Must not be empty or exceed `MAX_REGION_NAME_LEN` characters.
/// - Only ASCII alphanumeric, hyphen or underscore characters.
pub fn validate_region_name(name: &str) -> Result<(), CoreError> {
    if name.is_empty() {
        return Err(CoreError::Validation(
            "Region name must not be empty".to_string(),
        ));
    }
    if name.len() > MAX_REGION_NAME_LEN {
        return Err(CoreError::Validation(format!(
            "Region name must not exceed {MAX_REGION_NAME_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(CoreError::Validation(format!(
            "Region name '{name}' may only contain alphanumeric, hyphen or underscore characters"
        )));
    }
    Ok(())
}

/// Parse and validate a JSON region table.
///
/// Regions come back sorted by name. `{}` is a valid table and means
/// "render unbounded maps only".
pub fn parse_region_table(json: &str) -> Result<Vec<Region>, CoreError> {
    let table: BTreeMap<String, RegionBounds> = serde_json::from_str(json)
        .map_err(|e| CoreError::Validation(format!("Invalid region table: {e}")))?;

    table
        .into_iter()
        .map(|(name, bounds)| {
            validate_region_name(&name)?;
            bounds.validate()?;
            Ok(Region::new(name, bounds))
        })
        .collect()
}
