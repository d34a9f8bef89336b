//! Event-bus message bodies and routing keys.
//!
//! Field names follow the producers already deployed on the bus
//! (`file_path`, `url`); the descriptive names are accepted as aliases.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::forecast::ForecastHour;
use crate::job::RenderedMap;
use crate::parameter::Parameter;

/// Topic exchange every message flows through.
pub const EXCHANGE_NAME: &str = "weather_events";

/// A new forecast data file is available. Producers may append `.<model>`.
pub const ROUTING_KEY_DATA_AVAILABLE: &str = "grib.downloaded";

/// A previously generated map should be removed.
pub const ROUTING_KEY_DELETION: &str = "map.deleted";

/// Published once per successfully rendered map.
pub const ROUTING_KEY_MAP_GENERATED: &str = "map.generated";

/// Inbound notification that a forecast file has been downloaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForecastAvailableEvent {
    #[serde(rename = "file_path", alias = "source_ref")]
    pub source_ref: String,
    pub model: String,
    pub run_date: String,
    pub run_hour: String,
}

/// Inbound request to delete a stored map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionRequest {
    #[serde(rename = "url", alias = "object_key")]
    pub object_key: String,
}

/// Outbound notification for one rendered map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapGeneratedEvent {
    pub model: String,
    pub run_date: String,
    pub run_hour: String,
    pub parameter: Parameter,
    pub forecast_hour: ForecastHour,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(rename = "url", alias = "object_key")]
    pub object_key: String,
}

impl From<&RenderedMap> for MapGeneratedEvent {
    fn from(map: &RenderedMap) -> Self {
        Self {
            model: map.model.clone(),
            run_date: map.run_date.clone(),
            run_hour: map.run_hour.clone(),
            parameter: map.parameter,
            forecast_hour: map.forecast_hour.clone(),
            region: map.region.clone(),
            object_key: map.object_key.clone(),
        }
    }
}

/// A decoded inbound delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    Render(ForecastAvailableEvent),
    Delete(DeletionRequest),
}

impl WorkItem {
    /// Decode a delivery body according to its routing key.
    pub fn decode(routing_key: &str, body: &[u8]) -> Result<Self, CoreError> {
        let malformed = |e: serde_json::Error| CoreError::MalformedMessage {
            routing_key: routing_key.to_string(),
            reason: e.to_string(),
        };

        if is_data_available_key(routing_key) {
            serde_json::from_slice(body).map(WorkItem::Render).map_err(malformed)
        } else if routing_key == ROUTING_KEY_DELETION {
            serde_json::from_slice(body).map(WorkItem::Delete).map_err(malformed)
        } else {
            Err(CoreError::UnknownRoutingKey(routing_key.to_string()))
        }
    }
}

/// `grib.downloaded` or `grib.downloaded.<model>`.
pub fn is_data_available_key(routing_key: &str) -> bool {
    match routing_key.strip_prefix(ROUTING_KEY_DATA_AVAILABLE) {
        Some("") => true,
        Some(rest) => rest.len() > 1 && rest.starts_with('.'),
        None => false,
    }
}

/// Per-model variant of the data-available routing key.
pub fn data_available_key_for(model: &str) -> String {
    format!("{ROUTING_KEY_DATA_AVAILABLE}.{model}")
}
