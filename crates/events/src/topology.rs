//! Exchange, queue and binding layout.
//!
//! Declaration is idempotent on the broker side, so the same [`Topology`]
//! is declared on every (re)connect.

use meteomap_core::messages::{
    data_available_key_for, EXCHANGE_NAME, ROUTING_KEY_DATA_AVAILABLE, ROUTING_KEY_DELETION,
};

/// Queue shared by every consumer when no model filter is configured.
pub const DEFAULT_QUEUE_NAME: &str = "map_renderer_queue";

/// Which queue this process consumes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueLayout {
    /// One queue for all models.
    Shared,
    /// One queue per upstream model.
    PerModel(String),
}

impl QueueLayout {
    pub fn from_listen_model(model: Option<&str>) -> Self {
        match model {
            Some(m) => QueueLayout::PerModel(m.to_string()),
            None => QueueLayout::Shared,
        }
    }
}

/// Concrete names declared on the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub bindings: Vec<String>,
}

impl Topology {
    pub fn for_layout(layout: &QueueLayout) -> Self {
        match layout {
            QueueLayout::Shared => Self {
                exchange: EXCHANGE_NAME.to_string(),
                queue: DEFAULT_QUEUE_NAME.to_string(),
                // `#` matches zero or more words, so the bare key is covered.
                bindings: vec![
                    format!("{ROUTING_KEY_DATA_AVAILABLE}.#"),
                    ROUTING_KEY_DELETION.to_string(),
                ],
            },
            QueueLayout::PerModel(model) => Self {
                exchange: EXCHANGE_NAME.to_string(),
                queue: format!("{DEFAULT_QUEUE_NAME}.{model}"),
                bindings: vec![
                    ROUTING_KEY_DATA_AVAILABLE.to_string(),
                    data_available_key_for(model),
                    ROUTING_KEY_DELETION.to_string(),
                ],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_layout() {
        let t = Topology::for_layout(&QueueLayout::Shared);
        assert_eq!(t.exchange, "weather_events");
        assert_eq!(t.queue, "map_renderer_queue");
        assert_eq!(t.bindings, ["grib.downloaded.#", "map.deleted"]);
    }

    #[test]
    fn per_model_layout() {
        let t = Topology::for_layout(&QueueLayout::from_listen_model(Some("ecmwf")));
        assert_eq!(t.queue, "map_renderer_queue.ecmwf");
        assert_eq!(
            t.bindings,
            ["grib.downloaded", "grib.downloaded.ecmwf", "map.deleted"]
        );
    }
}
