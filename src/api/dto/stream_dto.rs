//! Query parameters of the event stream endpoint.

use serde::Deserialize;
use utoipa::IntoParams;

use crate::config::split_list;
use crate::domain::Filter;

/// `GET /api/v1/events/stream` query string.
///
/// List parameters are comma-separated; omitting all of them subscribes
/// to every event.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct StreamQuery {
    /// Access token. An `Authorization: Bearer` header is used when absent.
    #[serde(default)]
    pub token: Option<String>,
    /// Event types, e.g. `state_changed,call_service`.
    #[serde(default)]
    pub events: Option<String>,
    /// Entity ids, e.g. `light.kitchen,sensor.outdoor_temp`.
    #[serde(default)]
    pub entity_id: Option<String>,
    /// Entity domains, e.g. `light,climate`.
    #[serde(default)]
    pub domain: Option<String>,
}

impl StreamQuery {
    /// Builds the initial filter from the list parameters.
    #[must_use]
    pub fn filter(&self) -> Filter {
        let mut filter = Filter::new();
        for event_type in self.events.as_deref().map(split_list).unwrap_or_default() {
            filter.add_event_type(event_type);
        }
        for entity_id in self.entity_id.as_deref().map(split_list).unwrap_or_default() {
            filter.add_entity_id(entity_id);
        }
        for domain in self.domain.as_deref().map(split_list).unwrap_or_default() {
            filter.add_domain(domain);
        }
        filter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comma_lists_become_filter_sets() {
        let query = StreamQuery {
            events: Some("state_changed, call_service".to_string()),
            domain: Some("light,,climate".to_string()),
            ..StreamQuery::default()
        };
        let filter = query.filter();
        assert_eq!(
            filter.event_types().collect::<Vec<_>>(),
            vec!["call_service", "state_changed"]
        );
        assert_eq!(filter.domains().collect::<Vec<_>>(), vec!["climate", "light"]);
        assert_eq!(filter.entity_ids().count(), 0);
    }

    #[test]
    fn no_parameters_means_unfiltered() {
        assert!(StreamQuery::default().filter().is_empty());
    }
}
