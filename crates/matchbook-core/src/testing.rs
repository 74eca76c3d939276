//! Record fixtures for tests: a source and a trigger that match each
//! other's destination, origin and time windows out of the box, so a
//! test only states what it changes.

use crate::source::{AttributionMode, Source, SourceStatus, SourceType, Surface};
use crate::trigger::{Trigger, TriggerStatus};

pub const FIXTURE_NETWORK: &str = "network-a";
pub const FIXTURE_PUBLISHER: &str = "https://news.publisher.example";
pub const FIXTURE_APP_DESTINATION: &str = "android-app://com.shop.app";
pub const FIXTURE_REGISTRATION_ORIGIN: &str = "https://adtech.example";

/// An active navigation source eligible for [`pending_trigger`]
/// triggers fired between t=1000 and t=100000.
pub fn active_source(id: &str) -> Source {
    Source {
        id: id.into(),
        event_id: 7,
        publisher: FIXTURE_PUBLISHER.into(),
        publisher_surface: Surface::Web,
        app_destination: Some(FIXTURE_APP_DESTINATION.into()),
        web_destination: Some("https://shop.example".into()),
        network_id: FIXTURE_NETWORK.into(),
        registrant: FIXTURE_APP_DESTINATION.into(),
        registration_id: None,
        registration_origin: FIXTURE_REGISTRATION_ORIGIN.into(),
        source_type: SourceType::Navigation,
        priority: 0,
        status: SourceStatus::Active,
        event_time: 1_000,
        expiry_time: 100_000,
        event_report_window: 90_000,
        aggregatable_report_window: 95_000,
        attribution_mode: AttributionMode::Truthful,
        install_attributed: false,
        install_cooldown_window: 0,
        install_time: None,
        filter_data: None,
        aggregation_keys: None,
        aggregate_contributions: 0,
        event_report_dedup_keys: Vec::new(),
        aggregate_report_dedup_keys: Vec::new(),
        shared_aggregation_keys: None,
        parent_id: None,
    }
}

/// A pending app-surface trigger aimed at [`active_source`] sources,
/// carrying one catch-all event trigger.
pub fn pending_trigger(id: &str, trigger_time: i64) -> Trigger {
    Trigger {
        id: id.into(),
        attribution_destination: FIXTURE_APP_DESTINATION.into(),
        destination_surface: Surface::App,
        network_id: FIXTURE_NETWORK.into(),
        registrant: FIXTURE_APP_DESTINATION.into(),
        registration_origin: FIXTURE_REGISTRATION_ORIGIN.into(),
        trigger_time,
        status: TriggerStatus::Pending,
        event_triggers: Some(r#"[{"trigger_data": "1", "priority": 1}]"#.into()),
        filters: None,
        not_filters: None,
        aggregatable_trigger_data: None,
        aggregatable_values: None,
        aggregatable_dedup_keys: None,
        attribution_config: None,
        debug_key: None,
    }
}
