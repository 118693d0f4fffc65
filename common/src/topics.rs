pub const TOPIC_ENTITY_STATE_PREFIX: &str = "hass/state";
pub const TOPIC_ENTITY_COMMAND_PREFIX: &str = "hass/cmnd";
pub const TOPIC_CLIMATE_STATE_PREFIX: &str = "fancoil/climate";

pub const TOPIC_ENTITY_STATE_FILTER: &str = "hass/state/#";

pub const PAYLOAD_ON: &str = "on";
pub const PAYLOAD_OFF: &str = "off";

pub fn entity_state_topic(entity_id: &str) -> String {
    format!("{TOPIC_ENTITY_STATE_PREFIX}/{entity_id}")
}

pub fn entity_command_topic(entity_id: &str) -> String {
    format!("{TOPIC_ENTITY_COMMAND_PREFIX}/{entity_id}")
}

pub fn climate_state_topic(entry_id: &str) -> String {
    format!("{TOPIC_CLIMATE_STATE_PREFIX}/{entry_id}")
}

pub fn entity_from_state_topic(topic: &str) -> Option<&str> {
    topic
        .strip_prefix(TOPIC_ENTITY_STATE_PREFIX)?
        .strip_prefix('/')
        .filter(|entity_id| !entity_id.is_empty())
}
