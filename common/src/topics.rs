/// Readings from sensor nodes, one topic per sensor id: `agronode/sensor/<id>`.
pub const TOPIC_SENSOR_PREFIX: &str = "agronode/sensor/";
pub const TOPIC_SENSOR_WILDCARD: &str = "agronode/sensor/+";

pub const TOPIC_DEVICE_STATE: &str = "agronode/device/state";
pub const TOPIC_DEVICE_LOG: &str = "agronode/device/log";

/// `agronode/cmnd/switch/<controller>[/<climate switch>]`, payload `ON`/`OFF`.
pub const TOPIC_CMD_SWITCH_PREFIX: &str = "agronode/cmnd/switch/";
pub const TOPIC_CMD_SWITCH_WILDCARD: &str = "agronode/cmnd/switch/#";
/// `agronode/cmnd/button/<line>`, payload `falling`/`rising`.
pub const TOPIC_CMD_BUTTON_PREFIX: &str = "agronode/cmnd/button/";
pub const TOPIC_CMD_BUTTON_WILDCARD: &str = "agronode/cmnd/button/+";
pub const TOPIC_CMD_SETTINGS: &str = "agronode/cmnd/settings";
pub const TOPIC_CMD_SCHEDULE: &str = "agronode/cmnd/schedule";

pub fn sensor_topic(sensor_id: &str) -> String {
    format!("{TOPIC_SENSOR_PREFIX}{sensor_id}")
}
