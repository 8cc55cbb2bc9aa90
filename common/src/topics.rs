pub const DOMAIN: &str = "smart_maic";
pub const PREFIX: &str = "smart-maic";

/// Topic the device publishes to once its MQTT relay is configured by us.
pub fn prefixed_json_topic(devid: &str) -> String {
    format!("{PREFIX}/{devid}/JSON")
}

/// Topic used by devices that were configured without a prefix.
pub fn json_topic(devid: &str) -> String {
    format!("{devid}/JSON")
}

pub fn device_topics(devid: &str) -> [String; 2] {
    [prefixed_json_topic(devid), json_topic(devid)]
}
