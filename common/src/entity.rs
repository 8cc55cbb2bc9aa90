use serde::Serialize;

use crate::{
    config::EntryData,
    description::{
        Descriptions, MetricKey, NumberDescription, PhaseTotalDescription, SensorDescription,
        SwitchDescription,
    },
    topics::DOMAIN,
    types::Snapshot,
};

pub const MANUFACTURER: &str = "Smart MAIC";

/// Marker key whose presence identifies a three-phase device (D103).
const THREE_PHASE_MARKER: &str = "A1";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub identifiers: (&'static str, String),
    pub name: String,
    pub manufacturer: &'static str,
    pub model: String,
    pub configuration_url: String,
}

impl DeviceInfo {
    pub fn for_entry(data: &EntryData) -> Self {
        Self {
            identifiers: (DOMAIN, data.devid.clone()),
            name: data.device_name.clone(),
            manufacturer: MANUFACTURER,
            model: data.devtype.clone(),
            configuration_url: data.configuration_url(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "platform", rename_all = "snake_case")]
pub enum EntityKind {
    Sensor(SensorDescription),
    PhaseTotal(PhaseTotalDescription),
    Number(NumberDescription),
    Switch(SwitchDescription),
}

impl EntityKind {
    pub fn platform(&self) -> &'static str {
        match self {
            Self::Sensor(_) => "sensor",
            Self::PhaseTotal(_) => "phase_total",
            Self::Number(_) => "number",
            Self::Switch(_) => "switch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EntityState {
    Value(f64),
    Switch(bool),
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entity {
    pub unique_id: String,
    pub name: String,
    pub key: MetricKey,
    pub kind: EntityKind,
}

impl Entity {
    fn new(data: &EntryData, key: MetricKey, translation_key: &str, kind: EntityKind) -> Self {
        Self {
            unique_id: format!("{}-{key}", data.devid),
            name: display_name(translation_key, &key),
            key,
            kind,
        }
    }

    /// `unique_id` is only unique within a platform; this is unique per device.
    pub fn entity_id(&self) -> String {
        format!("{}.{}", self.kind.platform(), self.unique_id)
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.kind, EntityKind::Number(_) | EntityKind::Switch(_))
    }

    pub fn enabled_by_default(&self) -> bool {
        match &self.kind {
            EntityKind::Sensor(description) => description.enabled_by_default,
            EntityKind::PhaseTotal(description) => description.enabled_by_default,
            EntityKind::Number(description) => description.enabled_by_default,
            EntityKind::Switch(_) => true,
        }
    }

    /// Reads this entity's value out of the current snapshot.
    pub fn state(&self, snapshot: &Snapshot) -> EntityState {
        let value = match &self.kind {
            EntityKind::Sensor(_) | EntityKind::Number(_) => snapshot.get(&self.key.to_string()),
            EntityKind::PhaseTotal(description) => phase_total(description, snapshot),
            EntityKind::Switch(_) => {
                return match snapshot.get(&self.key.to_string()) {
                    Some(value) => EntityState::Switch(value == 1.0),
                    None => EntityState::Unavailable,
                };
            }
        };

        value.map_or(EntityState::Unavailable, EntityState::Value)
    }
}

fn phase_total(description: &PhaseTotalDescription, snapshot: &Snapshot) -> Option<f64> {
    description
        .phase_keys()
        .iter()
        .map(|key| snapshot.get(&key.to_string()))
        .sum()
}

fn display_name(translation_key: &str, key: &MetricKey) -> String {
    let mut name = translation_key.replace('_', " ");
    if let Some(first) = name.get(..1).map(str::to_ascii_uppercase) {
        name.replace_range(..1, &first);
    }
    match key.suffix() {
        Some(suffix) => format!("{name} {suffix}"),
        None => name,
    }
}

/// Instantiates one entity per snapshot key that has a description, in
/// sensor, number, switch order, plus phase totals on three-phase devices.
pub fn build_entities(
    descriptions: &Descriptions,
    data: &EntryData,
    snapshot: &Snapshot,
) -> Vec<Entity> {
    let mut entities = Vec::new();

    for key in snapshot.keys() {
        if let Some(description) = descriptions.sensor(key) {
            entities.push(Entity::new(
                data,
                description.key,
                description.translation_key,
                EntityKind::Sensor(description.clone()),
            ));
        }
    }

    if snapshot.contains_key(THREE_PHASE_MARKER) {
        for description in descriptions.phase_totals() {
            entities.push(Entity::new(
                data,
                description.key(),
                description.translation_key,
                EntityKind::PhaseTotal(description.clone()),
            ));
        }
    }

    for key in snapshot.keys() {
        if let Some(description) = descriptions.number(key) {
            entities.push(Entity::new(
                data,
                description.key,
                description.translation_key,
                EntityKind::Number(description.clone()),
            ));
        }
    }

    for key in snapshot.keys() {
        if let Some(description) = descriptions.switch(key) {
            entities.push(Entity::new(
                data,
                description.key,
                description.translation_key,
                EntityKind::Switch(description.clone()),
            ));
        }
    }

    entities
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn entry() -> EntryData {
        EntryData {
            ip_address: "192.168.1.50".to_string(),
            pin: "0000".to_string(),
            device_name: "Energy".to_string(),
            devid: "abc123".to_string(),
            devtype: "D103".to_string(),
        }
    }

    fn unique_ids(entities: &[Entity]) -> Vec<&str> {
        entities.iter().map(|entity| entity.unique_id.as_str()).collect()
    }

    #[test]
    fn single_phase_entities_match_present_keys() {
        let descriptions = Descriptions::load().unwrap();
        let snapshot: Snapshot = [
            ("V", 230.0),
            ("A", 1.2),
            ("W", 276.0),
            ("Temp", 31.0),
            ("uptime", 5.0),
        ]
        .into_iter()
        .collect();

        let entities = build_entities(&descriptions, &entry(), &snapshot);

        assert_eq!(
            unique_ids(&entities),
            vec!["abc123-A", "abc123-Temp", "abc123-V", "abc123-W"]
        );
        assert!(entities.iter().all(|entity| !entity.is_writable()));
    }

    #[test]
    fn three_phase_device_gets_totals_numbers_and_switch() {
        let descriptions = Descriptions::load().unwrap();
        let snapshot: Snapshot = [
            ("V1", 230.0),
            ("A1", 1.0),
            ("W1", 100.0),
            ("Wh1", 10.0),
            ("V2", 231.0),
            ("OUT", 0.0),
        ]
        .into_iter()
        .collect();

        let entities = build_entities(&descriptions, &entry(), &snapshot);

        assert_eq!(
            unique_ids(&entities),
            vec![
                "abc123-A1",
                "abc123-V1",
                "abc123-V2",
                "abc123-W1",
                "abc123-Wh1",
                "abc123-A",
                "abc123-W",
                "abc123-rW",
                "abc123-Wh",
                "abc123-rWh",
                "abc123-Wh1",
                "abc123-OUT",
            ]
        );
    }

    #[test]
    fn entity_ids_are_unique_across_platforms() {
        let descriptions = Descriptions::load().unwrap();
        let snapshot: Snapshot = [
            ("A", 6.0),
            ("W", 900.0),
            ("Wh", 10.0),
            ("A1", 2.0),
            ("A2", 2.0),
            ("A3", 2.0),
            ("OUT", 1.0),
        ]
        .into_iter()
        .collect();
        let entities = build_entities(&descriptions, &entry(), &snapshot);

        let mut ids: Vec<String> = entities.iter().map(Entity::entity_id).collect();
        let total = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), total);
        assert!(ids.contains(&"sensor.abc123-W".to_string()));
        assert!(ids.contains(&"phase_total.abc123-W".to_string()));
        assert!(ids.contains(&"number.abc123-Wh".to_string()));
        assert!(ids.contains(&"switch.abc123-OUT".to_string()));
    }

    #[test]
    fn names_carry_index_suffix() {
        let descriptions = Descriptions::load().unwrap();
        let snapshot: Snapshot = [("PF2", 0.9), ("Wh", 1.0), ("T5", 21.0), ("rWh3", 2.0)]
            .into_iter()
            .collect();

        let names: Vec<String> = build_entities(&descriptions, &entry(), &snapshot)
            .into_iter()
            .filter(|entity| matches!(entity.kind, EntityKind::Sensor(_)))
            .map(|entity| entity.name)
            .collect();

        assert_eq!(
            names,
            vec!["Power factor 2", "Point 5", "Consumption", "Return 3"]
        );
    }

    #[test]
    fn phase_total_sums_all_three_phases() {
        let descriptions = Descriptions::load().unwrap();
        let snapshot: Snapshot = [("A1", 1.0), ("A2", 2.5), ("A3", 0.5), ("W1", 10.0)]
            .into_iter()
            .collect();
        let entities = build_entities(&descriptions, &entry(), &snapshot);

        let total_current = entities
            .iter()
            .find(|entity| entity.name == "Total current")
            .unwrap();
        assert_eq!(total_current.state(&snapshot), EntityState::Value(4.0));

        // W2 and W3 are missing, and an expired snapshot is empty.
        let total_power = entities
            .iter()
            .find(|entity| entity.name == "Total power")
            .unwrap();
        assert_eq!(total_power.state(&snapshot), EntityState::Unavailable);
        assert_eq!(
            total_current.state(&Snapshot::new()),
            EntityState::Unavailable
        );
    }

    #[test]
    fn switch_state_reads_out_key() {
        let descriptions = Descriptions::load().unwrap();
        let mut snapshot: Snapshot = [("OUT", 1.0)].into_iter().collect();
        let entities = build_entities(&descriptions, &entry(), &snapshot);
        let switch = &entities[0];

        assert_eq!(switch.state(&snapshot), EntityState::Switch(true));
        snapshot.insert("OUT", 0.0);
        assert_eq!(switch.state(&snapshot), EntityState::Switch(false));
        assert_eq!(switch.state(&Snapshot::new()), EntityState::Unavailable);
    }

    #[test]
    fn device_info_points_at_device_page() {
        let info = DeviceInfo::for_entry(&entry());

        assert_eq!(info.identifiers, ("smart_maic", "abc123".to_string()));
        assert_eq!(info.manufacturer, "Smart MAIC");
        assert_eq!(info.model, "D103");
        assert_eq!(info.configuration_url, "http://192.168.1.50");
    }
}
