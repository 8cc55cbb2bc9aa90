use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::Serialize;
use thiserror::Error;

use crate::types::{DeviceClass, NumberMode, StateClass, Unit};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptionError {
    #[error("unknown metric key {0:?}")]
    UnknownKey(String),
    #[error("metric {kind:?} does not accept index {index:?}")]
    InvalidIndex { kind: MetricKind, index: Option<u8> },
    #[error("duplicate description for key {0:?}")]
    Duplicate(String),
}

/// Every metric the Smart MAIC firmware is known to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Voltage,
    Current,
    Power,
    ReturnPower,
    Consumption,
    Return,
    PowerFactor,
    Point,
    Channel,
    TotalChannel,
    Adc,
    DeviceTemperature,
    DrySwitch,
}

impl MetricKind {
    const ALL: [MetricKind; 13] = [
        Self::Voltage,
        Self::Current,
        Self::Power,
        Self::ReturnPower,
        Self::Consumption,
        Self::Return,
        Self::PowerFactor,
        Self::Point,
        Self::Channel,
        Self::TotalChannel,
        Self::Adc,
        Self::DeviceTemperature,
        Self::DrySwitch,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            Self::Voltage => "V",
            Self::Current => "A",
            Self::Power => "W",
            Self::ReturnPower => "rW",
            Self::Consumption => "Wh",
            Self::Return => "rWh",
            Self::PowerFactor => "PF",
            Self::Point => "T",
            Self::Channel => "Ch",
            Self::TotalChannel => "TCh",
            Self::Adc => "ADC",
            Self::DeviceTemperature => "Temp",
            Self::DrySwitch => "OUT",
        }
    }

    pub fn translation_key(self) -> &'static str {
        match self {
            Self::Voltage => "voltage",
            Self::Current => "current",
            Self::Power => "power",
            Self::ReturnPower => "return_power",
            Self::Consumption => "consumption",
            Self::Return => "return",
            Self::PowerFactor => "power_factor",
            Self::Point => "point",
            Self::Channel => "channel",
            Self::TotalChannel => "total_channel",
            Self::Adc => "adc",
            Self::DeviceTemperature => "device_temperature",
            Self::DrySwitch => "dry_switch",
        }
    }

    fn accepts(self, index: Option<u8>) -> bool {
        match self {
            Self::Voltage
            | Self::Current
            | Self::Power
            | Self::ReturnPower
            | Self::Consumption
            | Self::Return
            | Self::PowerFactor => matches!(index, None | Some(1..=3)),
            Self::Point => matches!(index, Some(1..=5)),
            Self::Channel | Self::TotalChannel => matches!(index, Some(1..=2)),
            Self::Adc | Self::DeviceTemperature | Self::DrySwitch => index.is_none(),
        }
    }
}

/// A metric plus its phase, point or channel index, e.g. `Wh3` or `T5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    pub kind: MetricKind,
    pub index: Option<u8>,
}

impl MetricKey {
    pub fn new(kind: MetricKind, index: Option<u8>) -> Result<Self, DescriptionError> {
        if !kind.accepts(index) {
            return Err(DescriptionError::InvalidIndex { kind, index });
        }
        Ok(Self { kind, index })
    }

    /// Index digit used as a display-name suffix.
    pub fn suffix(&self) -> Option<u8> {
        self.index.filter(|index| (1..=5).contains(index))
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}{index}", self.kind.prefix()),
            None => f.write_str(self.kind.prefix()),
        }
    }
}

impl FromStr for MetricKey {
    type Err = DescriptionError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let split = key
            .char_indices()
            .rev()
            .take_while(|(_, c)| c.is_ascii_digit())
            .last()
            .map(|(at, _)| at)
            .unwrap_or(key.len());
        let (prefix, digits) = key.split_at(split);

        let kind = MetricKind::ALL
            .into_iter()
            .find(|kind| kind.prefix() == prefix)
            .ok_or_else(|| DescriptionError::UnknownKey(key.to_string()))?;
        let index = if digits.is_empty() {
            None
        } else {
            Some(
                digits
                    .parse::<u8>()
                    .map_err(|_| DescriptionError::UnknownKey(key.to_string()))?,
            )
        };

        Self::new(kind, index)
    }
}

impl Serialize for MetricKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorDescription {
    pub key: MetricKey,
    pub translation_key: &'static str,
    pub device_class: Option<DeviceClass>,
    pub state_class: Option<StateClass>,
    pub unit: Option<Unit>,
    pub display_precision: Option<u8>,
    pub enabled_by_default: bool,
}

/// Sum of the three phase values of `base` on three-phase devices.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseTotalDescription {
    pub base: MetricKind,
    pub translation_key: &'static str,
    pub device_class: DeviceClass,
    pub state_class: StateClass,
    pub unit: Unit,
    pub display_precision: u8,
    pub enabled_by_default: bool,
}

impl PhaseTotalDescription {
    pub fn key(&self) -> MetricKey {
        MetricKey {
            kind: self.base,
            index: None,
        }
    }

    pub fn phase_keys(&self) -> [MetricKey; 3] {
        [1, 2, 3].map(|phase| MetricKey {
            kind: self.base,
            index: Some(phase),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NumberDescription {
    pub key: MetricKey,
    pub translation_key: &'static str,
    pub device_class: DeviceClass,
    pub mode: NumberMode,
    pub unit: Unit,
    pub min_value: f64,
    pub max_value: f64,
    pub enabled_by_default: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchDescription {
    pub key: MetricKey,
    pub translation_key: &'static str,
    pub icon: &'static str,
}

/// Static entity metadata keyed by the device vocabulary.
#[derive(Debug, Clone)]
pub struct Descriptions {
    sensors: BTreeMap<String, SensorDescription>,
    phase_totals: Vec<PhaseTotalDescription>,
    numbers: BTreeMap<String, NumberDescription>,
    switches: BTreeMap<String, SwitchDescription>,
}

impl Descriptions {
    /// Builds the tables and rejects duplicate or malformed keys.
    pub fn load() -> Result<Self, DescriptionError> {
        let mut sensors = Vec::new();
        for phase in [None, Some(1), Some(2), Some(3)] {
            sensors.extend(phase_sensors(phase)?);
        }
        for point in 1..=5 {
            sensors.push(plain_sensor(MetricKind::Point, Some(point))?);
        }
        for channel in 1..=2 {
            sensors.push(plain_sensor(MetricKind::Channel, Some(channel))?);
            sensors.push(plain_sensor(MetricKind::TotalChannel, Some(channel))?);
        }
        sensors.push(plain_sensor(MetricKind::Adc, None)?);
        sensors.push(SensorDescription {
            key: MetricKey::new(MetricKind::DeviceTemperature, None)?,
            translation_key: MetricKind::DeviceTemperature.translation_key(),
            device_class: Some(DeviceClass::Temperature),
            state_class: Some(StateClass::Measurement),
            unit: Some(Unit::Celsius),
            display_precision: Some(0),
            enabled_by_default: true,
        });

        let mut numbers = Vec::new();
        for phase in [None, Some(1), Some(2), Some(3)] {
            numbers.push(NumberDescription {
                key: MetricKey::new(MetricKind::Consumption, phase)?,
                translation_key: MetricKind::Consumption.translation_key(),
                device_class: DeviceClass::Energy,
                mode: NumberMode::Box,
                unit: Unit::WattHour,
                min_value: 0.0,
                max_value: i64::MAX as f64,
                enabled_by_default: false,
            });
        }

        let switches = vec![SwitchDescription {
            key: MetricKey::new(MetricKind::DrySwitch, None)?,
            translation_key: MetricKind::DrySwitch.translation_key(),
            icon: "mdi:home-switch",
        }];

        Ok(Self {
            sensors: index_by_key(sensors, |description| description.key)?,
            phase_totals: phase_totals(),
            numbers: index_by_key(numbers, |description| description.key)?,
            switches: index_by_key(switches, |description| description.key)?,
        })
    }

    pub fn sensor(&self, key: &str) -> Option<&SensorDescription> {
        self.sensors.get(key)
    }

    pub fn number(&self, key: &str) -> Option<&NumberDescription> {
        self.numbers.get(key)
    }

    pub fn switch(&self, key: &str) -> Option<&SwitchDescription> {
        self.switches.get(key)
    }

    pub fn phase_totals(&self) -> &[PhaseTotalDescription] {
        &self.phase_totals
    }

    pub fn sensor_keys(&self) -> impl Iterator<Item = &str> {
        self.sensors.keys().map(String::as_str)
    }
}

fn index_by_key<T>(
    items: Vec<T>,
    key: impl Fn(&T) -> MetricKey,
) -> Result<BTreeMap<String, T>, DescriptionError> {
    let mut table = BTreeMap::new();
    for item in items {
        let name = key(&item).to_string();
        if table.contains_key(&name) {
            return Err(DescriptionError::Duplicate(name));
        }
        table.insert(name, item);
    }
    Ok(table)
}

fn phase_sensors(phase: Option<u8>) -> Result<Vec<SensorDescription>, DescriptionError> {
    let electrical = |kind: MetricKind,
                      device_class: DeviceClass,
                      state_class: StateClass,
                      unit: Option<Unit>,
                      precision: u8,
                      enabled: bool| {
        Ok::<_, DescriptionError>(SensorDescription {
            key: MetricKey::new(kind, phase)?,
            translation_key: kind.translation_key(),
            device_class: Some(device_class),
            state_class: Some(state_class),
            unit,
            display_precision: Some(precision),
            enabled_by_default: enabled,
        })
    };

    Ok(vec![
        electrical(
            MetricKind::Voltage,
            DeviceClass::Voltage,
            StateClass::Measurement,
            Some(Unit::Volt),
            2,
            true,
        )?,
        electrical(
            MetricKind::Current,
            DeviceClass::Current,
            StateClass::Measurement,
            Some(Unit::Ampere),
            2,
            true,
        )?,
        electrical(
            MetricKind::Power,
            DeviceClass::Power,
            StateClass::Measurement,
            Some(Unit::Watt),
            0,
            true,
        )?,
        electrical(
            MetricKind::ReturnPower,
            DeviceClass::Power,
            StateClass::Measurement,
            Some(Unit::Watt),
            0,
            false,
        )?,
        electrical(
            MetricKind::Consumption,
            DeviceClass::Energy,
            StateClass::TotalIncreasing,
            Some(Unit::WattHour),
            0,
            true,
        )?,
        electrical(
            MetricKind::Return,
            DeviceClass::Energy,
            StateClass::Total,
            Some(Unit::WattHour),
            0,
            false,
        )?,
        electrical(
            MetricKind::PowerFactor,
            DeviceClass::PowerFactor,
            StateClass::Measurement,
            None,
            2,
            true,
        )?,
    ])
}

fn plain_sensor(
    kind: MetricKind,
    index: Option<u8>,
) -> Result<SensorDescription, DescriptionError> {
    Ok(SensorDescription {
        key: MetricKey::new(kind, index)?,
        translation_key: kind.translation_key(),
        device_class: None,
        state_class: Some(StateClass::Measurement),
        unit: None,
        display_precision: None,
        enabled_by_default: true,
    })
}

fn phase_totals() -> Vec<PhaseTotalDescription> {
    let total = |base, translation_key, device_class, state_class, unit, precision, enabled| {
        PhaseTotalDescription {
            base,
            translation_key,
            device_class,
            state_class,
            unit,
            display_precision: precision,
            enabled_by_default: enabled,
        }
    };

    vec![
        total(
            MetricKind::Current,
            "total_current",
            DeviceClass::Current,
            StateClass::Measurement,
            Unit::Ampere,
            2,
            true,
        ),
        total(
            MetricKind::Power,
            "total_power",
            DeviceClass::Power,
            StateClass::Measurement,
            Unit::Watt,
            0,
            true,
        ),
        total(
            MetricKind::ReturnPower,
            "total_return_power",
            DeviceClass::Power,
            StateClass::Measurement,
            Unit::Watt,
            0,
            false,
        ),
        total(
            MetricKind::Consumption,
            "total_consumption",
            DeviceClass::Energy,
            StateClass::TotalIncreasing,
            Unit::WattHour,
            0,
            true,
        ),
        total(
            MetricKind::Return,
            "total_return",
            DeviceClass::Energy,
            StateClass::Total,
            Unit::WattHour,
            0,
            false,
        ),
    ]
}
