use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::HvacMode;

pub const DEFAULT_MIN_TEMP: f32 = 7.0;
pub const DEFAULT_MAX_TEMP: f32 = 35.0;
pub const DEFAULT_TARGET_TEMP: f32 = 22.0;
pub const DEFAULT_TEMP_STEP: f32 = 0.5;

pub const FIELD_CURRENT_TEMPERATURE: &str = "current_temperature_entity_id";
pub const FIELD_FAN: &str = "fan_entity_id";

/// Resolves entity references against the host's registry at validation
/// time. The controller backs this with its entity-state mirror.
pub trait EntityLookup {
    fn entity_exists(&self, entity_id: &str) -> bool;
}

impl EntityLookup for HashMap<String, String> {
    fn entity_exists(&self, entity_id: &str) -> bool {
        self.contains_key(entity_id)
    }
}

/// One layer of user-supplied configuration: the setup wizard writes the
/// `data` layer, the options flow writes the `options` layer. Unset fields
/// fall through to the other layer, then to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub current_temperature_entity_id: Option<String>,
    pub fan_entity_id: Option<String>,
    pub cooling_switches: Option<Vec<String>>,
    pub heating_switches: Option<Vec<String>>,
    pub min_temp: Option<f32>,
    pub max_temp: Option<f32>,
    pub target_temp: Option<f32>,
    pub temp_step: Option<f32>,
}

impl RawConfig {
    /// Field-by-field overlay. A field set in `overlay` always masks the
    /// same field in `base`.
    pub fn merge(base: &RawConfig, overlay: &RawConfig) -> RawConfig {
        RawConfig {
            current_temperature_entity_id: overlay
                .current_temperature_entity_id
                .clone()
                .or_else(|| base.current_temperature_entity_id.clone()),
            fan_entity_id: overlay
                .fan_entity_id
                .clone()
                .or_else(|| base.fan_entity_id.clone()),
            cooling_switches: overlay
                .cooling_switches
                .clone()
                .or_else(|| base.cooling_switches.clone()),
            heating_switches: overlay
                .heating_switches
                .clone()
                .or_else(|| base.heating_switches.clone()),
            min_temp: overlay.min_temp.or(base.min_temp),
            max_temp: overlay.max_temp.or(base.max_temp),
            target_temp: overlay.target_temp.or(base.target_temp),
            temp_step: overlay.temp_step.or(base.temp_step),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("entity {entity_id:?} for {field} does not exist")]
    EntityNotFound {
        field: &'static str,
        entity_id: String,
    },
    #[error("{0}")]
    InvalidRange(&'static str),
    #[error("a thermostat for this sensor and fan pair already exists")]
    AlreadyConfigured,
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::EntityNotFound { .. } => "entity_not_found",
            Self::InvalidRange(_) => "invalid_range",
            Self::AlreadyConfigured => "already_configured",
        }
    }

    /// The form field an error should be attached to, when it has one.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::EntityNotFound { field, .. } => Some(field),
            Self::InvalidRange(_) | Self::AlreadyConfigured => None,
        }
    }
}

/// Canonical configuration, immutable once built. Reconfiguration replaces
/// the whole record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermostatConfig {
    pub current_temperature_entity_id: String,
    pub fan_entity_id: String,
    pub cooling_switches: Vec<String>,
    pub heating_switches: Vec<String>,
    pub min_temp: f32,
    pub max_temp: f32,
    pub target_temp: f32,
    pub temp_step: f32,
}

impl ThermostatConfig {
    /// OFF is always available; COOL and HEAT only with switches to drive.
    pub fn hvac_modes(&self) -> Vec<HvacMode> {
        let mut modes = vec![HvacMode::Off];
        if !self.cooling_switches.is_empty() {
            modes.push(HvacMode::Cool);
        }
        if !self.heating_switches.is_empty() {
            modes.push(HvacMode::Heat);
        }
        modes
    }

    pub fn supports(&self, mode: HvacMode) -> bool {
        match mode {
            HvacMode::Off => true,
            HvacMode::Cool => !self.cooling_switches.is_empty(),
            HvacMode::Heat => !self.heating_switches.is_empty(),
        }
    }

    /// Every entity whose state changes this thermostat reacts to.
    pub fn watched_entities(&self) -> Vec<String> {
        let mut entities = vec![
            self.current_temperature_entity_id.clone(),
            self.fan_entity_id.clone(),
        ];
        entities.extend(self.cooling_switches.iter().cloned());
        entities.extend(self.heating_switches.iter().cloned());
        entities
    }
}

/// Defaults and range rules only. Used when re-hydrating persisted entries
/// at startup, before any entity state has been mirrored.
pub fn build(raw: &RawConfig) -> Result<ThermostatConfig, ConfigError> {
    let min_temp = raw.min_temp.unwrap_or(DEFAULT_MIN_TEMP);
    let max_temp = raw.max_temp.unwrap_or(DEFAULT_MAX_TEMP);
    if !min_temp.is_finite() || !max_temp.is_finite() {
        return Err(ConfigError::InvalidRange(
            "min_temp and max_temp must be finite numbers",
        ));
    }
    if min_temp >= max_temp {
        return Err(ConfigError::InvalidRange(
            "min_temp must be below max_temp",
        ));
    }

    let temp_step = raw.temp_step.unwrap_or(DEFAULT_TEMP_STEP);
    if !temp_step.is_finite() || temp_step <= 0.0 {
        return Err(ConfigError::InvalidRange(
            "temp_step must be greater than zero",
        ));
    }

    let target_temp = raw.target_temp.unwrap_or(DEFAULT_TARGET_TEMP);
    if !target_temp.is_finite() {
        return Err(ConfigError::InvalidRange(
            "target_temp must be a finite number",
        ));
    }

    Ok(ThermostatConfig {
        current_temperature_entity_id: raw
            .current_temperature_entity_id
            .clone()
            .unwrap_or_default(),
        fan_entity_id: raw.fan_entity_id.clone().unwrap_or_default(),
        cooling_switches: raw.cooling_switches.clone().unwrap_or_default(),
        heating_switches: raw.heating_switches.clone().unwrap_or_default(),
        min_temp,
        max_temp,
        target_temp: target_temp.clamp(min_temp, max_temp),
        temp_step,
    })
}

/// Full validation for the setup wizard and options flow: entity
/// resolution first (field errors), then range rules. Pure — subscriptions
/// happen later, when the instance is spawned.
pub fn validate(
    raw: &RawConfig,
    entities: &impl EntityLookup,
) -> Result<ThermostatConfig, ConfigError> {
    let sensor = raw
        .current_temperature_entity_id
        .clone()
        .unwrap_or_default();
    if !entities.entity_exists(&sensor) {
        return Err(ConfigError::EntityNotFound {
            field: FIELD_CURRENT_TEMPERATURE,
            entity_id: sensor,
        });
    }

    let fan = raw.fan_entity_id.clone().unwrap_or_default();
    if !entities.entity_exists(&fan) {
        return Err(ConfigError::EntityNotFound {
            field: FIELD_FAN,
            entity_id: fan,
        });
    }

    build(raw)
}

/// A persisted configuration entry: the setup-time `data` layer plus the
/// live-updatable `options` layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub entry_id: String,
    pub title: String,
    pub data: RawConfig,
    #[serde(default)]
    pub options: RawConfig,
}

impl EntryRecord {
    pub fn merged(&self) -> RawConfig {
        RawConfig::merge(&self.data, &self.options)
    }
}

/// Two entries are duplicates when their merged sensor and fan refs are
/// identical. `exclude` skips the entry currently being reconfigured.
pub fn find_duplicate<'a>(
    records: &'a [EntryRecord],
    sensor: &str,
    fan: &str,
    exclude: Option<&str>,
) -> Option<&'a EntryRecord> {
    records.iter().find(|record| {
        if exclude == Some(record.entry_id.as_str()) {
            return false;
        }
        let merged = record.merged();
        merged.current_temperature_entity_id.as_deref() == Some(sensor)
            && merged.fan_entity_id.as_deref() == Some(fan)
    })
}
