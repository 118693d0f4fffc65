use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HvacMode {
    Off,
    Cool,
    Heat,
}

impl HvacMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Cool => "cool",
            Self::Heat => "heat",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "off" => Some(Self::Off),
            "cool" => Some(Self::Cool),
            "heat" => Some(Self::Heat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HvacAction {
    Off,
    Idle,
    Cooling,
    Heating,
}

impl HvacAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Idle => "idle",
            Self::Cooling => "cooling",
            Self::Heating => "heating",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanMode {
    Auto,
    Low,
    Medium,
    High,
}

impl FanMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Snapshot of the observable climate attributes, published to the host and
/// returned by the HTTP API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClimateState {
    pub hvac_mode: HvacMode,
    pub hvac_action: HvacAction,
    pub hvac_modes: Vec<HvacMode>,
    pub current_temperature: Option<f32>,
    pub target_temperature: f32,
    pub fan_mode: FanMode,
    pub min_temp: f32,
    pub max_temp: f32,
    pub temp_step: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_strings_round_trip() {
        for mode in [HvacMode::Off, HvacMode::Cool, HvacMode::Heat] {
            assert_eq!(HvacMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(HvacMode::parse("HEAT"), Some(HvacMode::Heat));
        assert_eq!(HvacMode::parse("dry"), None);
    }

    #[test]
    fn fan_mode_strings_round_trip() {
        for mode in [FanMode::Auto, FanMode::Low, FanMode::Medium, FanMode::High] {
            assert_eq!(FanMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(FanMode::parse("turbo"), None);
    }
}
