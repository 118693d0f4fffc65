use crate::{
    config::ThermostatConfig,
    types::{ClimateState, FanMode, HvacAction, HvacMode},
};

// Readings outside this window are sensor glitches, not temperatures.
const MIN_PLAUSIBLE_TEMP: f32 = -50.0;
const MAX_PLAUSIBLE_TEMP: f32 = 100.0;

/// Maps a raw sensor payload to a reading. Anything non-numeric
/// ("unknown", "unavailable"), non-finite, or implausible counts as no
/// reading at all.
pub fn parse_temperature(raw: &str) -> Option<f32> {
    let value = raw.trim().parse::<f32>().ok()?;
    if (MIN_PLAUSIBLE_TEMP..=MAX_PLAUSIBLE_TEMP).contains(&value) {
        Some(value)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeState {
    pub current_temperature: Option<f32>,
    pub target_temperature: f32,
    pub hvac_mode: HvacMode,
    pub fan_mode: FanMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SwitchOn(String),
    SwitchOff(String),
    FanOn(String, FanMode),
    FanOff(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: HvacAction,
    pub commands: Vec<Command>,
}

/// The bang-bang control law. Pure and total: every input produces an
/// action and the full desired actuator set, so re-applying a decision
/// converges actuator state no matter what previously failed.
pub fn decide(state: &RuntimeState, config: &ThermostatConfig) -> Decision {
    if state.hvac_mode == HvacMode::Off {
        let mut commands = switch_commands(config, false, false);
        commands.push(Command::FanOff(config.fan_entity_id.clone()));
        return Decision {
            action: HvacAction::Off,
            commands,
        };
    }

    let demand = if !config.supports(state.hvac_mode) {
        false
    } else {
        match (state.hvac_mode, state.current_temperature) {
            (HvacMode::Cool, Some(current)) => current > state.target_temperature,
            (HvacMode::Heat, Some(current)) => current < state.target_temperature,
            // No reading yet: never heat or cool blind.
            _ => false,
        }
    };

    if demand {
        let cooling = state.hvac_mode == HvacMode::Cool;
        let mut commands = switch_commands(config, cooling, !cooling);
        commands.push(Command::FanOn(config.fan_entity_id.clone(), state.fan_mode));
        Decision {
            action: if cooling {
                HvacAction::Cooling
            } else {
                HvacAction::Heating
            },
            commands,
        }
    } else {
        let mut commands = switch_commands(config, false, false);
        commands.push(match state.fan_mode {
            FanMode::Auto => Command::FanOff(config.fan_entity_id.clone()),
            mode => Command::FanOn(config.fan_entity_id.clone(), mode),
        });
        Decision {
            action: HvacAction::Idle,
            commands,
        }
    }
}

fn switch_commands(config: &ThermostatConfig, cooling_on: bool, heating_on: bool) -> Vec<Command> {
    let mut commands =
        Vec::with_capacity(config.cooling_switches.len() + config.heating_switches.len() + 1);
    for entity_id in &config.cooling_switches {
        commands.push(if cooling_on {
            Command::SwitchOn(entity_id.clone())
        } else {
            Command::SwitchOff(entity_id.clone())
        });
    }
    for entity_id in &config.heating_switches {
        commands.push(if heating_on {
            Command::SwitchOn(entity_id.clone())
        } else {
            Command::SwitchOff(entity_id.clone())
        });
    }
    commands
}

#[derive(Debug, Clone)]
pub struct ThermostatEngine {
    config: ThermostatConfig,
    state: RuntimeState,
    action: HvacAction,
}

impl ThermostatEngine {
    pub fn new(config: ThermostatConfig) -> Self {
        let state = RuntimeState {
            current_temperature: None,
            target_temperature: config.target_temp,
            hvac_mode: HvacMode::Off,
            fan_mode: FanMode::Auto,
        };
        Self {
            config,
            state,
            action: HvacAction::Off,
        }
    }

    /// Rebuild after reconfiguration: carry the user-visible settings
    /// forward, re-checked against the new configuration.
    pub fn restore(config: ThermostatConfig, prior: &ClimateState) -> Self {
        let mut engine = Self::new(config);
        engine.state.fan_mode = prior.fan_mode;
        if engine.config.supports(prior.hvac_mode) {
            engine.state.hvac_mode = prior.hvac_mode;
        }
        engine.state.target_temperature = prior
            .target_temperature
            .clamp(engine.config.min_temp, engine.config.max_temp);
        engine
    }

    pub fn config(&self) -> &ThermostatConfig {
        &self.config
    }

    pub fn hvac_action(&self) -> HvacAction {
        self.action
    }

    pub fn update_current_temperature(&mut self, reading: Option<f32>) -> Vec<Command> {
        self.state.current_temperature = reading;
        self.run_decision()
    }

    /// Re-issue the current decision without changing state. Actuator and
    /// fan state notifications reconcile through this.
    pub fn refresh(&mut self) -> Vec<Command> {
        self.run_decision()
    }

    pub fn set_hvac_mode(&mut self, mode: HvacMode) -> Vec<Command> {
        // Stale clients can request a mode with no switches behind it.
        if !self.config.supports(mode) {
            return Vec::new();
        }
        self.state.hvac_mode = mode;
        self.run_decision()
    }

    pub fn set_target_temperature(&mut self, value: f32) -> Vec<Command> {
        if !value.is_finite() {
            return Vec::new();
        }
        self.state.target_temperature = self.quantize(value);
        self.run_decision()
    }

    pub fn set_fan_mode(&mut self, mode: FanMode) -> Vec<Command> {
        self.state.fan_mode = mode;
        self.run_decision()
    }

    /// No explicit mode requested: first available non-OFF mode, COOL
    /// before HEAT when both are configured.
    pub fn turn_on(&mut self) -> Vec<Command> {
        let mode = if !self.config.cooling_switches.is_empty() {
            HvacMode::Cool
        } else if !self.config.heating_switches.is_empty() {
            HvacMode::Heat
        } else {
            return Vec::new();
        };
        self.set_hvac_mode(mode)
    }

    pub fn turn_off(&mut self) -> Vec<Command> {
        self.set_hvac_mode(HvacMode::Off)
    }

    pub fn climate_state(&self) -> ClimateState {
        ClimateState {
            hvac_mode: self.state.hvac_mode,
            hvac_action: self.action,
            hvac_modes: self.config.hvac_modes(),
            current_temperature: self.state.current_temperature,
            target_temperature: self.state.target_temperature,
            fan_mode: self.state.fan_mode,
            min_temp: self.config.min_temp,
            max_temp: self.config.max_temp,
            temp_step: self.config.temp_step,
        }
    }

    fn quantize(&self, value: f32) -> f32 {
        let step = self.config.temp_step;
        let rounded = (value / step).round() * step;
        rounded.clamp(self.config.min_temp, self.config.max_temp)
    }

    fn run_decision(&mut self) -> Vec<Command> {
        let decision = decide(&self.state, &self.config);
        self.action = decision.action;
        decision.commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cooling_config() -> ThermostatConfig {
        ThermostatConfig {
            current_temperature_entity_id: "sensor.temperature".to_string(),
            fan_entity_id: "fan.test_fan".to_string(),
            cooling_switches: vec!["switch.cool1".to_string()],
            heating_switches: Vec::new(),
            min_temp: 7.0,
            max_temp: 35.0,
            target_temp: 22.0,
            temp_step: 0.5,
        }
    }

    fn heating_config() -> ThermostatConfig {
        ThermostatConfig {
            cooling_switches: Vec::new(),
            heating_switches: vec!["switch.heat1".to_string()],
            ..cooling_config()
        }
    }

    fn dual_config() -> ThermostatConfig {
        ThermostatConfig {
            cooling_switches: vec!["switch.cool1".to_string(), "switch.cool2".to_string()],
            heating_switches: vec!["switch.heat1".to_string()],
            ..cooling_config()
        }
    }

    fn turns_anything_on(commands: &[Command]) -> bool {
        commands
            .iter()
            .any(|command| matches!(command, Command::SwitchOn(_) | Command::FanOn(..)))
    }

    #[test]
    fn cooling_idles_below_target() {
        let mut engine = ThermostatEngine::new(cooling_config());
        engine.update_current_temperature(Some(20.0));
        engine.set_hvac_mode(HvacMode::Cool);

        assert_eq!(engine.hvac_action(), HvacAction::Idle);
    }

    #[test]
    fn cooling_starts_above_target() {
        let mut engine = ThermostatEngine::new(dual_config());
        engine.update_current_temperature(Some(24.0));
        let commands = engine.set_hvac_mode(HvacMode::Cool);

        assert_eq!(engine.hvac_action(), HvacAction::Cooling);
        assert!(commands.contains(&Command::SwitchOn("switch.cool1".to_string())));
        assert!(commands.contains(&Command::SwitchOn("switch.cool2".to_string())));
        assert!(commands.contains(&Command::SwitchOff("switch.heat1".to_string())));
        assert!(commands.contains(&Command::FanOn("fan.test_fan".to_string(), FanMode::Auto)));
    }

    #[test]
    fn heating_starts_below_target() {
        let mut engine = ThermostatEngine::new(heating_config());
        engine.update_current_temperature(Some(20.0));
        let commands = engine.set_hvac_mode(HvacMode::Heat);

        assert_eq!(engine.hvac_action(), HvacAction::Heating);
        assert!(commands.contains(&Command::SwitchOn("switch.heat1".to_string())));
        assert!(commands.contains(&Command::FanOn("fan.test_fan".to_string(), FanMode::Auto)));
    }

    #[test]
    fn unknown_reading_forces_idle() {
        let mut engine = ThermostatEngine::new(dual_config());
        let commands = engine.set_hvac_mode(HvacMode::Heat);

        assert_eq!(engine.hvac_action(), HvacAction::Idle);
        assert!(!turns_anything_on(&commands));
    }

    #[test]
    fn losing_the_sensor_stops_active_cooling() {
        let mut engine = ThermostatEngine::new(cooling_config());
        engine.update_current_temperature(Some(24.0));
        engine.set_hvac_mode(HvacMode::Cool);
        assert_eq!(engine.hvac_action(), HvacAction::Cooling);

        let commands = engine.update_current_temperature(None);

        assert_eq!(engine.hvac_action(), HvacAction::Idle);
        assert!(commands.contains(&Command::SwitchOff("switch.cool1".to_string())));
    }

    #[test]
    fn mode_off_sweeps_everything_off() {
        let mut engine = ThermostatEngine::new(dual_config());
        engine.update_current_temperature(Some(24.0));
        engine.set_hvac_mode(HvacMode::Cool);

        let commands = engine.turn_off();

        assert_eq!(engine.hvac_action(), HvacAction::Off);
        assert!(commands.contains(&Command::SwitchOff("switch.cool1".to_string())));
        assert!(commands.contains(&Command::SwitchOff("switch.cool2".to_string())));
        assert!(commands.contains(&Command::SwitchOff("switch.heat1".to_string())));
        assert!(commands.contains(&Command::FanOff("fan.test_fan".to_string())));
        assert!(!turns_anything_on(&commands));
    }

    #[test]
    fn turn_on_prefers_cooling_over_heating() {
        let mut engine = ThermostatEngine::new(dual_config());
        engine.turn_on();
        assert_eq!(engine.climate_state().hvac_mode, HvacMode::Cool);
    }

    #[test]
    fn turn_on_falls_back_to_heating() {
        let mut engine = ThermostatEngine::new(heating_config());
        engine.turn_on();
        assert_eq!(engine.climate_state().hvac_mode, HvacMode::Heat);
    }

    #[test]
    fn turn_on_without_switches_is_a_noop() {
        let config = ThermostatConfig {
            cooling_switches: Vec::new(),
            heating_switches: Vec::new(),
            ..cooling_config()
        };
        let mut engine = ThermostatEngine::new(config);

        assert!(engine.turn_on().is_empty());
        assert_eq!(engine.climate_state().hvac_mode, HvacMode::Off);
    }

    #[test]
    fn unsupported_mode_is_ignored() {
        let mut engine = ThermostatEngine::new(cooling_config());

        assert!(engine.set_hvac_mode(HvacMode::Heat).is_empty());
        assert_eq!(engine.climate_state().hvac_mode, HvacMode::Off);
    }

    #[test]
    fn target_is_clamped_and_quantized() {
        let mut engine = ThermostatEngine::new(cooling_config());

        engine.set_target_temperature(21.3);
        assert_eq!(engine.climate_state().target_temperature, 21.5);

        engine.set_target_temperature(50.0);
        assert_eq!(engine.climate_state().target_temperature, 35.0);

        engine.set_target_temperature(3.0);
        assert_eq!(engine.climate_state().target_temperature, 7.0);
    }

    #[test]
    fn idle_fan_follows_user_selected_mode() {
        let mut engine = ThermostatEngine::new(cooling_config());
        engine.update_current_temperature(Some(20.0));
        engine.set_hvac_mode(HvacMode::Cool);

        let commands = engine.set_fan_mode(FanMode::Low);
        assert_eq!(engine.hvac_action(), HvacAction::Idle);
        assert!(commands.contains(&Command::FanOn("fan.test_fan".to_string(), FanMode::Low)));

        let commands = engine.set_fan_mode(FanMode::Auto);
        assert!(commands.contains(&Command::FanOff("fan.test_fan".to_string())));
    }

    #[test]
    fn active_fan_uses_the_selected_mode() {
        let mut engine = ThermostatEngine::new(cooling_config());
        engine.set_fan_mode(FanMode::High);
        engine.update_current_temperature(Some(24.0));
        let commands = engine.set_hvac_mode(HvacMode::Cool);

        assert!(commands.contains(&Command::FanOn("fan.test_fan".to_string(), FanMode::High)));
    }

    #[test]
    fn decide_is_pure_and_idempotent() {
        let config = dual_config();
        let state = RuntimeState {
            current_temperature: Some(24.0),
            target_temperature: 22.0,
            hvac_mode: HvacMode::Cool,
            fan_mode: FanMode::Auto,
        };

        let first = decide(&state, &config);
        let second = decide(&state, &config);

        assert_eq!(first, second);
        assert_eq!(first.action, HvacAction::Cooling);
    }

    #[test]
    fn restore_drops_an_unavailable_mode() {
        let mut engine = ThermostatEngine::new(cooling_config());
        engine.update_current_temperature(Some(24.0));
        engine.set_hvac_mode(HvacMode::Cool);
        let prior = engine.climate_state();

        let restored = ThermostatEngine::restore(heating_config(), &prior);

        assert_eq!(restored.climate_state().hvac_mode, HvacMode::Off);
    }

    #[test]
    fn restore_clamps_target_into_new_bounds() {
        let mut engine = ThermostatEngine::new(cooling_config());
        engine.set_hvac_mode(HvacMode::Cool);
        engine.set_target_temperature(28.0);
        engine.set_fan_mode(FanMode::Medium);
        let prior = engine.climate_state();

        let new_config = ThermostatConfig {
            min_temp: 10.0,
            max_temp: 20.0,
            ..cooling_config()
        };
        let restored = ThermostatEngine::restore(new_config, &prior);
        let state = restored.climate_state();

        assert_eq!(state.target_temperature, 20.0);
        assert_eq!(state.fan_mode, FanMode::Medium);
        assert_eq!(state.hvac_mode, HvacMode::Cool);
    }

    #[test]
    fn parse_temperature_rejects_unknown_payloads() {
        assert_eq!(parse_temperature("21.5"), Some(21.5));
        assert_eq!(parse_temperature(" 18 "), Some(18.0));
        assert_eq!(parse_temperature("unknown"), None);
        assert_eq!(parse_temperature("unavailable"), None);
        assert_eq!(parse_temperature(""), None);
        assert_eq!(parse_temperature("NaN"), None);
        assert_eq!(parse_temperature("250"), None);
    }
}
