pub mod config;
pub mod engine;
pub mod topics;
pub mod types;

pub use config::{
    build, find_duplicate, validate, ConfigError, EntityLookup, EntryRecord, RawConfig,
    ThermostatConfig,
};
pub use engine::{decide, parse_temperature, Command, Decision, RuntimeState, ThermostatEngine};
pub use topics::*;
pub use types::{ClimateState, FanMode, HvacAction, HvacMode};
