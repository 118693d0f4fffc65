use std::collections::{HashMap, HashSet};

use rumqttc::{AsyncClient, QoS};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{info, warn};

use fancoil_common::{
    climate_state_topic, entity_command_topic, parse_temperature, ClimateState, Command, FanMode,
    HvacMode, ThermostatConfig, ThermostatEngine, PAYLOAD_OFF, PAYLOAD_ON,
};

#[derive(Debug)]
pub enum ThermostatCommand {
    SetHvacMode(HvacMode),
    SetTemperature(f32),
    SetFanMode(FanMode),
    TurnOn,
    TurnOff,
}

#[derive(Debug)]
enum ThermostatEvent {
    EntityState { entity_id: String, payload: String },
    Command(ThermostatCommand),
    Report(oneshot::Sender<ClimateState>),
}

struct ThermostatHandle {
    watched: HashSet<String>,
    events: mpsc::UnboundedSender<ThermostatEvent>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Owns every running thermostat (keyed by entry id) and the local mirror
/// of the host's entity registry. All creation and destruction goes
/// through here; thermostats never see each other.
pub struct Supervisor {
    mqtt: AsyncClient,
    entities: HashMap<String, String>,
    thermostats: HashMap<String, ThermostatHandle>,
}

impl Supervisor {
    pub fn new(mqtt: AsyncClient) -> Self {
        Self {
            mqtt,
            entities: HashMap::new(),
            thermostats: HashMap::new(),
        }
    }

    /// Last known state of every entity seen on the bus; also serves
    /// entity resolution for the configuration validator.
    pub fn entities(&self) -> &HashMap<String, String> {
        &self.entities
    }

    pub fn handle_entity_state(&mut self, entity_id: &str, payload: String) {
        self.entities.insert(entity_id.to_string(), payload.clone());
        for handle in self.thermostats.values() {
            if handle.watched.contains(entity_id) {
                let _ = handle.events.send(ThermostatEvent::EntityState {
                    entity_id: entity_id.to_string(),
                    payload: payload.clone(),
                });
            }
        }
    }

    pub fn spawn_entry(
        &mut self,
        entry_id: &str,
        config: ThermostatConfig,
        prior: Option<&ClimateState>,
    ) {
        let mut engine = match prior {
            Some(prior) => ThermostatEngine::restore(config, prior),
            None => ThermostatEngine::new(config),
        };

        // Prime from the mirror so the first decision is not blind when a
        // retained sensor state has already arrived.
        let sensor = engine.config().current_temperature_entity_id.clone();
        let reading = self
            .entities
            .get(&sensor)
            .and_then(|raw| parse_temperature(raw));
        let _ = engine.update_current_temperature(reading);

        let handle = spawn_thermostat(entry_id.to_string(), engine, self.mqtt.clone());
        if self
            .thermostats
            .insert(entry_id.to_string(), handle)
            .is_some()
        {
            warn!("replaced a running thermostat for {entry_id}");
        }
    }

    pub async fn remove_entry(&mut self, entry_id: &str) -> bool {
        let Some(handle) = self.thermostats.remove(entry_id) else {
            return false;
        };
        teardown(handle).await;
        true
    }

    /// Full reload for a configuration change. The caller holds the
    /// supervisor lock throughout, so the swap is atomic to observers and
    /// the replacement only starts receiving events once the old instance
    /// has fully stopped.
    pub async fn reload_entry(&mut self, entry_id: &str, config: ThermostatConfig) {
        let prior = self.climate_state(entry_id).await;
        if let Some(handle) = self.thermostats.remove(entry_id) {
            teardown(handle).await;
        }
        self.spawn_entry(entry_id, config, prior.as_ref());
    }

    pub fn send_command(&self, entry_id: &str, command: ThermostatCommand) -> bool {
        self.thermostats
            .get(entry_id)
            .map(|handle| {
                handle
                    .events
                    .send(ThermostatEvent::Command(command))
                    .is_ok()
            })
            .unwrap_or(false)
    }

    /// Queued behind any pending events, so the reply reflects every
    /// command sent before it.
    pub async fn climate_state(&self, entry_id: &str) -> Option<ClimateState> {
        let handle = self.thermostats.get(entry_id)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        handle.events.send(ThermostatEvent::Report(reply_tx)).ok()?;
        reply_rx.await.ok()
    }
}

async fn teardown(handle: ThermostatHandle) {
    // The shutdown signal wins over queued events; anything still in the
    // queue when teardown begins is dropped.
    let _ = handle.shutdown.send(());
    let _ = handle.task.await;
}

fn spawn_thermostat(
    entry_id: String,
    mut engine: ThermostatEngine,
    mqtt: AsyncClient,
) -> ThermostatHandle {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let watched: HashSet<String> = engine.config().watched_entities().into_iter().collect();
    let sensor = engine.config().current_temperature_entity_id.clone();

    let task = tokio::spawn(async move {
        // Converge actuator state once on startup.
        let commands = engine.refresh();
        apply_commands(&mqtt, commands).await;
        publish_climate(&mqtt, &entry_id, &engine.climate_state()).await;

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown_rx => break,
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    let commands = match event {
                        ThermostatEvent::EntityState { entity_id, payload } => {
                            if entity_id == sensor {
                                engine.update_current_temperature(parse_temperature(&payload))
                            } else {
                                // Actuator or fan reported; reconcile.
                                engine.refresh()
                            }
                        }
                        ThermostatEvent::Command(command) => match command {
                            ThermostatCommand::SetHvacMode(mode) => engine.set_hvac_mode(mode),
                            ThermostatCommand::SetTemperature(value) => {
                                engine.set_target_temperature(value)
                            }
                            ThermostatCommand::SetFanMode(mode) => engine.set_fan_mode(mode),
                            ThermostatCommand::TurnOn => engine.turn_on(),
                            ThermostatCommand::TurnOff => engine.turn_off(),
                        },
                        ThermostatEvent::Report(reply) => {
                            let _ = reply.send(engine.climate_state());
                            continue;
                        }
                    };
                    apply_commands(&mqtt, commands).await;
                    publish_climate(&mqtt, &entry_id, &engine.climate_state()).await;
                }
            }
        }

        info!("thermostat {entry_id} stopped");
    });

    ThermostatHandle {
        watched,
        events: event_tx,
        shutdown: shutdown_tx,
        task,
    }
}

async fn apply_commands(mqtt: &AsyncClient, commands: Vec<Command>) {
    for command in commands {
        let (entity_id, payload) = match command {
            Command::SwitchOn(entity_id) => (entity_id, PAYLOAD_ON.to_string()),
            Command::SwitchOff(entity_id) => (entity_id, PAYLOAD_OFF.to_string()),
            Command::FanOn(entity_id, mode) => (entity_id, mode.as_str().to_string()),
            Command::FanOff(entity_id) => (entity_id, PAYLOAD_OFF.to_string()),
        };

        // Fire and forget: the actuator's own state notification is the
        // only acknowledgement acted on, so a failed publish just leaves
        // the next decision cycle to reconcile.
        if let Err(err) = mqtt
            .publish(
                entity_command_topic(&entity_id),
                QoS::AtLeastOnce,
                false,
                payload,
            )
            .await
        {
            warn!("actuator command for {entity_id} failed: {err}");
        }
    }
}

async fn publish_climate(mqtt: &AsyncClient, entry_id: &str, state: &ClimateState) {
    match serde_json::to_vec(state) {
        Ok(body) => {
            if let Err(err) = mqtt
                .publish(climate_state_topic(entry_id), QoS::AtLeastOnce, true, body)
                .await
            {
                warn!("climate state publish for {entry_id} failed: {err}");
            }
        }
        Err(err) => warn!("climate state serialization failed: {err}"),
    }
}
