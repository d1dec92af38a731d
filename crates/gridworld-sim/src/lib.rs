//! The simulation façade: owns one registry and one background worker, and
//! exposes every public operation of the engine.
//!
//! Readers take shared access and raise a pause request so the worker holds
//! off between ticks; writers take exclusive access and are rejected outright
//! while the worker runs. The C-ABI shim marshals these methods 1:1.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use gridworld_core::{
    rebuild_world, EntityId, Event, EventsLog, Registry, RegistryError, TickCounter, TickRunner,
    WorldError,
};
use gridworld_storage::{
    component_spec, component_specs, singleton_spec, singleton_specs, state_from_binary,
    state_from_json, state_to_binary, state_to_json, CodecError,
};

mod command;

/// Callback invoked after each tick once the worker has dropped its lock.
/// Bit 0 of `flags` is set when events occurred that tick. The callback may
/// re-enter read operations on the same simulation.
pub type TickEventCallback = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Errors surfaced across the façade boundary.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("operation cannot be used while the simulation is running")]
    SimulationRunning,
    #[error("unknown entity {0}")]
    UnknownEntity(u64),
    #[error("entity {entity} has no {component} component")]
    MissingComponent { entity: u64, component: String },
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RegistryError> for SimError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownEntity(e) => Self::UnknownEntity(e.raw()),
            RegistryError::MissingComponent { entity, component } => Self::MissingComponent {
                entity: entity.raw(),
                component: component.rsplit("::").next().unwrap_or(component).to_owned(),
            },
            RegistryError::CorruptEntities(detail) => Self::InvalidArgument(detail.to_owned()),
        }
    }
}

impl From<WorldError> for SimError {
    fn from(err: WorldError) -> Self {
        match err {
            WorldError::InvalidDimensions { .. } => Self::InvalidArgument(err.to_string()),
            WorldError::PositionCollision { .. } => Self::Internal(err.to_string()),
        }
    }
}

impl From<CodecError> for SimError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Invalid(detail) => Self::InvalidArgument(detail),
            CodecError::UnknownComponent(name) => {
                Self::InvalidArgument(format!("unknown component name: {name}"))
            }
            CodecError::UnknownSingleton(name) => {
                Self::InvalidArgument(format!("unknown singleton name: {name}"))
            }
            CodecError::Registry(inner) => inner.into(),
            CodecError::World(inner) => inner.into(),
        }
    }
}

struct Shared {
    registry: RwLock<Registry>,
    pause_requests: AtomicUsize,
    pause_mutex: Mutex<()>,
    no_pauses_requested: Condvar,
    stop_requested: AtomicBool,
    running: AtomicBool,
    tick_callback: RwLock<Option<TickEventCallback>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            registry: RwLock::new(Registry::new()),
            pause_requests: AtomicUsize::new(0),
            pause_mutex: Mutex::new(()),
            no_pauses_requested: Condvar::new(),
            stop_requested: AtomicBool::new(false),
            running: AtomicBool::new(false),
            tick_callback: RwLock::new(None),
        }
    }

    fn end_pause(&self) {
        let _guard = self.pause_mutex.lock();
        if self.pause_requests.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.no_pauses_requested.notify_all();
        }
    }

    /// Worker side: block between ticks while any reader holds a pause
    /// request. A stop request also wakes the wait.
    fn wait_for_readers(&self) {
        let mut guard = self.pause_mutex.lock();
        while self.pause_requests.load(Ordering::SeqCst) > 0
            && !self.stop_requested.load(Ordering::SeqCst)
        {
            self.no_pauses_requested.wait(&mut guard);
        }
    }

    fn wake_worker(&self) {
        let _guard = self.pause_mutex.lock();
        self.no_pauses_requested.notify_all();
    }
}

// Decrements the pause counter even if the read closure panics.
struct PauseGuard<'a>(&'a Shared);

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.0.end_pause();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let mut runner = TickRunner::new();
    debug!("simulation worker started");
    loop {
        if shared.stop_requested.load(Ordering::SeqCst) {
            break;
        }
        shared.wait_for_readers();
        if shared.stop_requested.load(Ordering::SeqCst) {
            break;
        }

        let (tick, had_events) = {
            let mut reg = shared.registry.write();
            runner.tick(&mut reg);
            (
                reg.ctx::<TickCounter>().tick,
                !reg.ctx::<EventsLog>().events_last_tick.is_empty(),
            )
        };

        let callback = shared.tick_callback.read();
        if let Some(callback) = callback.as_ref() {
            callback(tick, u64::from(had_events));
        }
    }
    shared.running.store(false, Ordering::SeqCst);
    debug!("simulation worker stopped");
}

/// One simulation: a registry plus the worker that advances it.
pub struct Simulation {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulation {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new()),
            worker: Mutex::new(None),
        }
    }

    // ── Concurrency plumbing ────────────────────────────────────

    fn read<R>(&self, f: impl FnOnce(&Registry) -> R) -> R {
        self.shared.pause_requests.fetch_add(1, Ordering::SeqCst);
        let _pause = PauseGuard(&self.shared);
        let guard = self.shared.registry.read();
        f(&guard)
    }

    fn write<R>(
        &self,
        f: impl FnOnce(&mut Registry) -> Result<R, SimError>,
    ) -> Result<R, SimError> {
        if self.is_running() {
            return Err(SimError::SimulationRunning);
        }
        let mut guard = self.shared.registry.write();
        // The worker may have been started between the check and the lock.
        if self.shared.running.load(Ordering::SeqCst) {
            return Err(SimError::SimulationRunning);
        }
        f(&mut guard)
    }

    // ── Worker control ──────────────────────────────────────────

    /// Spawn the background worker. A no-op when already running. The world
    /// map is rebuilt from Position components first, so externally imposed
    /// state that did not maintain the map is tolerated.
    pub fn start_simulation(&self) -> Result<(), SimError> {
        let mut worker = self.worker.lock();
        if self.shared.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(stale) = worker.take() {
            let _ = stale.join();
        }
        {
            let mut reg = self.shared.registry.write();
            rebuild_world(&mut reg)?;
        }
        self.shared.stop_requested.store(false, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        *worker = Some(std::thread::spawn(move || worker_loop(shared)));
        info!("simulation started");
        Ok(())
    }

    // Caller must hold the control (worker) mutex so the request cannot be
    // clobbered by a concurrent start.
    fn signal_stop(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.shared.wake_worker();
    }

    /// Ask the worker to exit at its next iteration without waiting for it.
    /// Serialized against `start_simulation`/`stop_simulation`.
    pub fn request_stop(&self) {
        let _control = self.worker.lock();
        self.signal_stop();
    }

    /// Request a stop and join the worker.
    pub fn stop_simulation(&self) {
        let mut worker = self.worker.lock();
        self.signal_stop();
        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                warn!("simulation worker panicked");
            }
        }
        self.shared.running.store(false, Ordering::SeqCst);
        info!("simulation stopped");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Register (or clear) the per-tick event callback. Do not call this from
    /// inside the callback itself.
    pub fn set_tick_event_callback(&self, callback: Option<TickEventCallback>) {
        *self.shared.tick_callback.write() = callback;
    }

    // ── Reads ───────────────────────────────────────────────────

    #[must_use]
    pub fn get_tick(&self) -> u64 {
        self.read(|reg| reg.ctx::<TickCounter>().tick)
    }

    /// Serialize the whole state; returns the tick the snapshot was taken at.
    pub fn get_state_json(&self) -> Result<(u64, String), SimError> {
        self.read(|reg| {
            let json = state_to_json(reg)?;
            Ok((reg.ctx::<TickCounter>().tick, json))
        })
    }

    /// Pack the whole state; returns the tick the snapshot was taken at.
    #[must_use]
    pub fn get_state_binary(&self) -> (u64, Vec<u8>) {
        self.read(|reg| (reg.ctx::<TickCounter>().tick, state_to_binary(reg)))
    }

    /// Live entity ids, in slot order.
    #[must_use]
    pub fn get_all_entities(&self) -> (u64, Vec<u64>) {
        self.read(|reg| {
            (
                reg.ctx::<TickCounter>().tick,
                reg.alive_entities().map(|e| e.raw()).collect(),
            )
        })
    }

    pub fn get_component_json(&self, eid: u64, name: &str) -> Result<(u64, String), SimError> {
        self.read(|reg| {
            let spec = component_spec(name)?;
            let json = (spec.to_json)(reg, EntityId::from_raw(eid))?;
            Ok((reg.ctx::<TickCounter>().tick, json))
        })
    }

    #[must_use]
    pub fn get_component_names(&self) -> Vec<String> {
        component_specs()
            .iter()
            .map(|spec| spec.name.to_owned())
            .collect()
    }

    pub fn get_entity_component_names(&self, eid: u64) -> Result<(u64, Vec<String>), SimError> {
        self.read(|reg| {
            let e = EntityId::from_raw(eid);
            if !reg.valid(e) {
                return Err(SimError::UnknownEntity(eid));
            }
            let names = component_specs()
                .iter()
                .filter(|spec| (spec.has)(reg, e))
                .map(|spec| spec.name.to_owned())
                .collect();
            Ok((reg.ctx::<TickCounter>().tick, names))
        })
    }

    pub fn get_singleton_json(&self, name: &str) -> Result<(u64, String), SimError> {
        self.read(|reg| {
            let spec = singleton_spec(name)?;
            let json = (spec.to_json)(reg)?;
            Ok((reg.ctx::<TickCounter>().tick, json))
        })
    }

    #[must_use]
    pub fn get_singleton_names(&self) -> Vec<String> {
        singleton_specs()
            .iter()
            .map(|spec| spec.name.to_owned())
            .collect()
    }

    /// The events published by the most recent tick.
    #[must_use]
    pub fn get_events_last_tick(&self) -> (u64, Vec<Event>) {
        self.read(|reg| {
            (
                reg.ctx::<TickCounter>().tick,
                reg.ctx::<EventsLog>().events_last_tick.clone(),
            )
        })
    }

    // ── Mutations (worker must be stopped) ──────────────────────

    pub fn set_state_json(&self, json: &str) -> Result<(), SimError> {
        // Parsing is the expensive part; do it before taking the lock.
        let parsed = state_from_json(json)?;
        self.write(move |reg| {
            *reg = parsed;
            debug!("state replaced from JSON");
            Ok(())
        })
    }

    pub fn set_state_binary(&self, bytes: &[u8]) -> Result<(), SimError> {
        let parsed = state_from_binary(bytes)?;
        self.write(move |reg| {
            *reg = parsed;
            debug!("state replaced from binary");
            Ok(())
        })
    }

    pub fn create_entity(&self) -> Result<u64, SimError> {
        self.write(|reg| Ok(reg.create().raw()))
    }

    pub fn destroy_entity(&self, eid: u64) -> Result<(), SimError> {
        self.write(|reg| {
            gridworld_core::destroy_entity(reg, EntityId::from_raw(eid))?;
            Ok(())
        })
    }

    /// Attach a component by name, from JSON when a payload is given and
    /// from the component's default otherwise.
    pub fn assign_component(
        &self,
        eid: u64,
        name: &str,
        json: Option<&str>,
    ) -> Result<(), SimError> {
        let value = match json {
            Some(text) => Some(
                serde_json::from_str::<serde_json::Value>(text)
                    .map_err(|err| SimError::InvalidArgument(err.to_string()))?,
            ),
            None => None,
        };
        self.write(|reg| {
            let spec = component_spec(name)?;
            let e = EntityId::from_raw(eid);
            match &value {
                Some(value) => (spec.assign_json)(reg, e, value)?,
                None => (spec.assign_default)(reg, e)?,
            }
            Ok(())
        })
    }

    pub fn remove_component(&self, eid: u64, name: &str) -> Result<(), SimError> {
        self.write(|reg| {
            let spec = component_spec(name)?;
            (spec.remove)(reg, EntityId::from_raw(eid))?;
            Ok(())
        })
    }

    /// Replace an existing component from JSON; fails when absent.
    pub fn replace_component(&self, eid: u64, name: &str, json: &str) -> Result<(), SimError> {
        let value = serde_json::from_str::<serde_json::Value>(json)
            .map_err(|err| SimError::InvalidArgument(err.to_string()))?;
        self.write(|reg| {
            let spec = component_spec(name)?;
            let e = EntityId::from_raw(eid);
            if !reg.valid(e) {
                return Err(SimError::UnknownEntity(eid));
            }
            if !(spec.has)(reg, e) {
                return Err(SimError::MissingComponent {
                    entity: eid,
                    component: spec.name.to_owned(),
                });
            }
            (spec.assign_json)(reg, e, &value)?;
            Ok(())
        })
    }

    pub fn set_singleton_json(&self, name: &str, json: &str) -> Result<(), SimError> {
        let value = serde_json::from_str::<serde_json::Value>(json)
            .map_err(|err| SimError::InvalidArgument(err.to_string()))?;
        self.write(|reg| {
            let spec = singleton_spec(name)?;
            (spec.from_json)(reg, &value)?;
            Ok(())
        })
    }

    /// Deep-copy every component of `eid` onto a fresh entity. The copy
    /// shares the source's Position until the host moves it; the world map is
    /// left untouched.
    pub fn duplicate_entity(&self, eid: u64) -> Result<u64, SimError> {
        self.write(|reg| {
            let src = EntityId::from_raw(eid);
            if !reg.valid(src) {
                return Err(SimError::UnknownEntity(eid));
            }
            let dup = reg.create();
            reg.stamp(dup, src)?;
            Ok(dup.raw())
        })
    }

    /// Advance the pipeline synchronously while the worker is stopped;
    /// returns the resulting tick.
    pub fn step(&self, ticks: u32) -> Result<u64, SimError> {
        self.write(|reg| {
            let mut runner = TickRunner::new();
            for _ in 0..ticks {
                runner.tick(reg);
            }
            Ok(reg.ctx::<TickCounter>().tick)
        })
    }

    /// Rebuild the world map from Position components, for hosts that edited
    /// Positions directly.
    pub fn rebuild_world(&self) -> Result<(), SimError> {
        self.write(|reg| {
            rebuild_world(reg)?;
            Ok(())
        })
    }

    /// Execute a façade command (`randomize`, `randomize <eid>`).
    pub fn run_command(&self, args: &[&str]) -> Result<String, SimError> {
        self.write(|reg| command::run(reg, args))
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        self.request_stop();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}
