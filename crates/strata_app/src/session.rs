//! A scripted session over the entity runtime.
//!
//! Registers a handful of game components and events, spawns entities from
//! prefabs across the global, world, and sector pools, then runs a fixed
//! number of ticks moving, damaging, copying, and storing entities.

use std::any::TypeId;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use strata_entity::{
    EntityDestroySubscriber, EntityManager, EntityRecord, EntityScope, LifecycleEvent,
    LifecycleListener, LocationComponent, Prefab, PrefabManager, register_engine_components,
};
use strata_meta::{
    Component, ComponentDeclaration, ComponentLibrary, ComponentLibraryBuilder, EntityRef, Event,
    EventDeclaration, EventLibrary, EventLibraryBuilder, NetworkEventType, ReplicateKind, TypeUri,
};
use tracing::{debug, info, warn};

use crate::config::AppConfig;

const GAME_MODULE: &str = "game";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthComponent {
    pub current: u32,
    pub max: u32,
}

impl Component for HealthComponent {
    fn declare(decl: ComponentDeclaration<Self>) -> ComponentDeclaration<Self> {
        decl.default_constructor()
            .field("current", |h: &Self| &h.current, |h: &mut Self| &mut h.current)
            .field("max", |h: &Self| &h.max, |h: &mut Self| &mut h.max)
            .replicate_field("current", ReplicateKind::ServerToClient)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VelocityComponent {
    pub linear: Vec3,
}

impl Component for VelocityComponent {
    fn declare(decl: ComponentDeclaration<Self>) -> ComponentDeclaration<Self> {
        decl.default_constructor()
            .field("linear", |v: &Self| &v.linear, |v: &mut Self| &mut v.linear)
            .do_not_persist()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemComponent {
    pub name: String,
}

impl Component for ItemComponent {
    fn declare(decl: ComponentDeclaration<Self>) -> ComponentDeclaration<Self> {
        decl.default_constructor()
            .field("name", |i: &Self| &i.name, |i: &mut Self| &mut i.name)
    }
}

/// Items carried by an entity. The entity owns them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InventoryComponent {
    pub items: Vec<EntityRef>,
}

impl Component for InventoryComponent {
    fn declare(decl: ComponentDeclaration<Self>) -> ComponentDeclaration<Self> {
        decl.default_constructor()
            .owned_field("items", |i: &Self| &i.items, |i: &mut Self| &mut i.items)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DamageEvent {
    pub amount: u32,
}

impl Event for DamageEvent {
    fn declare(decl: EventDeclaration<Self>) -> EventDeclaration<Self> {
        decl.default_constructor()
            .field("amount", |d: &Self| &d.amount, |d: &mut Self| &mut d.amount)
            .network(NetworkEventType::Server)
            .lag_compensate()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatEvent {
    pub message: String,
}

impl Event for ChatEvent {
    fn declare(decl: EventDeclaration<Self>) -> EventDeclaration<Self> {
        decl.default_constructor()
            .field("message", |c: &Self| &c.message, |c: &mut Self| &mut c.message)
            .network(NetworkEventType::Broadcast)
            .skip_instigator()
    }
}

/// Keeps health within its maximum whenever a health component activates.
struct HealthClamp;

impl LifecycleListener for HealthClamp {
    fn on_event(
        &mut self,
        manager: &mut EntityManager,
        entity: EntityRef,
        event: LifecycleEvent,
        component: TypeId,
    ) {
        if event != LifecycleEvent::Activated || component != TypeId::of::<HealthComponent>() {
            return;
        }
        if let Some(health) = manager.get_component_mut::<HealthComponent>(entity) {
            health.current = health.current.min(health.max);
        }
    }
}

struct DestroyCounter(Arc<AtomicUsize>);

impl EntityDestroySubscriber for DestroyCounter {
    fn on_entity_destroyed(&mut self, entity: EntityRef) {
        self.0.fetch_add(1, Ordering::Relaxed);
        debug!(entity = entity.id(), "entity destroyed");
    }
}

/// What a finished session looked like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub ticks: u64,
    pub active_entities: usize,
    pub destroyed: usize,
}

pub fn build_component_library(config: &AppConfig) -> Result<ComponentLibrary> {
    let mut builder = ComponentLibraryBuilder::new()
        .with_replicate_by_default(config.replicate_components_by_default);
    register_engine_components(&mut builder)?;
    builder.register::<HealthComponent>(TypeUri::new(GAME_MODULE, "Health"))?;
    builder.register::<VelocityComponent>(TypeUri::new(GAME_MODULE, "Velocity"))?;
    builder.register::<ItemComponent>(TypeUri::new(GAME_MODULE, "Item"))?;
    builder.register::<InventoryComponent>(TypeUri::new(GAME_MODULE, "Inventory"))?;
    Ok(builder.freeze())
}

pub fn build_event_library(config: &AppConfig) -> Result<EventLibrary> {
    let mut builder =
        EventLibraryBuilder::new().with_replicate_by_default(config.replicate_events_by_default);
    builder.register::<DamageEvent>(TypeUri::new(GAME_MODULE, "Damage"))?;
    builder.register::<ChatEvent>(TypeUri::new(GAME_MODULE, "Chat"))?;
    Ok(builder.freeze())
}

fn build_prefabs() -> PrefabManager {
    let mut prefabs = PrefabManager::new();
    prefabs.register(
        Prefab::new("game:wanderer")
            .with_component(HealthComponent { current: 30, max: 20 })
            .with_component(VelocityComponent {
                linear: Vec3::new(1.0, 0.0, 0.0),
            })
            .with_component(LocationComponent::default()),
    );
    prefabs.register(
        Prefab::new("game:beacon")
            .with_component(LocationComponent::default())
            .always_relevant(true)
            .scope(EntityScope::Global),
    );
    prefabs
}

/// A running demo session.
pub struct Session {
    config: AppConfig,
    manager: EntityManager,
    events: EventLibrary,
    wanderers: Vec<EntityRef>,
    holder: EntityRef,
    destroyed: Arc<AtomicUsize>,
    tick: u64,
}

impl Session {
    /// Build the libraries and the world and spawn the initial entities.
    pub fn new(config: AppConfig) -> Result<Self> {
        let components = build_component_library(&config)?;
        let events = build_event_library(&config)?;
        info!(
            components = components.len(),
            events = events.len(),
            "type libraries frozen"
        );

        let mut manager = EntityManager::new(components, build_prefabs());
        for world in &config.worlds {
            manager.create_world_pool(world);
        }
        if let Some(first) = config.worlds.first() {
            manager.set_current_world(first);
        }

        manager.register_listener(Box::new(HealthClamp));
        let destroyed = Arc::new(AtomicUsize::new(0));
        manager.subscribe_for_destruction(Box::new(DestroyCounter(destroyed.clone())));

        manager.create_from_prefab("game:beacon");
        let wanderers = (0..3)
            .map(|i| {
                manager.create_at(
                    "game:wanderer",
                    Vec3::new(0.0, 0.0, i as f32 * 4.0),
                    Quat::IDENTITY,
                )
            })
            .collect();
        manager.create_sector_entity_with(
            config.sector_unloaded_max_delta,
            config.sector_loaded_max_delta,
        );

        let sword = manager.create(vec![Box::new(ItemComponent {
            name: "sword".to_string(),
        })]);
        let holder = manager.create(vec![
            Box::new(InventoryComponent { items: vec![sword] }),
            Box::new(LocationComponent::default()),
        ]);
        let twin = manager.copy(holder);
        debug!(holder = holder.id(), twin = twin.id(), "copied inventory holder");

        Ok(Self {
            config,
            manager,
            events,
            wanderers,
            holder,
            destroyed,
            tick: 0,
        })
    }

    /// The entity manager.
    pub fn manager(&self) -> &EntityManager {
        &self.manager
    }

    /// Run every configured tick.
    pub fn run(&mut self) -> Result<SessionReport> {
        while self.tick < self.config.ticks {
            self.step()?;
        }
        let report = SessionReport {
            ticks: self.tick,
            active_entities: self.manager.active_entity_count(),
            destroyed: self.destroyed.load(Ordering::Relaxed),
        };
        for (pool, count) in self.manager.pool_counts() {
            info!(%pool, count, "pool size");
        }
        Ok(report)
    }

    /// Advance one tick.
    pub fn step(&mut self) -> Result<()> {
        self.tick += 1;
        self.integrate();
        if let Some(&target) = self.wanderers.first() {
            self.apply_damage(target, DamageEvent { amount: 3 });
        }
        if self.tick == self.config.ticks / 2 {
            self.cycle_storage()?;
        }
        debug!(tick = self.tick, entities = self.manager.active_entity_count(), "tick complete");
        Ok(())
    }

    fn integrate(&mut self) {
        let moving: Vec<(EntityRef, Vec3)> = self
            .manager
            .list_components::<VelocityComponent>()
            .into_iter()
            .map(|(entity, velocity)| (entity, velocity.linear))
            .collect();
        for (entity, linear) in moving {
            let Some(location) = self.manager.get_component::<LocationComponent>(entity) else {
                continue;
            };
            let moved = LocationComponent {
                position: location.position + linear,
                ..*location
            };
            self.manager.save_component(entity, moved);
        }
    }

    fn apply_damage(&mut self, target: EntityRef, event: DamageEvent) {
        if let Some(metadata) = self.events.metadata::<DamageEvent>() {
            debug!(
                uri = %metadata.uri(),
                network = ?metadata.network_type(),
                lag_compensated = metadata.is_lag_compensated(),
                "sending damage"
            );
        }
        let Some(health) = self.manager.get_component::<HealthComponent>(target) else {
            return;
        };
        let updated = HealthComponent {
            current: health.current.saturating_sub(event.amount),
            max: health.max,
        };
        if updated.current == 0 {
            info!(entity = target.id(), tick = self.tick, "entity died");
            self.manager.destroy(target);
            return;
        }
        self.manager.save_component(target, updated);
    }

    /// Store the inventory holder and bring it back from its record.
    fn cycle_storage(&mut self) -> Result<()> {
        let record = match self.manager.store(self.holder) {
            Ok(record) => record,
            Err(err) => {
                warn!(entity = self.holder.id(), error = %err, "holder could not be stored");
                return Ok(());
            }
        };
        let bytes = record.to_bytes()?;
        let record = EntityRecord::from_bytes(&bytes)?;
        self.holder = self
            .manager
            .restore(&record)
            .context("restoring inventory holder")?;
        info!(entity = self.holder.id(), bytes = bytes.len(), "holder stored and restored");
        Ok(())
    }
}
