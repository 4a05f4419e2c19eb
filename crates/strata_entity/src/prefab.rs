//! Prefabs: named component templates.
//!
//! Instantiating a prefab copies each of its components through the
//! component library and appends an [`EntityInfoComponent`] recording where
//! the entity came from.

use std::any::TypeId;
use std::collections::HashMap;

use strata_meta::{Component, ComponentBox, ComponentLibrary};
use tracing::{debug, warn};

use crate::components::{EntityInfoComponent, EntityScope};

/// A named component template.
#[derive(Debug)]
pub struct Prefab {
    name: String,
    parent: Option<String>,
    components: Vec<ComponentBox>,
    persisted: bool,
    always_relevant: bool,
    scope: EntityScope,
}

impl Prefab {
    /// An empty prefab.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            components: Vec::new(),
            persisted: true,
            always_relevant: false,
            scope: EntityScope::Chunk,
        }
    }

    /// A prefab starting from copies of `parent`'s components and flags.
    ///
    /// Components of a type the parent holds but `library` does not know are
    /// dropped with a warning.
    #[must_use]
    pub fn inherit(name: impl Into<String>, parent: &Prefab, library: &ComponentLibrary) -> Self {
        let name = name.into();
        let components = parent
            .components
            .iter()
            .filter_map(|c| {
                let copy = library.copy(&**c);
                if copy.is_none() {
                    warn!(
                        prefab = %name,
                        component = c.component_type_name(),
                        "parent component is not registered, not inherited"
                    );
                }
                copy
            })
            .collect();
        Self {
            name,
            parent: Some(parent.name.clone()),
            components,
            persisted: parent.persisted,
            always_relevant: parent.always_relevant,
            scope: parent.scope,
        }
    }

    /// Add or replace a component.
    #[must_use]
    pub fn with_component<T: Component>(mut self, component: T) -> Self {
        let boxed: ComponentBox = Box::new(component);
        match self
            .components
            .iter_mut()
            .find(|c| c.component_type() == TypeId::of::<T>())
        {
            Some(slot) => *slot = boxed,
            None => self.components.push(boxed),
        }
        self
    }

    /// Set whether instances are persisted.
    #[must_use]
    pub fn persisted(mut self, persisted: bool) -> Self {
        self.persisted = persisted;
        self
    }

    /// Set whether instances are always relevant to clients.
    #[must_use]
    pub fn always_relevant(mut self, always_relevant: bool) -> Self {
        self.always_relevant = always_relevant;
        self
    }

    /// Set the scope instances start in.
    #[must_use]
    pub fn scope(mut self, scope: EntityScope) -> Self {
        self.scope = scope;
        self
    }

    /// The prefab's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The prefab this one inherits from.
    #[must_use]
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// The template components in order.
    #[must_use]
    pub fn components(&self) -> &[ComponentBox] {
        &self.components
    }

    /// Borrow a template component.
    #[must_use]
    pub fn get_component<T: Component>(&self) -> Option<&T> {
        self.components.iter().find_map(|c| c.downcast_ref::<T>())
    }

    /// Whether instances are persisted.
    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    /// Whether instances are always relevant.
    #[must_use]
    pub fn is_always_relevant(&self) -> bool {
        self.always_relevant
    }

    /// The scope instances start in.
    #[must_use]
    pub fn entity_scope(&self) -> EntityScope {
        self.scope
    }

    /// Copies of the template components followed by the entity info for an
    /// instance.
    #[must_use]
    pub fn instantiate(&self, library: &ComponentLibrary) -> Vec<ComponentBox> {
        let mut components: Vec<ComponentBox> = self
            .components
            .iter()
            .filter(|c| !c.is::<EntityInfoComponent>())
            .filter_map(|c| library.copy(&**c))
            .collect();
        components.push(Box::new(self.entity_info()));
        components
    }

    /// The entity info an instance starts with.
    #[must_use]
    pub fn entity_info(&self) -> EntityInfoComponent {
        EntityInfoComponent {
            parent_prefab: Some(self.name.clone()),
            persisted: self.persisted,
            always_relevant: self.always_relevant,
            scope: self.scope,
            ..EntityInfoComponent::default()
        }
    }
}

/// Registry of prefabs by case-insensitive name.
#[derive(Debug, Default)]
pub struct PrefabManager {
    prefabs: HashMap<String, Prefab>,
}

impl PrefabManager {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `prefab`, replacing any prefab of the same name.
    pub fn register(&mut self, prefab: Prefab) {
        let key = prefab.name.to_ascii_lowercase();
        debug!(prefab = %prefab.name, "registered prefab");
        if self.prefabs.insert(key, prefab).is_some() {
            debug!("replaced existing prefab");
        }
    }

    /// Look up a prefab.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Prefab> {
        self.prefabs.get(&name.to_ascii_lowercase())
    }

    /// Returns `true` if a prefab is registered under `name`.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.prefabs.contains_key(&name.to_ascii_lowercase())
    }

    /// Every registered prefab.
    pub fn iter(&self) -> impl Iterator<Item = &Prefab> {
        self.prefabs.values()
    }

    /// Number of registered prefabs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.prefabs.len()
    }

    /// Returns `true` if no prefab is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prefabs.is_empty()
    }
}
