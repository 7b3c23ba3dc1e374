//! Models: a property tree bound to a physical collection, plus the
//! property-id to index-slot map.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use super::access::AccessLevel;
use super::errors::{SchemaError, SchemaResult};
use super::property::{Property, PropertyType};

/// A physical index slot assigned to one property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSlot {
    pub property_id: u32,
    pub name: String,
}

impl IndexSlot {
    pub fn new(property_id: u32, name: impl Into<String>) -> Self {
        Self {
            property_id,
            name: name.into(),
        }
    }
}

/// Serialized form of a model, as found in model files
#[derive(Debug, Clone, Deserialize)]
pub struct ModelDefinition {
    pub name: String,
    pub collection: String,
    #[serde(default)]
    pub properties: Vec<Property>,
    #[serde(default)]
    pub slots: Vec<IndexSlot>,
}

/// An object type whose documents live in `collection`
#[derive(Debug)]
pub struct Model {
    name: String,
    collection: String,
    properties: Vec<Arc<Property>>,
    slots: Vec<IndexSlot>,
    keyed_slots: OnceLock<HashMap<u32, String>>,
}

impl Model {
    /// Assembles a model. An `_id` property is added when absent.
    pub fn new(
        name: impl Into<String>,
        collection: impl Into<String>,
        properties: Vec<Property>,
        slots: Vec<IndexSlot>,
    ) -> SchemaResult<Self> {
        let name = name.into();
        let mut properties: Vec<Arc<Property>> = properties.into_iter().map(Arc::new).collect();

        if !properties.iter().any(|p| p.name == "_id") {
            properties.insert(
                0,
                Arc::new(
                    Property::new("_id", PropertyType::ObjectId)
                        .native()
                        .with_read_access(AccessLevel::Public),
                ),
            );
        }

        let mut seen = HashSet::new();
        for slot in &slots {
            if !seen.insert(slot.name.as_str()) {
                return Err(SchemaError::invalid_model(
                    &name,
                    format!("duplicate slot name '{}'", slot.name),
                ));
            }
        }

        for prop in properties.iter_mut() {
            assign_paths(prop, None);
        }

        let model = Self {
            name,
            collection: collection.into(),
            properties,
            slots,
            keyed_slots: OnceLock::new(),
        };

        let mut unslotted = None;
        model.walk(&mut |p| {
            if p.indexed && !p.native_index && p.id.is_none() && unslotted.is_none() {
                unslotted = Some(p.full_path().to_string());
            }
        });
        if let Some(path) = unslotted {
            return Err(SchemaError::invalid_model(
                &model.name,
                format!("indexed property '{}' has no internal id", path),
            ));
        }

        Ok(model)
    }

    pub fn from_definition(def: ModelDefinition) -> SchemaResult<Self> {
        Self::new(def.name, def.collection, def.properties, def.slots)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn properties(&self) -> &[Arc<Property>] {
        &self.properties
    }

    pub fn slots(&self) -> &[IndexSlot] {
        &self.slots
    }

    /// Property id to slot name. Built on first use and immutable afterwards;
    /// concurrent first calls may both build it, with identical results.
    pub fn keyed_slots(&self) -> &HashMap<u32, String> {
        self.keyed_slots.get_or_init(|| {
            self.slots
                .iter()
                .map(|slot| (slot.property_id, slot.name.clone()))
                .collect()
        })
    }

    pub fn slot_for(&self, property: &Property) -> Option<&str> {
        property
            .id
            .and_then(|id| self.keyed_slots().get(&id))
            .map(String::as_str)
    }

    pub fn property(&self, name: &str) -> Option<&Arc<Property>> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Property)) {
        for prop in &self.properties {
            prop.walk(f);
        }
    }

    /// Resolves a dotted path from the model root
    pub fn resolve(&self, path: &str) -> Option<ResolvedProperty> {
        let mut segments = path.split('.');
        let first = self.property(segments.next()?)?;
        self.descend(Vec::new(), Arc::clone(first), segments)
    }

    /// Resolves a dotted path relative to an already resolved container
    pub fn resolve_within(&self, parent: &ResolvedProperty, path: &str) -> Option<ResolvedProperty> {
        if parent.model != self.name {
            return None;
        }
        let mut segments = path.split('.');
        let first = parent.leaf.child(segments.next()?)?;
        let mut parents = parent.parents.clone();
        parents.push(Arc::clone(&parent.leaf));
        self.descend(parents, Arc::clone(first), segments)
    }

    fn descend<'a>(
        &self,
        mut parents: Vec<Arc<Property>>,
        mut current: Arc<Property>,
        segments: impl Iterator<Item = &'a str>,
    ) -> Option<ResolvedProperty> {
        for segment in segments {
            let next = Arc::clone(current.child(segment)?);
            parents.push(current);
            current = next;
        }
        let slot = self.slot_for(&current).map(str::to_string);
        Some(ResolvedProperty {
            model: self.name.clone(),
            parents,
            leaf: current,
            slot,
        })
    }
}

fn assign_paths(prop: &mut Arc<Property>, parent: Option<&str>) {
    let inner = Arc::make_mut(prop);
    let path = match parent {
        Some(parent) => format!("{}.{}", parent, inner.name),
        None => inner.name.clone(),
    };
    for child in inner.properties.iter_mut() {
        assign_paths(child, Some(&path));
    }
    inner.set_full_path(path);
}

/// A property located inside a specific model, with its ancestors
#[derive(Debug, Clone)]
pub struct ResolvedProperty {
    model: String,
    parents: Vec<Arc<Property>>,
    leaf: Arc<Property>,
    slot: Option<String>,
}

impl ResolvedProperty {
    pub fn property(&self) -> &Property {
        &self.leaf
    }

    /// Ancestors from the model root down to the direct parent
    pub fn parents(&self) -> &[Arc<Property>] {
        &self.parents
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn full_path(&self) -> &str {
        self.leaf.full_path()
    }

    pub fn slot(&self) -> Option<&str> {
        self.slot.as_deref()
    }

    pub fn type_name(&self) -> PropertyType {
        self.leaf.property_type
    }

    /// Two resolutions name the same stored field
    pub fn same_field(&self, other: &ResolvedProperty) -> bool {
        Arc::ptr_eq(&self.leaf, &other.leaf)
            || (self.full_path() == other.full_path()
                && self.leaf.id == other.leaf.id
                && self.slot == other.slot
                && self.type_name() == other.type_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> Model {
        Model::new(
            "c_post",
            "contexts",
            vec![
                Property::new("c_title", PropertyType::String).indexed(1),
                Property::new("c_tags", PropertyType::String).indexed(2).array(),
                Property::new("c_comments", PropertyType::Document)
                    .array()
                    .with_properties(vec![
                        Property::new("c_body", PropertyType::String).indexed(3),
                    ]),
            ],
            vec![
                IndexSlot::new(1, "s1"),
                IndexSlot::new(2, "s2"),
                IndexSlot::new(3, "s3"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_id_property_is_added() {
        let m = model();
        let id = m.property("_id").unwrap();
        assert!(id.native_index);
        assert_eq!(id.property_type, PropertyType::ObjectId);
    }

    #[test]
    fn test_resolve_nested_path() {
        let m = model();
        let resolved = m.resolve("c_comments.c_body").unwrap();
        assert_eq!(resolved.full_path(), "c_comments.c_body");
        assert_eq!(resolved.parents().len(), 1);
        assert_eq!(resolved.slot(), Some("s3"));
    }

    #[test]
    fn test_resolve_within_parent() {
        let m = model();
        let parent = m.resolve("c_comments").unwrap();
        let child = m.resolve_within(&parent, "c_body").unwrap();
        assert_eq!(child.full_path(), "c_comments.c_body");
    }

    #[test]
    fn test_unknown_path() {
        assert!(model().resolve("c_missing").is_none());
        assert!(model().resolve("c_title.x").is_none());
    }

    #[test]
    fn test_keyed_slots_cached() {
        let m = model();
        let first = m.keyed_slots() as *const _;
        let second = m.keyed_slots() as *const _;
        assert_eq!(first, second);
        assert_eq!(m.keyed_slots().get(&2).map(String::as_str), Some("s2"));
    }

    #[test]
    fn test_indexed_property_requires_id() {
        let mut prop = Property::new("c_bad", PropertyType::String);
        prop.indexed = true;
        let err = Model::new("c_x", "contexts", vec![prop], vec![]).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidModel { .. }));
    }
}
