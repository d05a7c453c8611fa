//! OData `$metadata` (EDMX) model: entity sets and their entity types

use std::collections::{HashMap, HashSet};

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde::Serialize;

use crate::{Error, Result};

/// One structural property of an entity type
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PropertyDescription {
    /// Property name
    pub name: String,
    /// EDM type, e.g. `Edm.Guid`
    #[serde(rename = "type")]
    pub type_name: String,
    /// Present only when the document states it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,
}

/// Schema of one entity set
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EntityDescription {
    /// Entity set name
    pub entity_set: String,
    /// Unqualified entity type name
    pub entity_type: String,
    /// Key property names
    pub key: Vec<String>,
    /// Structural properties in document order
    pub properties: Vec<PropertyDescription>,
}

#[derive(Debug, Default)]
struct EntityType {
    key: Vec<String>,
    properties: Vec<PropertyDescription>,
}

/// Parsed EDMX document
#[derive(Debug, Default)]
pub struct ODataModel {
    /// `(set name, qualified entity type)` in document order
    entity_sets: Vec<(String, String)>,
    entity_types: HashMap<String, EntityType>,
}

fn attr(element: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
}

impl ODataModel {
    /// Parse an EDMX document
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut model = Self::default();
        let mut current: Option<(String, EntityType)> = None;
        let mut in_key = false;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => match e.local_name().as_ref() {
                    b"EntityType" => {
                        let name = attr(&e, b"Name").unwrap_or_default();
                        current = Some((name, EntityType::default()));
                    }
                    b"Key" => in_key = true,
                    _ => model.element(&e, current.as_mut().map(|(_, t)| t), in_key),
                },
                Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                    b"EntityType" => {
                        if let Some(name) = attr(&e, b"Name") {
                            model.entity_types.insert(name, EntityType::default());
                        }
                    }
                    _ => model.element(&e, current.as_mut().map(|(_, t)| t), in_key),
                },
                Ok(Event::End(e)) => match e.local_name().as_ref() {
                    b"EntityType" => {
                        if let Some((name, entity_type)) = current.take() {
                            if !name.is_empty() {
                                model.entity_types.insert(name, entity_type);
                            }
                        }
                    }
                    b"Key" => in_key = false,
                    _ => {}
                },
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(Error::Metadata(format!(
                        "malformed $metadata at byte {}: {e}",
                        reader.buffer_position()
                    )));
                }
                _ => {}
            }
        }
        Ok(model)
    }

    fn element(&mut self, e: &BytesStart<'_>, current: Option<&mut EntityType>, in_key: bool) {
        match e.local_name().as_ref() {
            b"EntitySet" => {
                let name = attr(e, b"Name");
                if let (Some(name), Some(entity_type)) = (name, attr(e, b"EntityType")) {
                    self.entity_sets.push((name, entity_type));
                }
            }
            b"PropertyRef" if in_key => {
                if let (Some(entity_type), Some(name)) = (current, attr(e, b"Name")) {
                    entity_type.key.push(name);
                }
            }
            b"Property" => {
                if let (Some(entity_type), Some(name)) = (current, attr(e, b"Name")) {
                    entity_type.properties.push(PropertyDescription {
                        name,
                        type_name: attr(e, b"Type").unwrap_or_default(),
                        nullable: attr(e, b"Nullable").map(|v| v == "true"),
                    });
                }
            }
            _ => {}
        }
    }

    /// Entity set names, first occurrence wins
    pub fn entity_set_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.entity_sets
            .iter()
            .filter(|(name, _)| seen.insert(name.as_str()))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Key and properties of `entity_set`
    pub fn describe(&self, entity_set: &str) -> Result<EntityDescription> {
        let found = self.entity_sets.iter().find(|(name, _)| name == entity_set);
        let Some((_, qualified)) = found else {
            return Err(Error::Metadata(format!("entity_not_found:{entity_set}")));
        };
        let type_name = qualified.rsplit('.').next().unwrap_or(qualified);
        let Some(entity_type) = self.entity_types.get(type_name) else {
            return Err(Error::Metadata(format!("entity_type_not_found:{type_name}")));
        };
        Ok(EntityDescription {
            entity_set: entity_set.to_string(),
            entity_type: type_name.to_string(),
            key: entity_type.key.clone(),
            properties: entity_type.properties.clone(),
        })
    }
}
