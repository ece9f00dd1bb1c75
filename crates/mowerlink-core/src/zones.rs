use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ZoneError {
    #[error("zone {0} already exists")]
    AlreadyExists(String),
    #[error("zone {0} does not exist")]
    NotFound(String),
    #[error("zone {0} has no area hash on the device map")]
    Unmapped(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub boundary: Vec<Coordinate>,
    /// Area hash the device map uses for this zone.
    #[serde(default)]
    pub area_hash: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneUpdate {
    pub name: Option<String>,
    pub boundary: Option<Vec<Coordinate>>,
    pub area_hash: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneRegistry {
    zones: BTreeMap<String, Zone>,
}

impl ZoneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, zone: Zone) -> Result<(), ZoneError> {
        if self.zones.contains_key(&zone.id) {
            return Err(ZoneError::AlreadyExists(zone.id));
        }
        self.zones.insert(zone.id.clone(), zone);
        Ok(())
    }

    /// Applies the fields present in `update`; empty names and boundaries are ignored.
    pub fn update(&mut self, id: &str, update: ZoneUpdate) -> Result<&Zone, ZoneError> {
        let zone = self
            .zones
            .get_mut(id)
            .ok_or_else(|| ZoneError::NotFound(id.to_string()))?;
        if let Some(name) = update.name.filter(|n| !n.is_empty()) {
            zone.name = name;
        }
        if let Some(boundary) = update.boundary.filter(|b| !b.is_empty()) {
            zone.boundary = boundary;
        }
        if update.area_hash.is_some() {
            zone.area_hash = update.area_hash;
        }
        Ok(zone)
    }

    pub fn delete(&mut self, id: &str) -> Result<Zone, ZoneError> {
        self.zones
            .remove(id)
            .ok_or_else(|| ZoneError::NotFound(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Result<&Zone, ZoneError> {
        self.zones
            .get(id)
            .ok_or_else(|| ZoneError::NotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<&Zone> {
        self.zones.values().collect()
    }

    /// Resolves zone ids to the area hashes a mowing job targets.
    pub fn area_hashes<I>(&self, ids: I) -> Result<Vec<u64>, ZoneError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        ids.into_iter()
            .map(|id| {
                let zone = self.get(id.as_ref())?;
                zone.area_hash
                    .ok_or_else(|| ZoneError::Unmapped(zone.id.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(id: &str, hash: Option<u64>) -> Zone {
        Zone {
            id: id.to_string(),
            name: format!("zone {id}"),
            boundary: vec![Coordinate { lat: 52.1, lon: 4.3 }],
            area_hash: hash,
        }
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let mut registry = ZoneRegistry::new();
        registry.create(zone("front", Some(1))).expect("create");

        let err = registry.create(zone("front", Some(2))).unwrap_err();

        assert_eq!(err, ZoneError::AlreadyExists("front".into()));
        assert_eq!(registry.get("front").expect("zone").area_hash, Some(1));
    }

    #[test]
    fn update_keeps_fields_not_supplied() {
        let mut registry = ZoneRegistry::new();
        registry.create(zone("back", Some(7))).expect("create");

        let updated = registry
            .update(
                "back",
                ZoneUpdate {
                    name: Some("orchard".into()),
                    boundary: Some(Vec::new()),
                    ..ZoneUpdate::default()
                },
            )
            .expect("update");

        assert_eq!(updated.name, "orchard");
        assert_eq!(updated.boundary.len(), 1);
        assert_eq!(updated.area_hash, Some(7));
    }

    #[test]
    fn unknown_zone_operations_fail() {
        let mut registry = ZoneRegistry::new();

        assert_eq!(registry.delete("x"), Err(ZoneError::NotFound("x".into())));
        assert!(registry.update("x", ZoneUpdate::default()).is_err());
        assert!(registry.get("x").is_err());
    }

    #[test]
    fn area_hashes_resolve_in_order() {
        let mut registry = ZoneRegistry::new();
        registry.create(zone("a", Some(11))).expect("create");
        registry.create(zone("b", Some(22))).expect("create");
        registry.create(zone("c", None)).expect("create");

        assert_eq!(registry.area_hashes(["b", "a"]), Ok(vec![22, 11]));
        assert_eq!(registry.area_hashes(["c"]), Err(ZoneError::Unmapped("c".into())));
        assert_eq!(registry.list().len(), 3);
    }
}
