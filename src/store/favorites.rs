use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// A user-curated destination shortcut. Created and deleted only by explicit
/// user action; the engine never mutates one behind the user's back, apart
/// from the resolution/usage bookkeeping fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Favorite {
    pub id: String,
    pub name: String,
    pub address: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_resolved_ip: Option<String>,
}

impl Favorite {
    pub fn new(name: String, address: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            address,
            created_at: Utc::now(),
            last_used: None,
            last_resolved_ip: None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct FavoritesFile {
    favorites: Vec<Favorite>,
}

/// JSON-file favorites store with an in-memory cache
pub struct FavoritesStore {
    favorites: RwLock<Vec<Favorite>>,
    file_path: PathBuf,
}

impl FavoritesStore {
    pub fn open(config_dir: &Path) -> Result<Self> {
        fs::create_dir_all(config_dir)?;
        let file_path = config_dir.join("favorites.json");

        let favorites = if file_path.exists() {
            let content = fs::read_to_string(&file_path)?;
            let file: FavoritesFile = serde_json::from_str(&content)?;
            file.favorites
        } else {
            Vec::new()
        };

        Ok(Self {
            favorites: RwLock::new(favorites),
            file_path,
        })
    }

    fn persist(&self) -> Result<()> {
        let content = {
            let favorites = self.favorites.read();
            serde_json::to_string_pretty(&FavoritesFile {
                favorites: favorites.clone(),
            })?
        };
        fs::write(&self.file_path, content)?;
        Ok(())
    }

    pub fn list(&self) -> Vec<Favorite> {
        self.favorites.read().clone()
    }

    pub fn add(&self, name: String, address: String) -> Result<Favorite> {
        let favorite = Favorite::new(name, address);
        {
            let mut favorites = self.favorites.write();
            favorites.push(favorite.clone());
        }
        self.persist()?;
        Ok(favorite)
    }

    pub fn update(&self, id: &str, name: Option<String>, address: Option<String>) -> Result<Favorite> {
        let updated = {
            let mut favorites = self.favorites.write();
            let favorite = favorites
                .iter_mut()
                .find(|f| f.id == id)
                .ok_or_else(|| EngineError::not_found(id))?;

            if let Some(name) = name {
                favorite.name = name;
            }
            if let Some(address) = address {
                favorite.address = address;
            }
            favorite.clone()
        };
        self.persist()?;
        Ok(updated)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        {
            let mut favorites = self.favorites.write();
            let before = favorites.len();
            favorites.retain(|f| f.id != id);
            if favorites.len() == before {
                return Err(EngineError::not_found(id));
            }
        }
        self.persist()
    }

    /// Record that the favorite was just used as a destination
    pub fn touch(&self, id: &str) -> Result<()> {
        {
            let mut favorites = self.favorites.write();
            let favorite = favorites
                .iter_mut()
                .find(|f| f.id == id)
                .ok_or_else(|| EngineError::not_found(id))?;
            favorite.last_used = Some(Utc::now());
        }
        self.persist()
    }

    /// Remember the IP a favorite's address last resolved to
    pub fn update_resolved_ip(&self, address: &str, ip: &str) -> Result<()> {
        {
            let mut favorites = self.favorites.write();
            for favorite in favorites.iter_mut() {
                if favorite.address == address {
                    favorite.last_resolved_ip = Some(ip.to_string());
                }
            }
        }
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FavoritesStore::open(dir.path()).unwrap();

        let fav = store
            .add("Office".to_string(), "office-laptop".to_string())
            .unwrap();
        assert!(!fav.id.is_empty());
        assert_eq!(store.list().len(), 1);

        store.delete(&fav.id).unwrap();
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_delete_unknown_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FavoritesStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.delete("missing"),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FavoritesStore::open(dir.path()).unwrap();
            store.add("NAS".to_string(), "10.0.0.9".to_string()).unwrap();
        }
        let reopened = FavoritesStore::open(dir.path()).unwrap();
        let favorites = reopened.list();
        assert_eq!(favorites.len(), 1);
        assert_eq!(favorites[0].name, "NAS");
    }

    #[test]
    fn test_update_and_touch() {
        let dir = tempfile::tempdir().unwrap();
        let store = FavoritesStore::open(dir.path()).unwrap();
        let fav = store.add("Old".to_string(), "10.0.0.1".to_string()).unwrap();

        let updated = store
            .update(&fav.id, Some("New".to_string()), None)
            .unwrap();
        assert_eq!(updated.name, "New");
        assert_eq!(updated.address, "10.0.0.1");

        store.touch(&fav.id).unwrap();
        assert!(store.list()[0].last_used.is_some());
    }
}
