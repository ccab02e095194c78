//! # Game Store
//!
//! Thread-safe in-memory registry of loaded games plus a cache of derived
//! format conversions. One mutex guards both maps; anything that may perform
//! HTTP (that is, an actual conversion) drops the lock first and re-acquires
//! it to insert the result.
//!
//! Replace-by-id semantics: re-adding a game with an existing id replaces
//! the entry and invalidates every cached conversion for that id, so a
//! cached conversion never outlives the game it was derived from.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::Serialize;
use workbench_plugin_sdk::Game;

use crate::capabilities::{CapabilityRegistry, ConversionCheck, ConversionError};

/// The closed set of format tags the workbench understands.
pub const SUPPORTED_FORMATS: [&str; 3] = ["extensive", "normal", "maid"];

pub fn is_supported_format(name: &str) -> bool {
    SUPPORTED_FORMATS.contains(&name)
}

/// Lightweight game summary for listings.
#[derive(Debug, Clone, Serialize)]
pub struct GameSummary {
    pub id: String,
    pub title: String,
    pub players: Vec<String>,
    pub version: String,
    pub format: String,
    pub conversions: BTreeMap<String, ConversionCheck>,
}

#[derive(Default)]
struct StoreInner {
    games: HashMap<String, Game>,
    /// `(game_id, target_format)` to converted game.
    conversions: HashMap<(String, String), Game>,
}

impl StoreInner {
    fn invalidate_conversions(&mut self, game_id: &str) {
        self.conversions.retain(|(id, _), _| id != game_id);
    }
}

/// Thread-safe in-memory store for loaded games.
#[derive(Default)]
pub struct GameStore {
    inner: Mutex<StoreInner>,
}

impl GameStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a game, replacing any entry with the same id and dropping that
    /// id's cached conversions. Returns the game id.
    pub fn add(&self, game: Game) -> String {
        let id = game.id.clone();
        let mut inner = self.inner.lock().unwrap();
        inner.invalidate_conversions(&id);
        inner.games.insert(id.clone(), game);
        id
    }

    pub fn get(&self, game_id: &str) -> Option<Game> {
        let inner = self.inner.lock().unwrap();
        inner.games.get(game_id).cloned()
    }

    pub fn get_format(&self, game_id: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.games.get(game_id).map(|g| g.format_name.clone())
    }

    /// Remove a game and its cached conversions. Returns whether it existed.
    pub fn remove(&self, game_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let existed = inner.games.remove(game_id).is_some();
        if existed {
            inner.invalidate_conversions(game_id);
        }
        existed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().games.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Summaries of all games, sorted by id, with quick-check conversion
    /// availability from the registry.
    pub fn list(&self, registry: &CapabilityRegistry) -> Vec<GameSummary> {
        let games: Vec<Game> = {
            let inner = self.inner.lock().unwrap();
            inner.games.values().cloned().collect()
        };

        // Quick checks are pure graph lookups, but still happen off-lock.
        let mut summaries: Vec<GameSummary> = games
            .iter()
            .map(|game| summarize(game, registry))
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub fn get_summary(&self, game_id: &str, registry: &CapabilityRegistry) -> Option<GameSummary> {
        self.get(game_id).map(|game| summarize(&game, registry))
    }

    /// Get a game converted to `target_format`, reusing the conversion
    /// cache.
    ///
    /// `Ok(None)` means the game does not exist or no conversion is
    /// possible; an `Err` means a conversion was attempted and failed.
    /// The converter runs outside the store lock.
    pub async fn get_converted(
        &self,
        game_id: &str,
        target_format: &str,
        registry: &CapabilityRegistry,
    ) -> Result<Option<Game>, ConversionError> {
        let source = {
            let inner = self.inner.lock().unwrap();
            let Some(game) = inner.games.get(game_id) else {
                return Ok(None);
            };
            if game.format_name == target_format {
                return Ok(Some(game.clone()));
            }
            let cache_key = (game_id.to_string(), target_format.to_string());
            if let Some(cached) = inner.conversions.get(&cache_key) {
                return Ok(Some(cached.clone()));
            }
            game.clone()
        };

        if !registry.check_quick(&source, target_format).possible {
            return Ok(None);
        }

        let converted = registry.convert(&source, target_format).await?;

        let mut inner = self.inner.lock().unwrap();
        // Don't cache against a game that was replaced or removed while the
        // conversion was in flight.
        if inner.games.get(game_id) == Some(&source) {
            inner
                .conversions
                .insert((game_id.to_string(), target_format.to_string()), converted.clone());
        }
        Ok(Some(converted))
    }
}

fn summarize(game: &Game, registry: &CapabilityRegistry) -> GameSummary {
    GameSummary {
        id: game.id.clone(),
        title: game.title.clone(),
        players: game.players.clone(),
        version: game.version.clone(),
        format: game.format_name.clone(),
        conversions: registry.available_conversions(game),
    }
}
