//! # Capability Registry
//!
//! The merged, queryable view of what healthy plugins can do: analyses by
//! name, and format conversions as a directed graph of `(source, target)`
//! edges. Registration happens at plugin-healthy transitions and is atomic
//! per plugin; re-registration replaces. There is no deregistration on
//! plugin death: a dead plugin's capabilities stay visible, and calls that
//! reach it fail at submit/poll time with an unreachable error. That keeps
//! the client-visible contract stable across plugin flaps.
//!
//! Conversion paths are found with a breadth-first search over the edge set,
//! so multi-hop conversions (e.g. `maid → extensive → normal`) come out
//! shortest-first. Applying a path is a left fold that posts the running
//! game to each edge's owning plugin.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use workbench_plugin_sdk::{
    Analysis, Game, PluginClient, PluginError, PluginInfo, PollSettings, RemoteAnalysis,
};

/// An analysis offered by some plugin, plus the identity of its owner.
#[derive(Clone)]
pub struct RegisteredAnalysis {
    pub analysis: Arc<dyn Analysis>,
    pub plugin_name: String,
    pub plugin_url: String,
}

/// A file format advertised by a plugin.
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredFormat {
    pub extension: String,
    pub plugin_name: String,
    pub plugin_url: String,
}

/// One edge in the conversion graph.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionEdge {
    pub source: String,
    pub target: String,
    pub plugin_name: String,
    pub plugin_url: String,
}

/// Result of checking whether a conversion can be performed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConversionCheck {
    pub possible: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub blockers: Vec<String>,
}

impl ConversionCheck {
    fn ok() -> Self {
        Self {
            possible: true,
            ..Self::default()
        }
    }

    fn blocked(blocker: String) -> Self {
        Self {
            possible: false,
            blockers: vec![blocker],
            ..Self::default()
        }
    }
}

/// How thoroughly [`CapabilityRegistry::check`] verifies a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    /// Path existence plus the first edge's precondition. Cheap, no HTTP.
    Quick,
    /// Verify every edge, materializing intermediate games via their plugins.
    Full,
}

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("no conversion path from {from} to {to}")]
    NoPath { from: String, to: String },

    #[error("cannot convert {from} to {to}: {}", .blockers.join(", "))]
    Blocked {
        from: String,
        to: String,
        blockers: Vec<String>,
    },

    #[error("conversion {from} to {to} failed")]
    Remote {
        from: String,
        to: String,
        #[source]
        source: PluginError,
    },
}

#[derive(Default)]
struct Inner {
    analyses: BTreeMap<String, RegisteredAnalysis>,
    formats: HashMap<String, RegisteredFormat>,
    conversions: HashMap<(String, String), ConversionEdge>,
}

/// Registry of analyses, formats, and conversions across all plugins.
pub struct CapabilityRegistry {
    inner: RwLock<Inner>,
    submit_timeout: Duration,
    convert_timeout: Duration,
    poll: PollSettings,
}

impl CapabilityRegistry {
    pub fn new(submit_timeout: Duration, convert_timeout: Duration, poll: PollSettings) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            submit_timeout,
            convert_timeout,
            poll,
        }
    }

    /// Register everything a plugin's `/info` advertises, atomically.
    /// Last registration wins for both analysis names and conversion edges.
    pub fn register_plugin(&self, plugin_name: &str, plugin_url: &str, info: &PluginInfo) {
        let url = plugin_url.trim_end_matches('/').to_string();
        let mut inner = self.inner.write().unwrap();

        for descriptor in &info.analyses {
            let analysis = RemoteAnalysis::new(url.clone(), descriptor.clone())
                .with_timeouts(self.submit_timeout, self.poll.clone());
            inner.analyses.insert(
                descriptor.name.clone(),
                RegisteredAnalysis {
                    analysis: Arc::new(analysis),
                    plugin_name: plugin_name.to_string(),
                    plugin_url: url.clone(),
                },
            );
            tracing::info!(analysis = %descriptor.name, plugin = plugin_name, "registered analysis");
        }

        for extension in &info.formats {
            let ext = extension.to_lowercase();
            inner.formats.insert(
                ext.clone(),
                RegisteredFormat {
                    extension: ext.clone(),
                    plugin_name: plugin_name.to_string(),
                    plugin_url: url.clone(),
                },
            );
            tracing::info!(format = %ext, plugin = plugin_name, "registered format");
        }

        for conv in &info.conversions {
            inner.conversions.insert(
                (conv.source.clone(), conv.target.clone()),
                ConversionEdge {
                    source: conv.source.clone(),
                    target: conv.target.clone(),
                    plugin_name: plugin_name.to_string(),
                    plugin_url: url.clone(),
                },
            );
            tracing::info!(
                source = %conv.source,
                target = %conv.target,
                plugin = plugin_name,
                "registered conversion"
            );
        }
    }

    pub fn analyses(&self) -> Vec<RegisteredAnalysis> {
        let inner = self.inner.read().unwrap();
        inner.analyses.values().cloned().collect()
    }

    pub fn get_analysis(&self, name: &str) -> Option<RegisteredAnalysis> {
        let inner = self.inner.read().unwrap();
        inner.analyses.get(name).cloned()
    }

    pub fn analysis_names(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        inner.analyses.keys().cloned().collect()
    }

    pub fn formats(&self) -> Vec<RegisteredFormat> {
        let inner = self.inner.read().unwrap();
        inner.formats.values().cloned().collect()
    }

    /// Shortest conversion path from `source` to `target`, as the sequence
    /// of edges to apply. `source == target` yields the empty path; `None`
    /// means no path exists.
    pub fn find_path(&self, source: &str, target: &str) -> Option<Vec<ConversionEdge>> {
        let inner = self.inner.read().unwrap();
        find_path_in(&inner.conversions, source, target)
    }

    fn edge_precondition(game: &Game, edge: &ConversionEdge) -> ConversionCheck {
        if game.format_name == edge.source {
            ConversionCheck::ok()
        } else {
            ConversionCheck::blocked(format!(
                "Game format '{}' is not '{}'",
                game.format_name, edge.source
            ))
        }
    }

    /// Check whether `game` can be converted to `target`.
    ///
    /// Quick mode never talks to a plugin; full mode materializes
    /// intermediate games edge by edge and reports the first failure as a
    /// blocker.
    pub async fn check(&self, game: &Game, target: &str, mode: CheckMode) -> ConversionCheck {
        match mode {
            CheckMode::Quick => self.check_quick(game, target),
            CheckMode::Full => self.check_full(game, target).await,
        }
    }

    /// Path-existence check plus the first edge's precondition.
    pub fn check_quick(&self, game: &Game, target: &str) -> ConversionCheck {
        let source = &game.format_name;
        if source == target {
            return ConversionCheck {
                possible: true,
                warnings: vec!["Already in target format".to_string()],
                blockers: Vec::new(),
            };
        }

        let Some(path) = self.find_path(source, target) else {
            return ConversionCheck::blocked(format!(
                "No conversion path from {source} to {target}"
            ));
        };

        let first = Self::edge_precondition(game, &path[0]);
        if !first.possible {
            return first;
        }

        let mut warnings = first.warnings;
        if path.len() > 1 {
            warnings.insert(0, format!("Requires {}-step conversion", path.len()));
        }
        ConversionCheck {
            possible: true,
            warnings,
            blockers: Vec::new(),
        }
    }

    async fn check_full(&self, game: &Game, target: &str) -> ConversionCheck {
        let source = game.format_name.clone();
        if source == target {
            return self.check_quick(game, target);
        }

        let Some(path) = self.find_path(&source, target) else {
            return ConversionCheck::blocked(format!(
                "No conversion path from {source} to {target}"
            ));
        };

        let mut warnings = Vec::new();
        let mut current = game.clone();
        let last = path.len() - 1;

        for (i, edge) in path.iter().enumerate() {
            let check = Self::edge_precondition(&current, edge);
            if !check.possible {
                return ConversionCheck {
                    possible: false,
                    warnings,
                    blockers: check.blockers,
                };
            }
            warnings.extend(check.warnings);

            // Later preconditions need the materialized intermediate.
            if i < last {
                match self.apply_edge(&current, edge).await {
                    Ok(converted) => current = converted,
                    Err(e) => {
                        return ConversionCheck {
                            possible: false,
                            warnings,
                            blockers: vec![format!("Intermediate conversion failed: {e}")],
                        };
                    }
                }
            }
        }

        if path.len() > 1 {
            warnings.insert(0, format!("Requires {}-step conversion", path.len()));
        }
        ConversionCheck {
            possible: true,
            warnings,
            blockers: Vec::new(),
        }
    }

    /// Convert `game` to `target` by folding it through the shortest path.
    pub async fn convert(&self, game: &Game, target: &str) -> Result<Game, ConversionError> {
        let source = game.format_name.clone();
        if source == target {
            return Ok(game.clone());
        }

        let path = self
            .find_path(&source, target)
            .ok_or_else(|| ConversionError::NoPath {
                from: source.clone(),
                to: target.to_string(),
            })?;

        let mut current = game.clone();
        for edge in &path {
            let check = Self::edge_precondition(&current, edge);
            if !check.possible {
                return Err(ConversionError::Blocked {
                    from: edge.source.clone(),
                    to: edge.target.clone(),
                    blockers: check.blockers,
                });
            }
            current = self
                .apply_edge(&current, edge)
                .await
                .map_err(|e| ConversionError::Remote {
                    from: edge.source.clone(),
                    to: edge.target.clone(),
                    source: e,
                })?;
        }

        Ok(current)
    }

    async fn apply_edge(&self, game: &Game, edge: &ConversionEdge) -> Result<Game, PluginError> {
        #[derive(serde::Deserialize)]
        struct ConvertResponse {
            game: Game,
        }

        let client = PluginClient::new(edge.plugin_url.clone(), edge.plugin_name.clone());
        let endpoint = format!("/convert/{}-to-{}", edge.source, edge.target);
        tracing::debug!(%endpoint, plugin = %edge.plugin_name, "applying conversion edge");

        let resp: ConvertResponse = client
            .post_json(&endpoint, &json!({ "game": game }), self.convert_timeout)
            .await?;
        Ok(resp.game)
    }

    /// Quick-check every format reachable from the game's own. Targets with
    /// a path are included even when currently blocked.
    pub fn available_conversions(&self, game: &Game) -> BTreeMap<String, ConversionCheck> {
        let targets: HashSet<String> = {
            let inner = self.inner.read().unwrap();
            inner
                .conversions
                .keys()
                .flat_map(|(s, t)| [s.clone(), t.clone()])
                .collect()
        };

        let mut results = BTreeMap::new();
        for target in targets {
            if target == game.format_name {
                continue;
            }
            let check = self.check_quick(game, &target);
            if check.possible || self.find_path(&game.format_name, &target).is_some() {
                results.insert(target, check);
            }
        }
        results
    }
}

fn find_path_in(
    conversions: &HashMap<(String, String), ConversionEdge>,
    source: &str,
    target: &str,
) -> Option<Vec<ConversionEdge>> {
    if source == target {
        return Some(Vec::new());
    }

    let mut neighbors: HashMap<&str, Vec<&ConversionEdge>> = HashMap::new();
    for edge in conversions.values() {
        neighbors.entry(edge.source.as_str()).or_default().push(edge);
    }

    let mut queue: VecDeque<(&str, Vec<ConversionEdge>)> = VecDeque::new();
    let mut visited: HashSet<&str> = HashSet::new();
    queue.push_back((source, Vec::new()));
    visited.insert(source);

    while let Some((current, path)) = queue.pop_front() {
        for edge in neighbors.get(current).into_iter().flatten() {
            let mut new_path = path.clone();
            new_path.push((*edge).clone());
            if edge.target == target {
                return Some(new_path);
            }
            if visited.insert(edge.target.as_str()) {
                queue.push_back((edge.target.as_str(), new_path));
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use workbench_plugin_sdk::ConversionDescriptor;

    fn registry() -> CapabilityRegistry {
        CapabilityRegistry::new(
            Duration::from_secs(2),
            Duration::from_secs(2),
            PollSettings::default(),
        )
    }

    fn info_with_conversions(edges: &[(&str, &str)]) -> PluginInfo {
        PluginInfo {
            api_version: 1,
            conversions: edges
                .iter()
                .map(|(s, t)| ConversionDescriptor {
                    source: s.to_string(),
                    target: t.to_string(),
                })
                .collect(),
            ..PluginInfo::default()
        }
    }

    fn game(format: &str) -> Game {
        serde_json::from_value(json!({
            "id": "g1",
            "title": "Test",
            "players": ["A", "B"],
            "format_name": format
        }))
        .unwrap()
    }

    #[test]
    fn path_to_self_is_empty() {
        let reg = registry();
        assert_eq!(reg.find_path("extensive", "extensive"), Some(Vec::new()));
    }

    #[test]
    fn bfs_finds_shortest_path() {
        let reg = registry();
        // Long way round a -> b -> c -> d plus a shortcut a -> c.
        reg.register_plugin(
            "p1",
            "http://127.0.0.1:5001",
            &info_with_conversions(&[("a", "b"), ("b", "c"), ("c", "d"), ("a", "c")]),
        );

        let path = reg.find_path("a", "d").unwrap();
        assert_eq!(path.len(), 2);
        assert_eq!((path[0].source.as_str(), path[0].target.as_str()), ("a", "c"));
        assert_eq!((path[1].source.as_str(), path[1].target.as_str()), ("c", "d"));

        assert!(reg.find_path("d", "a").is_none());
    }

    #[test]
    fn registration_merges_all_capability_kinds() {
        let reg = registry();
        let info: PluginInfo = serde_json::from_value(serde_json::json!({
            "api_version": 1,
            "analyses": [{
                "name": "Nash Equilibria",
                "description": "",
                "applicable_to": ["normal"],
                "continuous": true,
                "config_schema": {}
            }],
            "formats": [".EFG", ".nfg"],
            "conversions": [{"source": "extensive", "target": "normal"}]
        }))
        .unwrap();
        reg.register_plugin("gambit", "http://127.0.0.1:5001/", &info);

        let registered = reg.get_analysis("Nash Equilibria").unwrap();
        assert_eq!(registered.plugin_url, "http://127.0.0.1:5001");
        assert_eq!(reg.analysis_names(), vec!["Nash Equilibria".to_string()]);

        let mut formats: Vec<String> =
            reg.formats().into_iter().map(|f| f.extension).collect();
        formats.sort();
        assert_eq!(formats, vec![".efg".to_string(), ".nfg".to_string()]);

        assert!(reg.find_path("extensive", "normal").is_some());
    }

    #[test]
    fn last_registration_wins_per_edge() {
        let reg = registry();
        reg.register_plugin("p1", "http://127.0.0.1:5001", &info_with_conversions(&[("a", "b")]));
        reg.register_plugin("p2", "http://127.0.0.1:5002", &info_with_conversions(&[("a", "b")]));

        let path = reg.find_path("a", "b").unwrap();
        assert_eq!(path[0].plugin_name, "p2");
    }

    #[test]
    fn quick_check_flags_multi_step_paths() {
        let reg = registry();
        reg.register_plugin(
            "p1",
            "http://127.0.0.1:5001",
            &info_with_conversions(&[("maid", "extensive"), ("extensive", "normal")]),
        );

        let check = reg.check_quick(&game("maid"), "normal");
        assert!(check.possible);
        assert_eq!(check.warnings[0], "Requires 2-step conversion");

        let same = reg.check_quick(&game("maid"), "maid");
        assert!(same.possible);
        assert_eq!(same.warnings[0], "Already in target format");

        let none = reg.check_quick(&game("normal"), "maid");
        assert!(!none.possible);
        assert_eq!(none.blockers[0], "No conversion path from normal to maid");
    }

    #[test]
    fn available_conversions_cover_reachable_targets() {
        let reg = registry();
        reg.register_plugin(
            "p1",
            "http://127.0.0.1:5001",
            &info_with_conversions(&[("maid", "extensive"), ("extensive", "normal")]),
        );

        let available = reg.available_conversions(&game("maid"));
        assert_eq!(
            available.keys().cloned().collect::<Vec<_>>(),
            vec!["extensive".to_string(), "normal".to_string()]
        );
        assert!(available["extensive"].possible);
        assert!(available["normal"].possible);

        // Nothing is reachable from "normal" in this graph.
        assert!(reg.available_conversions(&game("normal")).is_empty());
    }

    #[tokio::test]
    async fn convert_folds_through_two_hops() {
        let step1 = MockServer::start().await;
        let step2 = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/convert/maid-to-extensive"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "game": {"id": "g1", "title": "Test", "players": ["A", "B"],
                         "format_name": "extensive"}
            })))
            .mount(&step1)
            .await;
        Mock::given(method("POST"))
            .and(path("/convert/extensive-to-normal"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "game": {"id": "g1", "title": "Test", "players": ["A", "B"],
                         "format_name": "normal"}
            })))
            .mount(&step2)
            .await;

        let reg = registry();
        reg.register_plugin("pycid", &step1.uri(), &info_with_conversions(&[("maid", "extensive")]));
        reg.register_plugin("gambit", &step2.uri(), &info_with_conversions(&[("extensive", "normal")]));

        let converted = reg.convert(&game("maid"), "normal").await.unwrap();
        assert_eq!(converted.format_name, "normal");

        let err = reg.convert(&game("normal"), "maid").await.unwrap_err();
        assert!(matches!(err, ConversionError::NoPath { .. }));
    }

    #[tokio::test]
    async fn full_check_reports_intermediate_failures() {
        let step1 = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/convert/maid-to-extensive"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "error": {"code": "CONVERT_ERROR", "message": "bad CPD table"}
            })))
            .mount(&step1)
            .await;

        let reg = registry();
        reg.register_plugin("pycid", &step1.uri(), &info_with_conversions(&[("maid", "extensive")]));
        reg.register_plugin(
            "gambit",
            "http://127.0.0.1:1",
            &info_with_conversions(&[("extensive", "normal")]),
        );

        let check = reg.check(&game("maid"), "normal", CheckMode::Full).await;
        assert!(!check.possible);
        assert!(check.blockers[0].starts_with("Intermediate conversion failed:"));

        // The single-hop full check needs no materialization and passes
        // without touching the failing endpoint's conversion.
        let one_hop = reg.check(&game("maid"), "extensive", CheckMode::Full).await;
        assert!(one_hop.possible);
    }
}
