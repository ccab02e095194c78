//! Game file parsing. The native `.json` format is always available;
//! plugin-advertised extensions (`.efg`, `.nfg`, ...) are registered
//! dynamically when their plugin becomes healthy and are parsed by proxying
//! to the plugin's `POST /parse/{ext}` endpoint.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use workbench_plugin_sdk::{Game, PluginClient, PluginError};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Unsupported format: {ext}. Supported: {}", .supported.join(", "))]
    Unsupported { ext: String, supported: Vec<String> },

    #[error("{message}")]
    Invalid { message: String },

    #[error("Cannot parse {ext} files: plugin service is unreachable ({message})")]
    Unreachable { ext: String, message: String },
}

#[derive(Debug, Clone)]
enum FormatParser {
    NativeJson,
    Remote {
        plugin_name: String,
        plugin_url: String,
    },
}

/// Registry of file-format parsers keyed by lowercase extension (with dot).
pub struct FormatRegistry {
    parsers: RwLock<HashMap<String, FormatParser>>,
    parse_timeout: Duration,
}

impl FormatRegistry {
    pub fn new(parse_timeout: Duration) -> Self {
        let mut parsers = HashMap::new();
        parsers.insert(".json".to_string(), FormatParser::NativeJson);
        Self {
            parsers: RwLock::new(parsers),
            parse_timeout,
        }
    }

    /// Register a plugin-backed parser. Re-registration replaces.
    pub fn register_remote(&self, extension: &str, plugin_name: &str, plugin_url: &str) {
        let ext = normalize_ext(extension);
        let mut parsers = self.parsers.write().unwrap();
        parsers.insert(
            ext,
            FormatParser::Remote {
                plugin_name: plugin_name.to_string(),
                plugin_url: plugin_url.trim_end_matches('/').to_string(),
            },
        );
    }

    pub fn supported(&self) -> Vec<String> {
        let parsers = self.parsers.read().unwrap();
        let mut exts: Vec<String> = parsers.keys().cloned().collect();
        exts.sort();
        exts
    }

    /// Parse game content, inferring the format from the filename.
    pub async fn parse(&self, content: &str, filename: &str) -> Result<Game, ParseError> {
        let ext = Path::new(filename)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_default();

        let parser = {
            let parsers = self.parsers.read().unwrap();
            parsers.get(&ext).cloned()
        };

        match parser {
            Some(FormatParser::NativeJson) => parse_json(content),
            Some(FormatParser::Remote {
                plugin_name,
                plugin_url,
            }) => {
                parse_remote(&plugin_name, &plugin_url, &ext, content, filename, self.parse_timeout)
                    .await
            }
            None => Err(ParseError::Unsupported {
                ext,
                supported: self.supported(),
            }),
        }
    }
}

fn normalize_ext(extension: &str) -> String {
    let ext = extension.to_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{ext}")
    }
}

fn parse_json(content: &str) -> Result<Game, ParseError> {
    let game: Game = serde_json::from_str(content).map_err(|e| ParseError::Invalid {
        message: format!("invalid game JSON: {e}"),
    })?;
    if game.id.is_empty() {
        return Err(ParseError::Invalid {
            message: "game id must not be empty".to_string(),
        });
    }
    if game.format_name.is_empty() {
        return Err(ParseError::Invalid {
            message: "game format_name must not be empty".to_string(),
        });
    }
    Ok(game)
}

async fn parse_remote(
    plugin_name: &str,
    plugin_url: &str,
    ext: &str,
    content: &str,
    filename: &str,
    timeout: Duration,
) -> Result<Game, ParseError> {
    #[derive(serde::Deserialize)]
    struct ParseResponse {
        game: Game,
    }

    let client = PluginClient::new(plugin_url, plugin_name);
    let endpoint = format!("/parse/{}", ext.trim_start_matches('.'));
    let body = json!({ "content": content, "filename": filename });

    let resp: ParseResponse = client
        .post_json(&endpoint, &body, timeout)
        .await
        .map_err(|e| match e {
            PluginError::Unreachable { message, .. } => ParseError::Unreachable {
                ext: ext.to_string(),
                message,
            },
            PluginError::Status { error, .. } => ParseError::Invalid {
                message: format!("Failed to parse {filename}: {}", error.message),
            },
            other => ParseError::Invalid {
                message: format!("Failed to parse {filename}: {other}"),
            },
        })?;
    Ok(resp.game)
}
