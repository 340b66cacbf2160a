//! 🔧 App Configuration: the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." -- every developer at 3am 🦆
//!
//! 🏗️ Powered by Figment, because manually parsing env vars is a form of
//! self-harm that even the borrow checker wouldn't approve of.

use std::path::{Path, PathBuf};

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::processor::ProcessorConfig;
use crate::transport::TransportConfig;

/// 📦 Everything `run` needs: how to batch, where to send, what to read.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// 🧵 Batching, workers, retries. Every field has a default.
    #[serde(default)]
    pub processor: ProcessorConfig,
    pub transport: TransportConfig,
    pub input: InputConfig,
}

/// 📂 The NDJSON file to bulk-load: one document per line.
#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    pub file_name: PathBuf,
    /// 📡 Index stamped on every op. Falls back to the processor's default target.
    #[serde(default)]
    pub index: Option<String>,
}

/// 🚀 Load the config: env vars (`BULKX_*`, nested keys split on `__`) layered under an optional
/// TOML file.
///
/// 📐 No file means env vars only. With a file, both are merged and the file wins on conflicts.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("BULKX_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (BULKX_*). \
             The file exists in our hearts, but apparently not on disk.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (BULKX_*). \
                 No file was provided, so this one's all on the environment. Classic."
            .to_string(),
    };

    config.extract().context(context_msg)
}
