//! 🚀 bulkx-cli: the front door, the bouncer, the maitre d' of bulkx.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 This binary crate is the thin CLI wrapper that loads config,
//! sets up logging, and then lets the real code do the heavy lifting.
//! Like a manager. 🦆

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// 📦 Bulk-load an NDJSON file into Elasticsearch (or a file, or thin air).
#[derive(Debug, Parser)]
#[command(name = "bulkx", version, about)]
struct Cli {
    /// 🔧 TOML config file. If it doesn't exist, config comes from BULKX_* env vars alone.
    #[arg(default_value = "bulkx.toml")]
    config: PathBuf,
}

/// 🚀 main(): where it all begins. The "I pressed F5 and held my breath" moment.
///
/// 🔧 Steps:
/// 1. Init tracing (so we can see what goes wrong, and when)
/// 2. Parse args
/// 3. Load config (the moment of truth)
/// 4. Run the thing (send it and pray 🙏)
/// 5. Print the scoreboard, or handle errors (cry)
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // 🔒 A missing file is fine (env-only config); an unreadable path is not.
    let config_file = match cli.config.try_exists().context(format!(
        "💀 Couldn't even check whether '{}' exists. Permissions, maybe? Use an absolute path, \
         to be absolutely certain you are not fighting your cwd.",
        cli.config.display()
    ))? {
        true => Some(cli.config.as_path()),
        false => None,
    };

    let app_config = bulkx::load_config(config_file).context(
        "💀 In bulkx-cli, main, we couldn't load the config. Take a look at the file and the BULKX_* env vars; \
         make sure you didn't forget something obvious, like the [transport] section",
    )?;

    match bulkx::run(app_config).await {
        Ok(stats) => {
            println!("{}", bulkx::stats_table(&stats));
            if stats.failed > 0 {
                error!("⚠️ {} operation(s) failed; see the log above for the item errors", stats.failed);
            }
            Ok(())
        }
        Err(err) => {
            error!("💀 error: {}", err);
            // -- 🧅 peel the onion of sadness, one layer at a time
            let mut the_vibes_are_giving_connection_issues = false;
            for cause in err.chain().skip(1) {
                error!("⚠️  cause: {}", cause);
                let cause_str = cause.to_string();
                if cause_str.contains("error sending request")
                    || cause_str.contains("connection refused")
                    || cause_str.contains("Connection refused")
                    || cause_str.contains("tcp connect error")
                    || cause_str.contains("dns error")
                {
                    the_vibes_are_giving_connection_issues = true;
                }
            }

            if the_vibes_are_giving_connection_issues {
                error!(
                    "🔧 hint: looks like the cluster isn't reachable. \
                    Double-check that Elasticsearch is actually running and the [transport] url is right. \
                    If you're using Docker, try `docker ps` to see what's up, or \
                    `docker compose up -d` to resurrect it. ☕"
                );
            }

            // 🗑️ Exit with prejudice. Process exitus maximus.
            std::process::exit(1);
        }
    }
}
