// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Flowhook CLI
//!
//! Command-line tools around the Flowhook rule runtime.

mod logging;
mod replay;
mod setup;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flowhook_core::{
    ConfigError, CredentialProvider, ScriptCredentials, Settings, StaticCredentials,
};
use flowhook_plugins::PluginHost;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(name = "flowhook")]
#[command(about = "Flowhook - event rules for the production-tracking service", long_about = None)]
struct Cli {
    /// Settings file (JSON, or TOML by extension)
    #[arg(short, long, env = "FLOWHOOK_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Verbose mode
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a settings file from a setup template
    Setup {
        /// Setup template; relative paths in it resolve against its directory
        #[arg(long, default_value = "setup.json")]
        setup_file: PathBuf,

        /// Where to write the settings
        #[arg(long, default_value = "config.json")]
        output: PathBuf,
    },

    /// Load and validate the settings, then print the resolved values
    CheckConfig,

    /// List the built-in plugins and their registrations
    Plugins,

    /// Run the built-in rules over recorded events against fixture data
    Replay {
        /// JSON array of events
        #[arg(long)]
        events: PathBuf,

        /// JSON fixtures for the in-memory tracking service
        #[arg(long)]
        fixtures: PathBuf,

        /// Event id file to resume from and update [default: the configured event id file]
        #[arg(long)]
        state: Option<PathBuf>,

        /// Per-handler time budget in seconds
        #[arg(long)]
        handler_timeout_secs: Option<u64>,

        /// Events per batch (defaults to the configured batch size)
        #[arg(long)]
        batch_size: Option<usize>,

        /// Print the summary and updates as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Setup { setup_file, output } => {
            let _guards = logging::init(None, cli.verbose)?;
            let report = setup::run(&setup_file, &output)?;
            println!("Wrote {}", report.output.display());
            println!("Log directory: {}", report.log_dir.display());
            for path in &report.plugin_paths {
                println!("Plugin path: {}", path.display());
            }
        }

        Commands::CheckConfig => {
            let settings = Settings::load(cli.config.as_deref()).context("Invalid configuration")?;
            let _guards = logging::init(Some(&settings), cli.verbose)?;
            print_settings(&settings);
        }

        Commands::Plugins => {
            let settings = optional_settings(cli.config.as_ref())?;
            let _guards = logging::init(settings.as_deref(), cli.verbose)?;

            let credentials = credential_provider(settings.as_ref());
            let mut host = PluginHost::new(credentials, LevelFilter::INFO);
            let plugins = flowhook_rules::builtin_plugins();
            host.load_all(&plugins);

            for plugin in &plugins {
                println!("{}", plugin.name());
                for registration in host.registry().for_plugin(plugin.name()) {
                    println!(
                        "  #{} {} on {} as {}",
                        registration.id,
                        registration.handler_name(),
                        registration.filter_description(),
                        registration.credentials.script_name
                    );
                }
            }
            if let Some(settings) = &settings {
                for path in settings.plugin_search_paths() {
                    println!("search path: {}", path.display());
                }
            }
        }

        Commands::Replay {
            events,
            fixtures,
            state,
            handler_timeout_secs,
            batch_size,
            json,
        } => {
            let settings = optional_settings(cli.config.as_ref())?;
            let _guards = logging::init(settings.as_deref(), cli.verbose)?;

            let output = replay::run(
                replay::ReplayArgs {
                    events,
                    fixtures,
                    state,
                    handler_timeout: handler_timeout_secs.map(Duration::from_secs),
                    batch_size,
                    echo: !json,
                },
                settings,
            )
            .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                let summary = &output.summary;
                println!(
                    "\n{} events in {} batches, {} failures, {} updates, last event {:?}",
                    summary.events,
                    summary.batches,
                    summary.failures,
                    summary.updates,
                    summary.last_event_id
                );
                for update in &output.updates {
                    println!(
                        "update {} #{}: {}",
                        update.entity_type,
                        update.id,
                        serde_json::Value::Object(update.data.clone())
                    );
                }
            }
        }
    }

    Ok(())
}

/// Settings for commands that can run without them: a missing default file
/// is fine, an explicitly named one is not.
fn optional_settings(explicit: Option<&PathBuf>) -> Result<Option<Arc<Settings>>> {
    match Settings::load(explicit.map(PathBuf::as_path)) {
        Ok(settings) => Ok(Some(Arc::new(settings))),
        Err(ConfigError::NotFound(_)) if explicit.is_none() => Ok(None),
        Err(e) => Err(e).context("Invalid configuration"),
    }
}

fn credential_provider(settings: Option<&Arc<Settings>>) -> Arc<dyn CredentialProvider> {
    match settings {
        Some(settings) => Arc::clone(settings) as Arc<dyn CredentialProvider>,
        None => Arc::new(StaticCredentials(ScriptCredentials::new("flowhook", ""))),
    }
}

fn print_settings(settings: &Settings) {
    let path = settings
        .path()
        .map_or_else(|| "<none>".to_string(), |p| p.display().to_string());
    println!("settings file:      {path}");
    println!("server:             {}", settings.connection_url());
    println!("script name:        {}", settings.engine_credentials().script_name);
    println!("proxy:              {}", settings.proxy_server().unwrap_or("<none>"));
    println!("session uuid:       {}", settings.use_session_uuid());
    println!("service name:       {}", settings.service_name());
    println!("log dir:            {}", settings.log_dir().display());
    println!("log file:           {}", settings.log_file(None).display());
    match settings.timing_log_file() {
        Some(path) => println!("timing log:         {}", path.display()),
        None => println!("timing log:         off"),
    }
    println!("log level:          {} ({})", settings.log_level(), settings.log_level_filter());
    println!("log mode:           {:?}", settings.log_mode());
    println!("event id file:      {}", settings.event_id_file().display());
    println!("pid file:           {}", settings.pid_file().display());
    println!("retry sleep:        {:?}", settings.retry_sleep());
    println!("max retries:        {}", settings.max_retries());
    println!("fetch interval:     {:?}", settings.fetch_interval());
    println!("batch size:         {}", settings.max_batch_size());
    for path in settings.plugin_search_paths() {
        println!("plugin path:        {}", path.display());
    }
    for plugin in settings.file().plugins.credentials.keys() {
        println!("plugin credentials: {plugin}");
    }
    let email = settings.email();
    if email.is_complete() {
        println!(
            "email:              {}:{} -> {}",
            email.server.as_deref().unwrap_or_default(),
            email.port,
            email.to.join(", ")
        );
        if let Some(subject) = settings.email_subject() {
            println!("email subject:      {subject}");
        }
    } else {
        println!("email:              off");
    }
}
