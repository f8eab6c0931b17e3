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

//! `flowhook setup`: turn a setup template into a deployable settings file.
//!
//! Relative paths in the template (the log directory and plugin paths) are
//! resolved against the template's own directory, so a checked-out tree can
//! be configured in place.

use anyhow::{Context, Result};
use flowhook_core::config::{absolutize, resolve_path, SettingsFile};
use flowhook_core::Settings;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct SetupReport {
    pub output: PathBuf,
    pub log_dir: PathBuf,
    pub plugin_paths: Vec<PathBuf>,
}

pub fn run(setup_file: &Path, output: &Path) -> Result<SetupReport> {
    let setup_file = absolutize(setup_file);
    let content = std::fs::read_to_string(&setup_file)
        .with_context(|| format!("Failed to read setup file {}", setup_file.display()))?;
    let mut file: SettingsFile = match setup_file.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&content)
            .with_context(|| format!("Invalid setup file {}", setup_file.display()))?,
        _ => serde_json::from_str(&content)
            .with_context(|| format!("Invalid setup file {}", setup_file.display()))?,
    };

    let base = setup_file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    if let Some(log_dir) = &file.service.log_dir {
        file.service.log_dir = Some(resolve_path(log_dir, &base));
    }
    file.plugins.paths = file
        .plugins
        .paths
        .iter()
        .map(|p| resolve_path(p, &base))
        .collect();

    let settings = Settings::from_parts(file.clone())
        .context("Setup file is not a valid configuration")?;

    let log_dir = settings.log_dir();
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let output = absolutize(output);
    let rendered = serde_json::to_string_pretty(&file)?;
    std::fs::write(&output, rendered)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    tracing::info!(
        output = %output.display(),
        log_dir = %settings.log_dir().display(),
        "Wrote settings"
    );

    Ok(SetupReport {
        output,
        log_dir: settings.log_dir().to_path_buf(),
        plugin_paths: file.plugins.paths,
    })
}
