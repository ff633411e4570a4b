//! Shared CLI utilities for strata-mcl binary tools.

use std::io::Read;
use std::path::Path;

use crate::config::CommandListConfig;

/// Initialize tracing/logging to stderr.
///
/// If `disable` is true, no output is produced.
/// Otherwise respects `RUST_LOG` env var, defaulting to WARN.
pub fn init_logging(disable: bool) {
    use tracing_subscriber::EnvFilter;

    if disable {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Read a binary container from a file path or stdin.
pub fn read_binary_input(file: Option<&Path>, use_stdin: bool) -> Result<Vec<u8>, String> {
    if let Some(path) = file {
        return std::fs::read(path).map_err(|e| format!("Failed to read file '{}': {}", path.display(), e));
    }

    if use_stdin {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .map_err(|e| format!("Failed to read stdin: {}", e))?;
        return Ok(buf);
    }

    Err("No input provided. Use --file or --stdin".to_string())
}

/// Config from a JSON file, or the defaults.
pub fn load_config(path: Option<&Path>) -> Result<CommandListConfig, String> {
    match path {
        Some(p) => CommandListConfig::from_json_file(p).map_err(|e| e.to_string()),
        None => Ok(CommandListConfig::default()),
    }
}
