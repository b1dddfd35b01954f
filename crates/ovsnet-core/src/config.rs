//! Environment loading for ovsnet components
//!
//! Variables are read from the first existing file among `$OVSNET_ENV_FILE`,
//! `/etc/ovsnet/environment` and `.env`. Variables that are already present
//! in the process environment are never overridden, so the service unit or
//! the shell always wins over the file.

use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Variable naming a custom environment file
pub const ENV_FILE_VAR: &str = "OVSNET_ENV_FILE";

/// Candidate environment files, in priority order
pub const ENV_FILE_PATHS: &[&str] = &["/etc/ovsnet/environment", ".env"];

/// Load the first environment file found. Returns the path that was loaded.
pub fn load_environment() -> Option<String> {
    if let Ok(custom_path) = std::env::var(ENV_FILE_VAR) {
        if let Some(path) = try_load_env_file(&custom_path) {
            return Some(path);
        }
    }

    for path in ENV_FILE_PATHS {
        if let Some(loaded) = try_load_env_file(path) {
            return Some(loaded);
        }
    }

    debug!("No environment file found, using process environment");
    None
}

fn try_load_env_file(path: &str) -> Option<String> {
    let path_obj = Path::new(path);
    if !path_obj.exists() {
        return None;
    }

    let content = match fs::read_to_string(path_obj) {
        Ok(content) => content,
        Err(e) => {
            warn!("Failed to read environment file {}: {}", path, e);
            return None;
        }
    };

    let mut loaded = 0;
    let mut skipped = 0;
    for (key, value) in content.lines().filter_map(parse_env_line) {
        if std::env::var(&key).is_err() {
            std::env::set_var(&key, &value);
            loaded += 1;
        } else {
            skipped += 1;
            debug!("Skipped (already set): {}", key);
        }
    }

    info!(
        "Loaded {} variables from {} ({} already set)",
        loaded, path, skipped
    );
    Some(path.to_string())
}

/// Parse `KEY=VALUE`, `KEY="VALUE"` or `KEY='VALUE'`; comments and blanks yield None.
pub fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    let value = value.trim();
    if key.is_empty() {
        return None;
    }

    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value);

    Some((key.to_string(), value.to_string()))
}

/// Get an optional, non-empty configuration value.
pub fn get_config_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Get a boolean configuration value.
pub fn get_config_bool(key: &str) -> Option<bool> {
    get_config_opt(key).map(|v| parse_bool(&v))
}

/// Truthy strings accepted by both env vars and network options.
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_line_simple() {
        let (k, v) = parse_env_line("OVSNET_DATA_DIR=/data").unwrap();
        assert_eq!(k, "OVSNET_DATA_DIR");
        assert_eq!(v, "/data");
    }

    #[test]
    fn test_parse_env_line_quoted() {
        let (_, v) = parse_env_line("FOO=\"bar baz\"").unwrap();
        assert_eq!(v, "bar baz");
        let (_, v) = parse_env_line("FOO='bar'").unwrap();
        assert_eq!(v, "bar");
    }

    #[test]
    fn test_parse_env_line_skips_comments() {
        assert!(parse_env_line("# comment").is_none());
        assert!(parse_env_line("").is_none());
        assert!(parse_env_line("=value").is_none());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("TRUE"));
        assert!(parse_bool("on"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool(""));
    }
}
