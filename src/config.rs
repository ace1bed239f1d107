//! Bridge configuration.
//!
//! Configuration is a TOML file with an `[account]` table and one
//! `[app.<name>]` or `[terminal.<name>]` table per exposed application:
//!
//! ```toml
//! [account]
//! api_key = "..."
//!
//! [app.Calculator]
//! command = "python calculator.py"
//! path = "$HOME/demos"
//!
//! [terminal.Shell]
//! command = "bash"
//! ```
//!
//! App slugs default to a slugified name; terminal slugs are always
//! generated. `path` and `command` undergo environment-variable expansion.
//! The core engine receives the validated [`Config`] and never touches the
//! file itself.

// Rust guideline compliant 2026-02

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::identity;

/// Account details from the `[account]` table.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Account {
    /// API key presented during the channel handshake.
    pub api_key: Option<String>,
}

/// Describes a single exposed application.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct App {
    /// Human-readable name.
    pub name: String,
    /// URL token, unique within a bridge instance.
    #[serde(default)]
    pub slug: String,
    /// Working directory for the launched process.
    #[serde(default = "default_path")]
    pub path: String,
    /// Presentational color for the hub UI.
    #[serde(default)]
    pub color: String,
    /// Launch command.
    #[serde(default)]
    pub command: String,
    /// `true` to host the command under a PTY rather than the framed
    /// stdio protocol.
    #[serde(default)]
    pub terminal: bool,
}

fn default_path() -> String {
    "./".to_string()
}

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Account details.
    #[serde(default)]
    pub account: Account,
    /// Exposed applications, in declaration order.
    #[serde(default)]
    pub apps: Vec<App>,
}

/// Raw shape of the TOML file, prior to slug assignment and expansion.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    account: Account,
    #[serde(default)]
    app: BTreeMap<String, RawApp>,
    #[serde(default)]
    terminal: BTreeMap<String, RawApp>,
}

#[derive(Debug, Deserialize)]
struct RawApp {
    #[serde(default)]
    slug: String,
    #[serde(default = "default_path")]
    path: String,
    #[serde(default)]
    color: String,
    #[serde(default)]
    command: String,
}

/// Get a default empty configuration.
#[must_use]
pub fn default_config() -> Config {
    Config::default()
}

/// Load config from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(config_path: &Path) -> Result<Config> {
    let config_data = std::fs::read_to_string(config_path)
        .with_context(|| format!("unable to read config {}", config_path.display()))?;
    let raw: RawConfig = toml::from_str(&config_data)
        .with_context(|| format!("unable to parse config {}", config_path.display()))?;

    let mut apps: Vec<App> = raw
        .app
        .into_iter()
        .map(|(name, app)| make_app(name, app, false))
        .collect();
    apps.extend(
        raw.terminal
            .into_iter()
            .map(|(name, app)| make_app(name, app, true)),
    );

    Ok(Config {
        account: raw.account,
        apps,
    })
}

fn make_app(name: String, raw: RawApp, terminal: bool) -> App {
    let slug = if terminal {
        identity::generate().to_lowercase()
    } else if raw.slug.is_empty() {
        slugify(&name)
    } else {
        raw.slug
    };
    App {
        name,
        slug,
        path: expand_vars(&raw.path),
        color: raw.color,
        command: expand_vars(&raw.command),
        terminal,
    }
}

/// Expand `$VAR` / `${VAR}` references, leaving unknown variables in place.
fn expand_vars(value: &str) -> String {
    shellexpand::env_with_context_no_errors(value, |name| std::env::var(name).ok()).into_owned()
}

/// Reduce a name to a URL-safe slug.
///
/// Lowercases, maps whitespace runs to single dashes, and drops everything
/// that is not alphanumeric or a dash.
#[must_use]
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for character in name.chars() {
        if character.is_whitespace() || character == '-' || character == '_' {
            if !last_dash {
                slug.push('-');
                last_dash = true;
            }
        } else if character.is_alphanumeric() {
            slug.extend(character.to_lowercase());
            last_dash = false;
        }
    }
    if slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("My Calculator App"), "my-calculator-app");
        assert_eq!(slugify("  Spaced  Out  "), "spaced-out");
        assert_eq!(slugify("Emoji ✨ Name"), "emoji-name");
        assert_eq!(slugify("already-slugged"), "already-slugged");
    }

    #[test]
    fn test_load_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[account]
api_key = "abc123"

[app.Calculator]
command = "python calc.py"
color = "red"

[terminal.Shell]
command = "bash"
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.account.api_key.as_deref(), Some("abc123"));
        assert_eq!(config.apps.len(), 2);

        let calculator = &config.apps[0];
        assert_eq!(calculator.name, "Calculator");
        assert_eq!(calculator.slug, "calculator");
        assert!(!calculator.terminal);

        let shell = &config.apps[1];
        assert_eq!(shell.name, "Shell");
        assert!(shell.terminal);
        // Terminal slugs are generated, never derived from the name.
        assert_eq!(shell.slug.len(), 12);
        assert_eq!(shell.slug, shell.slug.to_lowercase());
    }

    #[test]
    fn test_expand_vars() {
        std::env::set_var("GANGLION_TEST_DIR", "/tmp/apps");
        assert_eq!(expand_vars("$GANGLION_TEST_DIR/demo"), "/tmp/apps/demo");
        // Unknown variables are left in place rather than erroring.
        assert_eq!(
            expand_vars("$GANGLION_TEST_UNSET/demo"),
            "$GANGLION_TEST_UNSET/demo"
        );
    }

    #[test]
    fn test_missing_config_errors() {
        assert!(load_config(Path::new("/nonexistent/ganglion.toml")).is_err());
    }
}
