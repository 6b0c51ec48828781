use std::env;
use tracing::warn;

/// Session settings. There are no flags or config files; a couple of
/// environment variables can override the defaults.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Config {
    pub(crate) prompt: String,
    pub(crate) module_name: String,
    /// Run the constant folding / dead code passes on each definition.
    pub(crate) optimize: bool,
    /// Interpreter call depth at which evaluation is abandoned.
    pub(crate) max_call_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            prompt: "ready> ".to_owned(),
            module_name: "my cool jit".to_owned(),
            optimize: true,
            max_call_depth: 1_000,
        }
    }
}

impl Config {
    /// Defaults, overridden by `KALEIDOSCOPE_OPTIMIZE` (`0`/`false` turns
    /// the passes off) and `KALEIDOSCOPE_MAX_CALL_DEPTH`.
    pub(crate) fn from_env() -> Self {
        Self::from_vars(|key| env::var(key).ok())
    }

    fn from_vars<F: Fn(&str) -> Option<String>>(var: F) -> Self {
        let mut config = Config::default();
        if let Some(v) = var("KALEIDOSCOPE_OPTIMIZE") {
            config.optimize = match v.trim() {
                "0" | "false" | "off" | "no" => false,
                _ => true,
            };
        }
        if let Some(v) = var("KALEIDOSCOPE_MAX_CALL_DEPTH") {
            match v.trim().parse() {
                Ok(depth) => config.max_call_depth = depth,
                Err(e) => warn!(value = %v, error = %e, "ignoring KALEIDOSCOPE_MAX_CALL_DEPTH"),
            }
        }
        config
    }
}
