use {
    color_eyre::Report,
    eyre::WrapErr,
    std::{path::PathBuf, time::Duration},
};

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Collect traversal stats from the first frame on.
    pub enabled: bool,

    /// Averaging window of the ray-rate counter, in seconds.
    pub rate_window: f32,
}

impl Default for StatsConfig {
    fn default() -> Self {
        StatsConfig {
            enabled: false,
            rate_window: 1.0,
        }
    }
}

impl StatsConfig {
    pub fn rate_window(&self) -> Duration {
        // Sub-100ms windows only show scheduling jitter.
        Duration::from_secs_f32(self.rate_window.max(0.1))
    }

    pub fn load_default() -> Result<Self, Report> {
        // Load from predefined file path for desktop platforms.
        let path = std::env::var("RAYMETRICS_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./raymetrics.ron"));

        if !path.exists() {
            return Ok(StatsConfig::default());
        }

        Self::load(path)
    }

    #[tracing::instrument]
    pub fn load(path: PathBuf) -> Result<Self, Report> {
        let file = std::fs::File::open(&path)
            .wrap_err_with(|| format!("Failed to open {}", path.display()))?;
        Ok(ron::de::from_reader(file)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_disabled() {
        let config = StatsConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.rate_window(), Duration::from_secs(1));
    }

    #[test]
    fn parses_ron() {
        let config: StatsConfig =
            ron::de::from_str("(enabled: true, rate_window: 2.5)").unwrap();
        assert!(config.enabled);
        assert_eq!(config.rate_window(), Duration::from_secs_f32(2.5));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: StatsConfig = ron::de::from_str("(enabled: true)").unwrap();
        assert!(config.enabled);
        assert_eq!(config.rate_window, 1.0);
    }

    #[test]
    fn tiny_windows_are_clamped() {
        let config: StatsConfig =
            ron::de::from_str("(rate_window: 0.0)").unwrap();
        assert_eq!(config.rate_window(), Duration::from_secs_f32(0.1));
    }
}
