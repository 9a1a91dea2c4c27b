//! Marketplace configuration

use serde::{Deserialize, Serialize};

/// Tunables of the marketplace core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Credits granted to a new agent at registration.
    #[serde(default = "default_initial_credits")]
    pub initial_credits: u64,

    /// Platform share of every settled task, 0.0-0.5.
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,

    /// Default window for the poster to review a delivery, in seconds.
    #[serde(default = "default_review_window")]
    pub review_window_secs: u64,

    /// Default window for a claimed task to be delivered, in seconds.
    #[serde(default = "default_delivery_window")]
    pub delivery_window_secs: u64,

    /// Default window for a posted task to be claimed before it expires,
    /// in seconds.
    #[serde(default = "default_post_window")]
    pub post_window_secs: u64,

    /// Review window for delivered system tasks, in seconds.
    #[serde(default = "default_system_review_window")]
    pub system_review_window_secs: u64,

    /// How long a match sub-task may run before the parent falls back to
    /// broadcast, in seconds.
    #[serde(default = "default_match_window")]
    pub match_window_secs: u64,

    /// Default rejections allowed before a task terminates in `rejected`.
    #[serde(default = "default_max_rejections")]
    pub max_rejections: u32,

    /// Credits offered for a match sub-task.
    #[serde(default = "default_match_credits")]
    pub match_credits: u64,

    /// Credits offered for a verification sub-task.
    #[serde(default = "default_verify_credits")]
    pub verify_credits: u64,

    /// Ranked agents accepted from a single match result.
    #[serde(default = "default_max_match_results")]
    pub max_match_results: usize,

    /// Abandons within the cooldown window before pickups are refused.
    #[serde(default = "default_max_abandons")]
    pub max_abandons_before_cooldown: u32,

    /// Length of the abandon cooldown, in seconds.
    #[serde(default = "default_abandon_cooldown")]
    pub abandon_cooldown_secs: u64,

    /// Per-agent event stream buffer; overflow drops oldest.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Cap on blocking `get_task` waits, in seconds.
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,

    /// Characters of the need included in `task_posted` events.
    #[serde(default = "default_need_preview_len")]
    pub need_preview_len: usize,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            initial_credits: default_initial_credits(),
            fee_rate: default_fee_rate(),
            review_window_secs: default_review_window(),
            delivery_window_secs: default_delivery_window(),
            post_window_secs: default_post_window(),
            system_review_window_secs: default_system_review_window(),
            match_window_secs: default_match_window(),
            max_rejections: default_max_rejections(),
            match_credits: default_match_credits(),
            verify_credits: default_verify_credits(),
            max_match_results: default_max_match_results(),
            max_abandons_before_cooldown: default_max_abandons(),
            abandon_cooldown_secs: default_abandon_cooldown(),
            event_buffer: default_event_buffer(),
            max_wait_secs: default_max_wait(),
            need_preview_len: default_need_preview_len(),
        }
    }
}

// Default value helpers
fn default_initial_credits() -> u64 {
    100
}

fn default_fee_rate() -> f64 {
    0.10
}

fn default_review_window() -> u64 {
    30 * 60
}

fn default_delivery_window() -> u64 {
    10 * 60
}

fn default_post_window() -> u64 {
    72 * 60 * 60
}

fn default_system_review_window() -> u64 {
    60
}

fn default_match_window() -> u64 {
    120
}

fn default_max_rejections() -> u32 {
    3
}

fn default_match_credits() -> u64 {
    3
}

fn default_verify_credits() -> u64 {
    5
}

fn default_max_match_results() -> usize {
    20
}

fn default_max_abandons() -> u32 {
    5
}

fn default_abandon_cooldown() -> u64 {
    30 * 60
}

fn default_event_buffer() -> usize {
    256
}

fn default_max_wait() -> u64 {
    300
}

fn default_need_preview_len() -> usize {
    80
}

impl MarketConfig {
    /// Load configuration from an optional file plus `PINCHWORK_`-prefixed
    /// environment variables.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&MarketConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("PINCHWORK")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: MarketConfig = builder.build()?.try_deserialize()?;
        Ok(loaded.clamped())
    }

    /// Clamp the fee rate to the supported 0-50% range.
    pub fn clamped(mut self) -> Self {
        self.fee_rate = self.fee_rate.clamp(0.0, 0.5);
        self
    }
}
