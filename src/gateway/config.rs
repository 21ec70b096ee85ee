use serde::{Deserialize, Serialize};

pub const DEFAULT_POOL_KEY: &str = "default";

pub const DEFAULT_BUCKET_RANGES: &str = "1024,2048,4096,8192,16384";
pub const DEFAULT_BUCKET_WEIGHTS: &str = "30,25,20,15,10";

/// Load-balancing algorithm tag. Changing it in a settings update triggers a
/// smooth runtime swap even though both tags currently resolve to the same
/// sampling strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    Traditional,
    ObjectPool,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Traditional => "traditional",
            Algorithm::ObjectPool => "object_pool",
        }
    }
}

/// Every tunable of the balancing subsystem. All numeric fields clamp on
/// ingestion via [`BalancerSettings::normalize`]; a settings document coming
/// off disk or the admin API is never trusted to be in range.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerSettings {
    pub algorithm: Algorithm,
    /// Instances drawn per sampling round.
    pub sample_count: i64,
    /// Sampling rounds before the acquire gives up.
    pub sampling_rounds: i64,
    /// Pool-variant draw size; carried for settings-document parity.
    pub sampling_size: i64,
    pub dynamic_bucketing_enabled: bool,
    /// Model context budget in K tokens, used to derive default boundaries.
    pub max_context_k: i64,
    pub bucket_count: i64,
    /// CSV of bucket upper bounds in tokens.
    pub bucket_ranges: String,
    /// CSV of bucket weights.
    pub bucket_weights: String,
    pub histogram_sample_size: i64,
    /// Legacy fixed refresh interval; superseded by the adaptive min/max pair.
    pub bucket_update_interval_seconds: i64,
    pub bucket_update_interval_min_seconds: i64,
    pub bucket_update_interval_max_seconds: i64,
    /// CSV of pool keys; pools are tried in this order.
    pub ordered_pool_keys: String,
    pub queue_capacity: i64,
    pub tune_interval_seconds: i64,
    pub cas_retry_sample_size: i64,
    pub reject_high_threshold: f64,
    pub forced_release_high_threshold: f64,
    pub cas_retry_p95_high_threshold: f64,
    pub short_bucket_weight: i64,
    pub medium_bucket_weight: i64,
    pub long_bucket_weight: i64,
}

impl Default for BalancerSettings {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Traditional,
            sample_count: 2,
            sampling_rounds: 2,
            sampling_size: 3,
            dynamic_bucketing_enabled: true,
            max_context_k: 32,
            bucket_count: 5,
            bucket_ranges: DEFAULT_BUCKET_RANGES.to_string(),
            bucket_weights: DEFAULT_BUCKET_WEIGHTS.to_string(),
            histogram_sample_size: 600,
            bucket_update_interval_seconds: 15,
            bucket_update_interval_min_seconds: 3,
            bucket_update_interval_max_seconds: 60,
            ordered_pool_keys: DEFAULT_POOL_KEY.to_string(),
            queue_capacity: 128,
            tune_interval_seconds: 300,
            cas_retry_sample_size: 256,
            reject_high_threshold: 0.30,
            forced_release_high_threshold: 0.20,
            cas_retry_p95_high_threshold: 2.5,
            short_bucket_weight: 45,
            medium_bucket_weight: 35,
            long_bucket_weight: 20,
        }
    }
}

impl BalancerSettings {
    /// Clamps every field into its documented range.
    pub fn normalize(&mut self) {
        self.sample_count = self.sample_count.max(1);
        self.sampling_rounds = self.sampling_rounds.max(1);
        self.sampling_size = self.sampling_size.max(1);
        self.max_context_k = self.max_context_k.max(1);
        self.bucket_count = self.bucket_count.clamp(5, 6);
        if self.bucket_ranges.trim().is_empty() {
            self.bucket_ranges = DEFAULT_BUCKET_RANGES.to_string();
        } else {
            self.bucket_ranges = self.bucket_ranges.trim().to_string();
        }
        if self.bucket_weights.trim().is_empty() {
            self.bucket_weights = DEFAULT_BUCKET_WEIGHTS.to_string();
        } else {
            self.bucket_weights = self.bucket_weights.trim().to_string();
        }
        self.histogram_sample_size = self.histogram_sample_size.max(100);
        self.bucket_update_interval_seconds = clamp_bucket_interval(self.bucket_update_interval_seconds);
        self.bucket_update_interval_min_seconds =
            clamp_bucket_interval(self.bucket_update_interval_min_seconds);
        self.bucket_update_interval_max_seconds =
            clamp_bucket_interval(self.bucket_update_interval_max_seconds);
        if self.ordered_pool_keys.trim().is_empty() {
            self.ordered_pool_keys = DEFAULT_POOL_KEY.to_string();
        } else {
            self.ordered_pool_keys = self.ordered_pool_keys.trim().to_string();
        }
        self.queue_capacity = self.queue_capacity.max(1);
        self.tune_interval_seconds = self.tune_interval_seconds.max(30);
        self.cas_retry_sample_size = self.cas_retry_sample_size.max(32);
        self.reject_high_threshold = clamp_rate(self.reject_high_threshold, 0.30);
        self.forced_release_high_threshold = clamp_rate(self.forced_release_high_threshold, 0.20);
        self.cas_retry_p95_high_threshold = if self.cas_retry_p95_high_threshold.is_finite() {
            self.cas_retry_p95_high_threshold.max(0.1)
        } else {
            2.5
        };
        self.short_bucket_weight = self.short_bucket_weight.max(1);
        self.medium_bucket_weight = self.medium_bucket_weight.max(1);
        self.long_bucket_weight = self.long_bucket_weight.max(1);
    }

    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }

    /// Pool keys in configured order, deduplicated keeping first occurrence.
    pub fn ordered_pool_keys_list(&self) -> Vec<String> {
        parse_ordered_pool_keys(&self.ordered_pool_keys)
    }
}

fn clamp_bucket_interval(seconds: i64) -> i64 {
    seconds.clamp(3, 60)
}

fn clamp_rate(value: f64, default: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        default
    }
}

pub fn parse_ordered_pool_keys(csv: &str) -> Vec<String> {
    let mut keys = Vec::new();
    for part in csv.split(',') {
        let key = part.trim();
        if !key.is_empty() && !keys.iter().any(|existing| existing == key) {
            keys.push(key.to_string());
        }
    }
    if keys.is_empty() {
        keys.push(DEFAULT_POOL_KEY.to_string());
    }
    keys
}

/// Parses a CSV of positive integers, silently dropping invalid tokens.
pub fn parse_csv_positive_ints(csv: &str) -> Vec<i64> {
    csv.split(',')
        .filter_map(|part| part.trim().parse::<i64>().ok())
        .filter(|value| *value > 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_clamps_out_of_range_values() {
        let mut settings = BalancerSettings {
            sample_count: 0,
            sampling_rounds: -3,
            bucket_count: 9,
            histogram_sample_size: 5,
            bucket_update_interval_min_seconds: 0,
            bucket_update_interval_max_seconds: 600,
            queue_capacity: 0,
            reject_high_threshold: 7.5,
            cas_retry_p95_high_threshold: f64::NAN,
            ordered_pool_keys: "  ".to_string(),
            ..BalancerSettings::default()
        };
        settings.normalize();

        assert_eq!(settings.sample_count, 1);
        assert_eq!(settings.sampling_rounds, 1);
        assert_eq!(settings.bucket_count, 6);
        assert_eq!(settings.histogram_sample_size, 100);
        assert_eq!(settings.bucket_update_interval_min_seconds, 3);
        assert_eq!(settings.bucket_update_interval_max_seconds, 60);
        assert_eq!(settings.queue_capacity, 1);
        assert_eq!(settings.reject_high_threshold, 1.0);
        assert_eq!(settings.cas_retry_p95_high_threshold, 2.5);
        assert_eq!(settings.ordered_pool_keys, DEFAULT_POOL_KEY);
    }

    #[test]
    fn pool_keys_dedupe_preserving_order() {
        assert_eq!(
            parse_ordered_pool_keys("premium, default ,premium,,fallback"),
            vec!["premium", "default", "fallback"]
        );
        assert_eq!(parse_ordered_pool_keys(""), vec![DEFAULT_POOL_KEY]);
    }

    #[test]
    fn csv_parse_drops_garbage_and_non_positive() {
        assert_eq!(
            parse_csv_positive_ints("1024, 2048, x, -5, 0, 4096"),
            vec![1024, 2048, 4096]
        );
        assert!(parse_csv_positive_ints("").is_empty());
    }

    #[test]
    fn settings_round_trip_through_json() {
        let settings = BalancerSettings::default();
        let raw = serde_json::to_string(&settings).unwrap();
        let parsed: BalancerSettings = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.sample_count, settings.sample_count);
        assert_eq!(parsed.algorithm, Algorithm::Traditional);
        assert_eq!(parsed.bucket_ranges, settings.bucket_ranges);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let parsed: BalancerSettings =
            serde_json::from_str(r#"{"algorithm":"object_pool","queue_capacity":4}"#).unwrap();
        assert_eq!(parsed.algorithm, Algorithm::ObjectPool);
        assert_eq!(parsed.queue_capacity, 4);
        assert_eq!(parsed.sample_count, 2);
    }
}
