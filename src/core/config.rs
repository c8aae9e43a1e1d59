// ---------------------------------------------------------------------------
// EngineConfig — file-based config loader (postgate.json) with env-var fallback
// ---------------------------------------------------------------------------

/// Raw `postgate.json` shape. Every field is optional; resolution order per
/// field is JSON value → `POSTGATE_*` env var → built-in default.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct FileConfig {
    /// Consecutive empty extractions before a strategy escalates. Default: 5.
    pub empty_escalation_cap: Option<u32>,
    /// Re-arm tolerance for the cooldown table, in ms. Default: 2000.
    pub rearm_tolerance_ms: Option<u64>,
    /// Delay between native-load document polls, in ms. Default: 2000.
    pub native_poll_delay_ms: Option<u64>,
    /// Poll ceiling for recognized long-running challenge pages. Default: 12.
    pub native_poll_known_max: Option<u32>,
    /// Poll ceiling for unrecognized pages. Default: 4.
    pub native_poll_unknown_max: Option<u32>,
    /// Full native reloads before the chain gives up. Default: 2.
    pub native_reload_max: Option<u32>,
    /// Minimum gap between cooldown-expired notifications per key, in ms.
    /// Default: 500.
    pub notify_min_interval_ms: Option<u64>,
    /// Minimum time between outbound challenge requests, in ms. Default: 1500.
    pub min_request_interval_ms: Option<u64>,
    /// Random jitter added on top of the request interval, in ms. Default: 400.
    pub request_jitter_ms: Option<u64>,
    /// HTTP timeout for background fetches, in seconds. Default: 30.
    pub http_timeout_secs: Option<u64>,
    /// Transport-level retry budget for one background fetch, in seconds.
    /// Default: 8.
    pub transport_retry_max_elapsed_secs: Option<u64>,
}

/// Fully-resolved engine tuning knobs.
///
/// Created once at engine construction and shared read-only by every
/// session — never loaded lazily at first use.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub empty_escalation_cap: u32,
    pub rearm_tolerance_ms: u64,
    pub native_poll_delay_ms: u64,
    pub native_poll_known_max: u32,
    pub native_poll_unknown_max: u32,
    pub native_reload_max: u32,
    pub notify_min_interval_ms: u64,
    pub min_request_interval_ms: u64,
    pub request_jitter_ms: u64,
    pub http_timeout_secs: u64,
    pub transport_retry_max_elapsed_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        FileConfig::default().resolve()
    }
}

impl EngineConfig {
    /// Load `postgate.json` from standard locations and resolve every field.
    ///
    /// Search order (first found wins):
    /// 1. `POSTGATE_CONFIG` env var path
    /// 2. `./postgate.json` (process cwd)
    /// 3. `../postgate.json` (one level up)
    ///
    /// Missing file → defaults (env-var fallbacks still apply). Parse error →
    /// log a warning, use defaults.
    pub fn load() -> Self {
        let candidates: Vec<std::path::PathBuf> = {
            let mut v = vec![
                std::path::PathBuf::from("postgate.json"),
                std::path::PathBuf::from("../postgate.json"),
            ];
            if let Ok(env_path) = std::env::var("POSTGATE_CONFIG") {
                v.insert(0, std::path::PathBuf::from(env_path));
            }
            v
        };

        for path in &candidates {
            match std::fs::read_to_string(path) {
                Ok(contents) => match serde_json::from_str::<FileConfig>(&contents) {
                    Ok(cfg) => {
                        tracing::info!("postgate.json loaded from {}", path.display());
                        return cfg.resolve();
                    }
                    Err(e) => {
                        tracing::warn!(
                            "postgate.json parse error at {}: {} — using defaults",
                            path.display(),
                            e
                        );
                        return FileConfig::default().resolve();
                    }
                },
                Err(_) => continue, // not found at this path — try next
            }
        }

        FileConfig::default().resolve()
    }
}

impl FileConfig {
    pub fn resolve(&self) -> EngineConfig {
        EngineConfig {
            empty_escalation_cap: resolve_u32(
                self.empty_escalation_cap,
                "POSTGATE_EMPTY_ESCALATION_CAP",
                5,
            ),
            rearm_tolerance_ms: resolve_u64(
                self.rearm_tolerance_ms,
                "POSTGATE_REARM_TOLERANCE_MS",
                2_000,
            ),
            native_poll_delay_ms: resolve_u64(
                self.native_poll_delay_ms,
                "POSTGATE_NATIVE_POLL_DELAY_MS",
                2_000,
            ),
            native_poll_known_max: resolve_u32(
                self.native_poll_known_max,
                "POSTGATE_NATIVE_POLL_KNOWN_MAX",
                12,
            ),
            native_poll_unknown_max: resolve_u32(
                self.native_poll_unknown_max,
                "POSTGATE_NATIVE_POLL_UNKNOWN_MAX",
                4,
            ),
            native_reload_max: resolve_u32(self.native_reload_max, "POSTGATE_NATIVE_RELOAD_MAX", 2),
            notify_min_interval_ms: resolve_u64(
                self.notify_min_interval_ms,
                "POSTGATE_NOTIFY_MIN_INTERVAL_MS",
                500,
            ),
            min_request_interval_ms: resolve_u64(
                self.min_request_interval_ms,
                "POSTGATE_MIN_REQUEST_INTERVAL_MS",
                1_500,
            ),
            request_jitter_ms: resolve_u64(self.request_jitter_ms, "POSTGATE_REQUEST_JITTER_MS", 400),
            http_timeout_secs: resolve_u64(self.http_timeout_secs, "POSTGATE_HTTP_TIMEOUT_SECS", 30),
            transport_retry_max_elapsed_secs: resolve_u64(
                self.transport_retry_max_elapsed_secs,
                "POSTGATE_TRANSPORT_RETRY_MAX_ELAPSED_SECS",
                8,
            ),
        }
    }
}

fn resolve_u64(file_value: Option<u64>, env_key: &str, default: u64) -> u64 {
    if let Some(v) = file_value {
        return v;
    }
    std::env::var(env_key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn resolve_u32(file_value: Option<u32>, env_key: &str, default: u32) -> u32 {
    if let Some(v) = file_value {
        return v;
    }
    std::env::var(env_key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_without_file() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.empty_escalation_cap, 5);
        assert_eq!(cfg.rearm_tolerance_ms, 2_000);
        assert_eq!(cfg.native_poll_unknown_max, 4);
    }

    #[test]
    fn file_value_wins_over_default() {
        let file = FileConfig {
            empty_escalation_cap: Some(3),
            ..Default::default()
        };
        assert_eq!(file.resolve().empty_escalation_cap, 3);
    }
}
