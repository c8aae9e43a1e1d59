use crate::core::config::EngineConfig;

/// Shared state behind one [`crate::engine::VerificationEngine`].
///
/// Cooldown and ticket state is process-wide by requirement — multiple open
/// reply forms for the same thread must observe the same records — but it is
/// owned here and injected into sessions, never reached through statics.
pub struct EngineState {
    pub http: reqwest::Client,
    pub cooldowns: crate::verification::cooldown::CooldownStore,
    pub tickets: crate::verification::tickets::TicketStore,
    pub net: crate::net::NetRegistry,
    pub config: EngineConfig,
}

impl std::fmt::Debug for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineState")
            .field("active_cooldowns", &self.cooldowns.len())
            .finish()
    }
}

impl EngineState {
    pub fn new(config: EngineConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.http_timeout_secs))
            .cookie_store(true)
            .build()?;

        Ok(Self {
            http,
            cooldowns: crate::verification::cooldown::CooldownStore::new(
                config.rearm_tolerance_ms,
                config.notify_min_interval_ms,
            ),
            tickets: crate::verification::tickets::TicketStore::new(),
            net: crate::net::NetRegistry::new(
                config.min_request_interval_ms,
                config.request_jitter_ms,
            ),
            config,
        })
    }
}
