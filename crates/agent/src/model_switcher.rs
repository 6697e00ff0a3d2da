//! Automatic model fallback on rate-limit errors.
//!
//! When the current model is rate-limited, the switcher moves to the next
//! model in the configured fallback chain and retries the request once. At
//! the start of a new day (local time) it resets back to the primary model.

use mclaw_config::Config;
use mclaw_core::error::ProviderError;
use mclaw_core::message::Message;
use mclaw_core::provider::{ChatOptions, LlmProvider, LlmResponse, ToolDefinition};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Builds a provider for a model name. The default is the routing table in
/// `mclaw-providers`; tests inject stub factories.
pub type ProviderFactory =
    Arc<dyn Fn(&Config, &str) -> Result<Arc<dyn LlmProvider>, ProviderError> + Send + Sync>;

struct SwitcherState {
    current_model: String,
    current_provider: Arc<dyn LlmProvider>,
    /// Day of year when the last rate-limit switch happened (-1 = none).
    rate_limit_day: i32,
}

pub struct ModelSwitcher {
    cfg: Config,
    primary_model: String,
    fallback_models: Vec<String>,
    factory: ProviderFactory,
    state: RwLock<SwitcherState>,
}

impl ModelSwitcher {
    pub fn new(cfg: &Config, initial_provider: Arc<dyn LlmProvider>) -> Self {
        Self::with_factory(
            cfg,
            initial_provider,
            Arc::new(|cfg, model| mclaw_providers::create_provider_for_model(cfg, model)),
        )
    }

    pub fn with_factory(
        cfg: &Config,
        initial_provider: Arc<dyn LlmProvider>,
        factory: ProviderFactory,
    ) -> Self {
        Self {
            cfg: cfg.clone(),
            primary_model: cfg.agents.defaults.model.clone(),
            fallback_models: cfg.agents.defaults.fallback_models.clone(),
            factory,
            state: RwLock::new(SwitcherState {
                current_model: cfg.agents.defaults.model.clone(),
                current_provider: initial_provider,
                rate_limit_day: -1,
            }),
        }
    }

    pub fn current_model(&self) -> String {
        self.state
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .current_model
            .clone()
    }

    pub fn current_provider(&self) -> Arc<dyn LlmProvider> {
        Arc::clone(
            &self
                .state
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .current_provider,
        )
    }

    /// Send a chat request with automatic fallback on rate-limit errors.
    /// A single retry per call: further rate limits on the next model
    /// surface as the error.
    pub async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        options: ChatOptions,
    ) -> Result<LlmResponse, ProviderError> {
        self.maybe_reset_daily();

        let (model, provider) = {
            let state = self.state.read().unwrap_or_else(|p| p.into_inner());
            (state.current_model.clone(), Arc::clone(&state.current_provider))
        };

        let err = match provider.chat(messages, tools, &model, options).await {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };

        if !err.is_rate_limit() {
            return Err(err);
        }

        warn!(model = %model, "Rate limit hit, attempting fallback");
        if !self.switch_to_next() {
            warn!("No fallback models available, returning rate limit error");
            return Err(err);
        }

        let (next_model, next_provider) = {
            let state = self.state.read().unwrap_or_else(|p| p.into_inner());
            (state.current_model.clone(), Arc::clone(&state.current_provider))
        };
        info!(model = %next_model, "Retrying with fallback model");
        next_provider.chat(messages, tools, &next_model, options).await
    }

    /// Switch to the next fallback model. Returns whether a switch happened.
    fn switch_to_next(&self) -> bool {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());

        if self.fallback_models.is_empty() {
            return false;
        }

        let next_model = if state.current_model == self.primary_model {
            self.fallback_models.first().cloned()
        } else {
            self.fallback_models
                .iter()
                .position(|m| *m == state.current_model)
                .and_then(|i| self.fallback_models.get(i + 1))
                .cloned()
        };

        let Some(next_model) = next_model else {
            return false;
        };

        let provider = match (self.factory)(&self.cfg, &next_model) {
            Ok(p) => p,
            Err(e) => {
                warn!(model = %next_model, error = %e, "Failed to create fallback provider");
                return false;
            }
        };

        info!(model = %next_model, "Switched from rate-limited model");
        state.current_model = next_model;
        state.current_provider = provider;
        state.rate_limit_day = day_of_year();
        true
    }

    /// Reset to the primary model once the day-of-year has advanced past the
    /// last rate-limit switch.
    fn maybe_reset_daily(&self) {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());

        if state.rate_limit_day < 0 {
            return;
        }
        if day_of_year() == state.rate_limit_day {
            return;
        }

        if state.current_model == self.primary_model {
            state.rate_limit_day = -1;
            return;
        }

        let provider = match (self.factory)(&self.cfg, &self.primary_model) {
            Ok(p) => p,
            Err(e) => {
                warn!(model = %self.primary_model, error = %e, "Failed to reset to primary model");
                return;
            }
        };

        info!(
            from = %state.current_model,
            to = %self.primary_model,
            "New day — resetting to primary model"
        );
        state.current_model = self.primary_model.clone();
        state.current_provider = provider;
        state.rate_limit_day = -1;
    }
}

fn day_of_year() -> i32 {
    use chrono::Datelike;
    chrono::Local::now().ordinal() as i32
}
