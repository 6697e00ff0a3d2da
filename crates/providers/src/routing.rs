//! Model-name → provider routing.
//!
//! Model names carry an optional provider prefix ("openai/gpt-4o",
//! "anthropic/claude-sonnet-4", "gemini/gemini-2.0-flash"). Prefixed names
//! aimed at aggregators (OpenRouter) are kept as-is; names routed to a
//! direct endpoint have the prefix stripped before being sent.

use mclaw_config::Config;
use mclaw_core::error::ProviderError;
use mclaw_core::provider::LlmProvider;
use std::sync::Arc;

const OPENROUTER_BASE: &str = "https://openrouter.ai/api/v1";
const OPENAI_BASE: &str = "https://api.openai.com/v1";
const ANTHROPIC_BASE: &str = "https://api.anthropic.com/v1";
const GEMINI_OPENAI_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/openai";
const ZHIPU_BASE: &str = "https://open.bigmodel.cn/api/paas/v4";
const GROQ_BASE: &str = "https://api.groq.com/openai/v1";

const KNOWN_PREFIXES: &[&str] = &[
    "openai/",
    "anthropic/",
    "openrouter/",
    "meta-llama/",
    "deepseek/",
    "google/",
    "gemini/",
    "groq/",
];

fn strip_prefix(model: &str) -> &str {
    for p in KNOWN_PREFIXES {
        if let Some(rest) = model.strip_prefix(p) {
            return rest;
        }
    }
    model
}

fn openrouter_base(cfg: &Config) -> String {
    if cfg.providers.openrouter.api_base.is_empty() {
        OPENROUTER_BASE.into()
    } else {
        cfg.providers.openrouter.api_base.clone()
    }
}

/// Create a provider for the configured default model.
pub fn create_provider(cfg: &Config) -> Result<Arc<dyn LlmProvider>, ProviderError> {
    create_provider_for_model(cfg, &cfg.agents.defaults.model)
}

/// Create a provider routed by model name.
pub fn create_provider_for_model(
    cfg: &Config,
    model: &str,
) -> Result<Arc<dyn LlmProvider>, ProviderError> {
    let lower = model.to_lowercase();

    let (api_key, api_base, model_override): (String, String, Option<String>) =
        if model.starts_with("openai/") {
            // openai/ prefix: prefer the direct OpenAI provider (supports local
            // gateways/proxies), fall back to OpenRouter which expects the
            // prefixed name.
            if !cfg.providers.openai.api_key.is_empty() {
                let base = if cfg.providers.openai.api_base.is_empty() {
                    OPENAI_BASE.into()
                } else {
                    cfg.providers.openai.api_base.clone()
                };
                (
                    cfg.providers.openai.api_key.clone(),
                    base,
                    Some(strip_prefix(model).to_string()),
                )
            } else {
                (
                    cfg.providers.openrouter.api_key.clone(),
                    openrouter_base(cfg),
                    None,
                )
            }
        } else if model.starts_with("openrouter/")
            || model.starts_with("anthropic/")
            || model.starts_with("meta-llama/")
            || model.starts_with("deepseek/")
            || model.starts_with("google/")
        {
            // OpenRouter expects prefixed model names, keep as-is.
            (
                cfg.providers.openrouter.api_key.clone(),
                openrouter_base(cfg),
                None,
            )
        } else if lower.contains("claude") {
            // Direct Anthropic proxies must be OpenAI-compatible; otherwise
            // route through OpenRouter when a key is present.
            if !cfg.providers.anthropic.api_base.is_empty() {
                (
                    cfg.providers.anthropic.api_key.clone(),
                    cfg.providers.anthropic.api_base.clone(),
                    None,
                )
            } else if !cfg.providers.openrouter.api_key.is_empty() {
                (
                    cfg.providers.openrouter.api_key.clone(),
                    openrouter_base(cfg),
                    None,
                )
            } else {
                (
                    cfg.providers.anthropic.api_key.clone(),
                    ANTHROPIC_BASE.into(),
                    None,
                )
            }
        } else if lower.contains("gpt") {
            let base = if cfg.providers.openai.api_base.is_empty() {
                OPENAI_BASE.into()
            } else {
                cfg.providers.openai.api_base.clone()
            };
            (cfg.providers.openai.api_key.clone(), base, None)
        } else if lower.contains("gemini") {
            let base = if cfg.providers.gemini.api_base.is_empty() {
                GEMINI_OPENAI_BASE.into()
            } else {
                cfg.providers.gemini.api_base.clone()
            };
            (
                cfg.providers.gemini.api_key.clone(),
                base,
                Some(strip_prefix(model).to_string()),
            )
        } else if lower.contains("glm") || lower.contains("zhipu") || lower.contains("zai") {
            let base = if cfg.providers.zhipu.api_base.is_empty() {
                ZHIPU_BASE.into()
            } else {
                cfg.providers.zhipu.api_base.clone()
            };
            (
                cfg.providers.zhipu.api_key.clone(),
                base,
                Some(strip_prefix(model).to_string()),
            )
        } else if lower.contains("groq") {
            let base = if cfg.providers.groq.api_base.is_empty() {
                GROQ_BASE.into()
            } else {
                cfg.providers.groq.api_base.clone()
            };
            (
                cfg.providers.groq.api_key.clone(),
                base,
                Some(strip_prefix(model).to_string()),
            )
        } else if !cfg.providers.vllm.api_base.is_empty() {
            (
                cfg.providers.vllm.api_key.clone(),
                cfg.providers.vllm.api_base.clone(),
                None,
            )
        } else if !cfg.providers.openrouter.api_key.is_empty() {
            (
                cfg.providers.openrouter.api_key.clone(),
                openrouter_base(cfg),
                None,
            )
        } else {
            return Err(ProviderError::NotConfigured(format!(
                "no API key configured for model: {model}"
            )));
        };

    if api_key.is_empty() {
        return Err(ProviderError::NotConfigured(format!(
            "no API key configured for provider (model: {model})"
        )));
    }
    if api_base.is_empty() {
        return Err(ProviderError::NotConfigured(format!(
            "no API base configured for provider (model: {model})"
        )));
    }

    Ok(Arc::new(crate::HttpProvider::new(
        api_key,
        api_base,
        model_override,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_gemini() -> Config {
        let mut cfg = Config::default();
        cfg.providers.gemini.api_key = "test-key".into();
        cfg
    }

    #[test]
    fn routes_gemini_with_stripped_prefix() {
        let cfg = config_with_gemini();
        let provider = create_provider_for_model(&cfg, "gemini/gemini-2.0-flash").unwrap();
        assert_eq!(provider.default_model(), Some("gemini-2.0-flash"));
    }

    #[test]
    fn routes_prefixed_models_to_openrouter_unstripped() {
        let mut cfg = Config::default();
        cfg.providers.openrouter.api_key = "or-key".into();
        let provider = create_provider_for_model(&cfg, "anthropic/claude-sonnet-4").unwrap();
        // OpenRouter keeps the prefixed name — no override installed.
        assert_eq!(provider.default_model(), None);
    }

    #[test]
    fn routes_glm_to_zhipu() {
        let mut cfg = Config::default();
        cfg.providers.zhipu.api_key = "z-key".into();
        assert!(create_provider_for_model(&cfg, "glm-4.7").is_ok());
    }

    #[test]
    fn unknown_model_without_any_key_errors() {
        let cfg = Config::default();
        let err = create_provider_for_model(&cfg, "mystery-model-9000").unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
    }

    #[test]
    fn unknown_model_falls_back_to_openrouter() {
        let mut cfg = Config::default();
        cfg.providers.openrouter.api_key = "or-key".into();
        assert!(create_provider_for_model(&cfg, "mystery-model-9000").is_ok());
    }

    #[test]
    fn missing_key_for_matched_provider_errors() {
        // Matches the gemini branch, but no key is configured.
        let cfg = Config::default();
        let err = create_provider_for_model(&cfg, "gemini-2.0-flash").unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
    }

    #[test]
    fn strip_prefix_variants() {
        assert_eq!(strip_prefix("openai/gpt-4o"), "gpt-4o");
        assert_eq!(strip_prefix("gemini/gemini-2.0-flash"), "gemini-2.0-flash");
        assert_eq!(strip_prefix("plain-model"), "plain-model");
    }
}
