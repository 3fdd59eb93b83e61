//! Gateway configuration.
//!
//! Loaded once from TOML (plus environment indirection for secrets) and
//! handed to the host.  `[providers.<id>]` tables describe completion
//! endpoints, `[[tool_servers]]` entries describe MCP servers, `[limits]`
//! bounds the loop, and `[billing]` sets the ledger rates.
//!
//! API keys may be written as `"${SOME_VAR}"` to be read from the
//! environment at adapter construction time, so config files stay free of
//! secrets.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use gateway_ledger::BillingRates;
use gateway_mcp::{ToolRegistry, ToolServerConfig};
use gateway_provider::{
    AdapterCache, AnthropicAdapter, AnthropicConfig, OpenAiAdapter, OpenAiConfig, ProviderAdapter,
    config_fingerprint,
};

use crate::error::{GatewayError, Result};
use crate::orchestrator::OrchestratorConfig;

// ---------------------------------------------------------------------------
// Settings types
// ---------------------------------------------------------------------------

/// Which adapter implementation a provider entry selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Anthropic Messages API.
    Anthropic,
    /// OpenAI Chat Completions API (or any compatible endpoint).
    Openai,
}

/// One completion endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    /// Adapter implementation to use.
    pub kind: ProviderKind,
    /// API key, or `"${VAR}"` to read it from the environment.
    pub api_key: String,
    /// Endpoint override; the adapter's public default when absent.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Model identifier served by this entry.
    pub model: String,
    /// Per-response token ceiling override.
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// One MCP tool server.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolServerSettings {
    /// Registry identifier (also the collision prefix in the toolset).
    pub id: String,
    /// Executable for a stdio server.
    #[serde(default)]
    pub command: Option<String>,
    /// Arguments for the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Endpoint URL for an HTTP server (mutually exclusive with `command`).
    #[serde(default)]
    pub url: Option<String>,
    /// Per-call timeout override in seconds.
    #[serde(default)]
    pub call_timeout_secs: Option<u64>,
}

/// Loop and concurrency bounds.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Ceiling on tool rounds per turn.
    pub max_tool_rounds: u32,
    /// Bound on concurrently in-flight tool calls per round.
    pub tool_concurrency: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_tool_rounds: 8,
            tool_concurrency: 4,
        }
    }
}

/// Ledger billing rates.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BillingSettings {
    /// Power units per 1000 prompt tokens.
    pub prompt_per_1k: i64,
    /// Power units per 1000 completion tokens.
    pub completion_per_1k: i64,
    /// Flat fee per turn that consumed tokens.
    pub per_turn_fee: i64,
}

impl Default for BillingSettings {
    fn default() -> Self {
        let rates = BillingRates::default();
        Self {
            prompt_per_1k: rates.prompt_per_1k,
            completion_per_1k: rates.completion_per_1k,
            per_turn_fee: rates.per_turn_fee,
        }
    }
}

impl BillingSettings {
    /// Convert to ledger rates.
    pub fn rates(&self) -> BillingRates {
        BillingRates {
            prompt_per_1k: self.prompt_per_1k,
            completion_per_1k: self.completion_per_1k,
            per_turn_fee: self.per_turn_fee,
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// The gateway's static configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    /// Completion endpoints, keyed by a host-chosen id.
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,

    /// MCP tool servers to bridge.
    #[serde(default)]
    pub tool_servers: Vec<ToolServerSettings>,

    /// Loop and concurrency bounds.
    #[serde(default)]
    pub limits: Limits,

    /// Ledger billing rates.
    #[serde(default)]
    pub billing: BillingSettings,
}

impl GatewayConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| GatewayError::Config {
            reason: format!("invalid config: {e}"),
        })
    }

    /// Load a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| GatewayError::Config {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        Self::from_toml_str(&text)
    }

    /// Resolve a model id to its provider entry.
    ///
    /// This is the host's `getProviderConfig` contract: the id matches
    /// either a provider table key or the model the entry serves.
    pub fn provider_for(&self, model_id: &str) -> Result<(&str, &ProviderSettings)> {
        if let Some((id, settings)) = self.providers.get_key_value(model_id) {
            return Ok((id.as_str(), settings));
        }
        self.providers
            .iter()
            .find(|(_, s)| s.model == model_id)
            .map(|(id, s)| (id.as_str(), s))
            .ok_or_else(|| GatewayError::Config {
                reason: format!("no provider configured for model `{model_id}`"),
            })
    }

    /// Construct (or fetch from the cache) the adapter for a model id.
    pub async fn build_adapter(
        &self,
        model_id: &str,
        cache: &AdapterCache,
    ) -> Result<Arc<dyn ProviderAdapter>> {
        let (provider_id, settings) = self.provider_for(model_id)?;
        let api_key = resolve_secret(&settings.api_key)?;

        let kind = match settings.kind {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Openai => "openai",
        };
        let key = config_fingerprint(
            kind,
            settings.base_url.as_deref().unwrap_or(""),
            &settings.model,
            &api_key,
        );

        tracing::debug!(provider = provider_id, model = %settings.model, "resolving adapter");

        let settings = settings.clone();
        let adapter = cache
            .get_or_build(&key, move || match settings.kind {
                ProviderKind::Anthropic => {
                    let mut config = AnthropicConfig::new(api_key, &settings.model);
                    if let Some(base_url) = settings.base_url {
                        config.base_url = base_url;
                    }
                    if let Some(max_tokens) = settings.max_tokens {
                        config.max_tokens = max_tokens;
                    }
                    Ok(Arc::new(AnthropicAdapter::new(config)?) as Arc<dyn ProviderAdapter>)
                }
                ProviderKind::Openai => {
                    let mut config = OpenAiConfig::new(api_key, &settings.model);
                    if let Some(base_url) = settings.base_url {
                        config.base_url = base_url;
                    }
                    if let Some(max_tokens) = settings.max_tokens {
                        config.max_tokens = max_tokens;
                    }
                    Ok(Arc::new(OpenAiAdapter::new(config)?) as Arc<dyn ProviderAdapter>)
                }
            })
            .await?;

        Ok(adapter)
    }

    /// Construct the registries for every configured tool server.
    ///
    /// No connection is made here; the host connects them when ready.
    pub fn build_registries(&self) -> Result<Vec<Arc<ToolRegistry>>> {
        let mut registries = Vec::with_capacity(self.tool_servers.len());

        for server in &self.tool_servers {
            let config = match (&server.command, &server.url) {
                (Some(command), None) => ToolServerConfig::Stdio {
                    command: command.clone(),
                    args: server.args.clone(),
                    env: server.env.clone(),
                },
                (None, Some(url)) => ToolServerConfig::Http { url: url.clone() },
                (Some(_), Some(_)) => {
                    return Err(GatewayError::Config {
                        reason: format!(
                            "tool server `{}` sets both command and url",
                            server.id
                        ),
                    });
                }
                (None, None) => {
                    return Err(GatewayError::Config {
                        reason: format!("tool server `{}` sets neither command nor url", server.id),
                    });
                }
            };

            let mut registry = ToolRegistry::new(&server.id, config);
            if let Some(secs) = server.call_timeout_secs {
                registry = registry.with_call_timeout(Duration::from_secs(secs));
            }
            registries.push(Arc::new(registry));
        }

        Ok(registries)
    }

    /// Derive the orchestrator configuration from the limits table.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_tool_rounds: self.limits.max_tool_rounds,
            ..OrchestratorConfig::default()
        }
    }
}

/// Resolve a `"${VAR}"` secret indirection, or pass the literal through.
fn resolve_secret(raw: &str) -> Result<String> {
    let Some(var) = raw.strip_prefix("${").and_then(|s| s.strip_suffix('}')) else {
        return Ok(raw.to_owned());
    };
    std::env::var(var).map_err(|_| GatewayError::Config {
        reason: format!("environment variable `{var}` is not set"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
