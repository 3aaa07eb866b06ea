//! Wiring of the HTTP collaborators and the controller from [`Config`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::agents::AgentRoster;
use crate::config::Config;
use crate::events::EventCollector;
use crate::links::{DynLinkValidator, HttpLinkValidator};
use crate::llm::{AzureOpenAiClient, AzureOpenAiSettings, DynChatModel};
use crate::logging::CycleLog;
use crate::orchestrator::OrchestrationController;
use crate::scope::ResearchContext;
use crate::search::{BingSearchProvider, BingSettings, DisabledSearch, DynSearchProvider};
use crate::RfxError;

/// Options for building a controller.
#[derive(Clone, Default)]
pub struct ControllerSetup {
    pub expose_monologue: bool,
    pub events: Option<EventCollector>,
}

/// Build the link validator alone; needs no credentials.
pub fn build_link_validator(config: &Config) -> Result<HttpLinkValidator, RfxError> {
    HttpLinkValidator::new(config.links.settings())
}

/// Bing search when a key is configured, otherwise a provider that reports itself unavailable.
pub fn build_search(config: &Config) -> Result<DynSearchProvider, RfxError> {
    match config.search_api_key() {
        Some(api_key) => {
            let provider = BingSearchProvider::new(BingSettings {
                endpoint: config.search.endpoint.clone(),
                api_key,
                count_per_context: config.search.count_per_context,
                timeout: Duration::from_millis(config.search.timeout_ms),
            })?;
            Ok(Arc::new(provider))
        }
        None => {
            warn!(
                env = %config.search.api_key_env,
                "search API key not set; answers will be produced without web search"
            );
            Ok(Arc::new(DisabledSearch))
        }
    }
}

/// The main model and, when configured, a separate Manager model.
pub fn build_models(config: &Config) -> Result<(DynChatModel, Option<DynChatModel>), RfxError> {
    let api_key = config.llm_api_key()?;
    let settings = AzureOpenAiSettings {
        endpoint: config.llm.endpoint.clone(),
        deployment: config.llm.deployment.clone(),
        api_version: config.llm.api_version.clone(),
        api_key,
        timeout: Duration::from_millis(config.llm.timeout_ms),
        temperature: None,
    };

    let manager = match &config.llm.manager_deployment {
        Some(deployment) if deployment != &config.llm.deployment => {
            let client = AzureOpenAiClient::new(AzureOpenAiSettings {
                deployment: deployment.clone(),
                ..settings.clone()
            })?;
            Some(Arc::new(client) as DynChatModel)
        }
        _ => None,
    };
    let model: DynChatModel = Arc::new(AzureOpenAiClient::new(settings)?);
    Ok((model, manager))
}

/// Assemble a controller from explicit collaborators and configuration.
pub fn controller_with(
    config: &Config,
    model: DynChatModel,
    manager_model: Option<DynChatModel>,
    search: DynSearchProvider,
    validator: DynLinkValidator,
    setup: ControllerSetup,
) -> OrchestrationController {
    let agents = AgentRoster::new(
        model,
        manager_model,
        search,
        validator,
        config.orchestrator.agent_options(&config.links),
    );
    let mut controller = OrchestrationController::new(
        agents,
        config.orchestrator.controller_options(setup.expose_monologue),
    );
    if let Some(events) = setup.events {
        controller = controller.with_events(events);
    }
    if let Some(dir) = &config.logging.cycle_log_dir {
        controller = controller.with_cycle_log(CycleLog::new(dir, config.logging.retention_days));
    }
    controller
}

/// Build the production controller: Azure OpenAI, Bing and HTTP link checks.
pub fn build_controller(config: &Config, setup: ControllerSetup) -> Result<OrchestrationController, RfxError> {
    let (model, manager_model) = build_models(config)?;
    let search = build_search(config)?;
    let validator: DynLinkValidator = Arc::new(build_link_validator(config)?);
    info!(
        deployment = %config.llm.deployment,
        manager_deployment = ?config.llm.manager_deployment,
        max_iterations = config.orchestrator.max_iterations,
        "controller ready"
    );
    Ok(controller_with(config, model, manager_model, search, validator, setup))
}

/// Parse context labels, falling back to `[research].default_contexts` when none are given.
pub fn resolve_contexts(config: &Config, labels: &[String]) -> BTreeSet<ResearchContext> {
    for label in labels {
        if label.parse::<ResearchContext>().is_err() {
            warn!(%label, "ignoring unknown research context");
        }
    }
    if labels.is_empty() {
        ResearchContext::parse_all(&config.research.default_contexts)
    } else {
        ResearchContext::parse_all(labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contexts_fall_back_to_configured_defaults() {
        let config = Config::default();
        let contexts = resolve_contexts(&config, &[]);
        assert_eq!(contexts.into_iter().collect::<Vec<_>>(), vec![ResearchContext::AzureAi]);

        let contexts = resolve_contexts(&config, &["fabric".to_string(), "bogus".to_string()]);
        assert_eq!(contexts.into_iter().collect::<Vec<_>>(), vec![ResearchContext::Fabric]);
    }

    #[test]
    fn search_without_key_is_disabled() {
        let mut config = Config::default();
        config.search.api_key_env = "RFX_TEST_NO_SUCH_SEARCH_KEY".to_string();
        unsafe {
            std::env::remove_var("RFX_TEST_NO_SUCH_SEARCH_KEY");
        }
        assert!(build_search(&config).is_ok());
    }

    #[test]
    fn models_require_an_api_key() {
        let mut config = Config::default();
        config.llm.api_key_env = "RFX_TEST_NO_SUCH_MODEL_KEY".to_string();
        unsafe {
            std::env::remove_var("RFX_TEST_NO_SUCH_MODEL_KEY");
        }
        let err = build_models(&config).err().expect("missing key");
        assert!(matches!(err, RfxError::MissingSecret(_)));
    }
}
