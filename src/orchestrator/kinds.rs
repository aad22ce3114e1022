//! Request kinds: which facets a submission fans out to.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::kernel::types::ProcessRole;
use crate::types::ModelId;

/// One routed sub-request of a request kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FacetSpec {
    /// Key of the facet in the aggregated result.
    pub name: String,

    /// Role of the process the facet is routed to.
    #[serde(default = "default_facet_role")]
    pub role: ProcessRole,

    /// Message type of the facet request.
    pub message_type: String,

    /// Model held resident for the duration of the facet.
    #[serde(default)]
    pub model: Option<ModelId>,

    /// A failed mandatory facet fails the whole submission.
    #[serde(default)]
    pub mandatory: bool,

    /// Overrides the router's default request timeout.
    #[serde(default, with = "humantime_serde")]
    #[schemars(with = "Option<String>")]
    pub timeout: Option<Duration>,
}

fn default_facet_role() -> ProcessRole {
    ProcessRole::ModelExec
}

impl FacetSpec {
    pub fn new(name: &str, message_type: &str) -> Self {
        Self {
            name: name.to_string(),
            role: default_facet_role(),
            message_type: message_type.to_string(),
            model: None,
            mandatory: false,
            timeout: None,
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(ModelId::must(model));
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn on_role(mut self, role: ProcessRole) -> Self {
        self.role = role;
        self
    }
}

/// A named kind of orchestrated request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RequestKindSpec {
    pub name: String,
    pub facets: Vec<FacetSpec>,
    /// Result TTL; the orchestrator default when absent.
    #[serde(default, with = "humantime_serde")]
    #[schemars(with = "Option<String>")]
    pub ttl: Option<Duration>,
}

impl RequestKindSpec {
    pub fn new(name: &str, facets: Vec<FacetSpec>) -> Self {
        Self {
            name: name.to_string(),
            facets,
            ttl: None,
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct OrchestratorConfig {
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub default_ttl: Duration,

    /// Input text longer than this travels as a shared-buffer attachment
    /// instead of inline in every facet request.
    pub inline_text_limit: usize,

    pub kinds: Vec<RequestKindSpec>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            inline_text_limit: 64 * 1024,
            kinds: default_kinds(),
        }
    }
}

/// `classify` and `analyze`.
pub fn default_kinds() -> Vec<RequestKindSpec> {
    let classification = FacetSpec::new("classification", "model.classify")
        .with_model("classifier")
        .mandatory();
    vec![
        RequestKindSpec::new("classify", vec![classification.clone()]),
        RequestKindSpec::new(
            "analyze",
            vec![
                classification,
                FacetSpec::new("entities", "model.extract_entities").with_model("ner"),
                FacetSpec::new("sentiment", "model.sentiment").with_model("sentiment"),
            ],
        ),
    ]
}
