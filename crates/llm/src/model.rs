use serde::{Deserialize, Serialize};

/// Feature switches forwarded with every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    /// Ask the model to stream its reasoning as thought deltas.
    #[serde(default)]
    pub thinking: bool,
    /// Ask the model for a spoken rendition of the answer.
    #[serde(default)]
    pub audio: bool,
}

impl Capabilities {
    pub const fn new(thinking: bool, audio: bool) -> Self {
        Self { thinking, audio }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub capabilities: Capabilities,
}

impl Model {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            capabilities: Capabilities::default(),
        }
    }

    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

pub fn default_openai_models() -> Vec<Model> {
    vec![
        Model::from_id("gpt-4o-mini").with_description("Balanced cost/performance default"),
        Model::from_id("gpt-4o").with_description("High quality general model"),
        Model::from_id("o3")
            .with_description("Advanced reasoning model")
            .with_capabilities(Capabilities::new(true, false)),
        Model::from_id("o4-mini")
            .with_description("Fast reasoning model")
            .with_capabilities(Capabilities::new(true, false)),
    ]
}

/// Capabilities advertised for a model id, falling back to none for unknown ids.
pub fn capabilities_for(model_id: &str) -> Capabilities {
    default_openai_models()
        .into_iter()
        .find(|model| model.id == model_id)
        .map(|model| model.capabilities)
        .unwrap_or_default()
}
