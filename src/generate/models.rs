use serde::Deserialize;

/// Models the generator can be pointed at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Model {
    /// Speed tier - cheap model for flat recommendation lists
    #[default]
    Speed,
    /// Balanced tier - better recall for influence trees
    Balanced,
}

impl Model {
    pub fn id(&self) -> &'static str {
        match self {
            Model::Speed => "openai/gpt-oss-120b:nitro",
            Model::Balanced => "anthropic/claude-sonnet-4.5:nitro",
        }
    }

    /// Responses are short JSON documents; anything longer is a runaway.
    pub fn max_tokens(&self) -> u32 {
        match self {
            Model::Speed => 4096,
            Model::Balanced => 8192,
        }
    }

    /// Parse a config value; accepts tier names or a full model id.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "speed" | "fast" => Some(Model::Speed),
            "balanced" => Some(Model::Balanced),
            other if other == Model::Speed.id() => Some(Model::Speed),
            other if other == Model::Balanced.id() => Some(Model::Balanced),
            _ => None,
        }
    }
}

/// API usage information from OpenRouter
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
    /// Cost in USD as reported by OpenRouter (`total_cost` in the usage object).
    #[serde(default, alias = "total_cost")]
    pub cost: Option<f64>,
}

impl Usage {
    /// Reported cost, or 0.0 when the provider did not say.
    pub fn cost(&self) -> f64 {
        self.cost.unwrap_or(0.0)
    }
}
