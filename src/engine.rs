//! The closed set of supported terminal agents.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::ApiError;

#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Codex,
    Gemini,
    Opencode,
}

impl Engine {
    pub const ALL: [Engine; 3] = [Engine::Codex, Engine::Gemini, Engine::Opencode];

    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Codex => "codex",
            Engine::Gemini => "gemini",
            Engine::Opencode => "opencode",
        }
    }

    /// Strict boundary parse: only the three lowercase names are accepted.
    pub fn parse(s: &str) -> Result<Engine, ApiError> {
        match s {
            "codex" => Ok(Engine::Codex),
            "gemini" => Ok(Engine::Gemini),
            "opencode" => Ok(Engine::Opencode),
            other => Err(ApiError::InvalidEngine(format!(
                "unknown engine {other:?}; expected codex, gemini or opencode"
            ))),
        }
    }

    /// In-container process name, used for targeted signal delivery.
    pub fn process_name(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
