//! Capability selector: picks the remote model variant for a task.
//!
//! Pure mapping, no I/O. Rules in priority order:
//! 1. image present and grading task => vision model
//! 2. feedback task => light text model, large text model at high complexity
//! 3. analysis task => large text model
//! 4. anything else => configured default

use serde::{Deserialize, Serialize};
use std::fmt;

/// Task category for selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Grading,
    Feedback,
    Analysis,
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Grading => write!(f, "grading"),
            Self::Feedback => write!(f, "feedback"),
            Self::Analysis => write!(f, "analysis"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

impl Complexity {
    /// Complexity of a synthesis task over `n` questions
    pub fn for_question_count(n: usize) -> Self {
        match n {
            0..=2 => Complexity::Low,
            3..=5 => Complexity::Medium,
            _ => Complexity::High,
        }
    }
}

/// Model identifiers the selector chooses between
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSelectorConfig {
    pub vision_model: String,
    pub light_text_model: String,
    pub large_text_model: String,
    pub default_model: String,
}

impl Default for ModelSelectorConfig {
    fn default() -> Self {
        Self {
            vision_model: "nvidia/llama-3.2-90b-vision-instruct".to_string(),
            light_text_model: "nvidia/llama-3.1-8b-instruct".to_string(),
            large_text_model: "nvidia/llama-3.1-70b-instruct".to_string(),
            default_model: "nvidia/llama-3.1-8b-instruct".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CapabilitySelector {
    config: ModelSelectorConfig,
}

impl CapabilitySelector {
    pub fn new(config: ModelSelectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ModelSelectorConfig {
        &self.config
    }

    pub fn select(&self, task: TaskCategory, image_present: bool, complexity: Complexity) -> &str {
        match task {
            TaskCategory::Grading if image_present => &self.config.vision_model,
            TaskCategory::Feedback if complexity == Complexity::High => {
                &self.config.large_text_model
            }
            TaskCategory::Feedback => &self.config.light_text_model,
            TaskCategory::Analysis => &self.config.large_text_model,
            TaskCategory::Grading => &self.config.default_model,
        }
    }
}
