//! Grading data model: per-question results, aggregate statistics and the
//! mode ladder a grading run can end on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Tier a grading run completed in.
///
/// Declaration order is the degradation order: a later variant is always
/// less capable, so `Ord` doubles as "more degraded than".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradingMode {
    AiPowered,
    Basic,
    TransportDegraded,
    PersistenceDegraded,
}

impl GradingMode {
    /// Move to `to` unless already further down the ladder
    pub fn step_down(self, to: GradingMode) -> GradingMode {
        self.max(to)
    }

    pub fn is_degraded(self) -> bool {
        self != GradingMode::AiPowered
    }
}

impl fmt::Display for GradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AiPowered => write!(f, "ai_powered"),
            Self::Basic => write!(f, "basic"),
            Self::TransportDegraded => write!(f, "transport_degraded"),
            Self::PersistenceDegraded => write!(f, "persistence_degraded"),
        }
    }
}

/// One graded question. Never mutated after construction; see
/// [`QuestionResult::corrected`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionResult {
    pub ordinal: u32,
    pub question_text: String,
    pub student_answer: String,
    pub correct_answer: String,
    pub score: f64,
    pub max_score: f64,
    pub is_correct: bool,
    /// Short feedback
    pub initial_feedback: String,
    /// Long feedback
    pub enhanced_feedback: String,
    pub topic: String,
    pub difficulty: String,
    pub question_type: String,
    /// False for placeholders synthesized without the remote model
    pub authoritative: bool,
}

impl QuestionResult {
    pub const DEFAULT_MAX_SCORE: f64 = 10.0;

    /// Normalize a remote score pair: max defaults to 10 when missing or
    /// non-positive, score is clamped into `[0, max]`.
    pub fn clamp_score(score: Option<f64>, max_score: Option<f64>) -> (f64, f64) {
        let max = match max_score {
            Some(m) if m.is_finite() && m > 0.0 => m,
            _ => Self::DEFAULT_MAX_SCORE,
        };
        let score = match score {
            Some(s) if s.is_finite() => s.clamp(0.0, max),
            _ => 0.0,
        };
        (score, max)
    }

    /// Build from loosely shaped model output. Missing text fields become
    /// empty (or a neutral tag), `feedback`/`errors` are accepted as the
    /// short/long feedback, scores are clamped.
    pub fn from_value(ordinal: u32, value: &Value) -> Self {
        let text = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
        let number = |key: &str| value.get(key).and_then(Value::as_f64);

        let short = text("initial_feedback")
            .or_else(|| text("feedback"))
            .unwrap_or_default();
        let long = text("enhanced_feedback").unwrap_or_else(|| {
            let errors: Vec<&str> = value
                .get("errors")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            if errors.is_empty() {
                short.clone()
            } else {
                format!("{}\n{}", short, errors.join("\n"))
            }
        });
        let (score, max_score) = Self::clamp_score(number("score"), number("max_score"));

        Self {
            ordinal,
            question_text: text("question_text").unwrap_or_default(),
            student_answer: text("student_answer").unwrap_or_default(),
            correct_answer: text("correct_answer").unwrap_or_default(),
            score,
            max_score,
            is_correct: value
                .get("is_correct")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            initial_feedback: short,
            enhanced_feedback: long,
            topic: text("topic").unwrap_or_else(|| "general".to_string()),
            difficulty: text("difficulty").unwrap_or_else(|| "medium".to_string()),
            question_type: text("question_type").unwrap_or_else(|| "calculation".to_string()),
            authoritative: true,
        }
    }

    /// A new record carrying a corrected grade
    pub fn corrected(&self, score: f64, is_correct: bool, feedback: impl Into<String>) -> Self {
        let (score, max_score) = Self::clamp_score(Some(score), Some(self.max_score));
        Self {
            score,
            max_score,
            is_correct,
            initial_feedback: feedback.into(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicStats {
    pub correct: usize,
    pub total: usize,
}

/// Aggregate statistics, computed the same way for every mode
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GradingStatistics {
    pub total_questions: usize,
    pub correct_count: usize,
    pub accuracy_rate: f64,
    pub total_score: f64,
    pub max_total_score: f64,
    pub score_percentage: f64,
    pub topic_breakdown: BTreeMap<String, TopicStats>,
}

impl GradingStatistics {
    pub fn compute(results: &[QuestionResult]) -> Self {
        let total_questions = results.len();
        let correct_count = results.iter().filter(|r| r.is_correct).count();
        let total_score: f64 = results.iter().map(|r| r.score).sum();
        let max_total_score: f64 = results.iter().map(|r| r.max_score).sum();

        let accuracy_rate = if total_questions > 0 {
            correct_count as f64 / total_questions as f64 * 100.0
        } else {
            0.0
        };
        let score_percentage = if max_total_score > 0.0 {
            total_score / max_total_score * 100.0
        } else {
            0.0
        };

        let mut topic_breakdown: BTreeMap<String, TopicStats> = BTreeMap::new();
        for r in results {
            let entry = topic_breakdown.entry(r.topic.clone()).or_default();
            entry.total += 1;
            if r.is_correct {
                entry.correct += 1;
            }
        }

        Self {
            total_questions,
            correct_count,
            accuracy_rate,
            total_score,
            max_total_score,
            score_percentage,
            topic_breakdown,
        }
    }
}

/// Aggregate assessment produced by feedback synthesis
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackSummary {
    pub overall_assessment: String,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemedialProblem {
    pub question: String,
    pub answer: String,
    pub hint: String,
}

/// Practice problems for one weak topic
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemedialSet {
    pub topic: String,
    #[serde(default)]
    pub problems: Vec<RemedialProblem>,
}

/// One step down the mode ladder and why it happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Degradation {
    pub mode: GradingMode,
    pub reason: String,
}

/// Outcome of one grading invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingResult {
    pub run_id: Uuid,
    pub homework_id: String,
    pub student_name: String,
    pub grade_level: String,
    pub mode: GradingMode,
    pub results: Vec<QuestionResult>,
    pub statistics: GradingStatistics,
    #[serde(default)]
    pub assessment: Option<FeedbackSummary>,
    #[serde(default)]
    pub remedial_problems: Vec<RemedialSet>,
    #[serde(default)]
    pub degradations: Vec<Degradation>,
    /// Some stage output was recovered from unstructured text
    #[serde(default)]
    pub heuristic_recovery: bool,
    /// Seconds
    pub processing_time: f64,
    pub created_at: DateTime<Utc>,
}

impl GradingResult {
    pub fn new(
        homework_id: &str,
        student_name: &str,
        grade_level: &str,
        mode: GradingMode,
        results: Vec<QuestionResult>,
        elapsed: Duration,
    ) -> Self {
        let statistics = GradingStatistics::compute(&results);
        Self {
            run_id: Uuid::new_v4(),
            homework_id: homework_id.to_string(),
            student_name: student_name.to_string(),
            grade_level: grade_level.to_string(),
            mode,
            results,
            statistics,
            assessment: None,
            remedial_problems: Vec::new(),
            degradations: Vec::new(),
            heuristic_recovery: false,
            processing_time: elapsed.as_secs_f64(),
            created_at: Utc::now(),
        }
    }

    /// Record a step down. The mode never moves back up.
    pub fn degrade(&mut self, mode: GradingMode, reason: impl Into<String>) {
        self.mode = self.mode.step_down(mode);
        self.degradations.push(Degradation {
            mode,
            reason: reason.into(),
        });
    }
}

/// Distinct topics of incorrect questions, first-seen order, at most `limit`
pub fn weak_topics(results: &[QuestionResult], limit: usize) -> Vec<String> {
    let mut topics: Vec<String> = Vec::new();
    for r in results.iter().filter(|r| !r.is_correct) {
        if topics.len() == limit {
            break;
        }
        if !topics.contains(&r.topic) {
            topics.push(r.topic.clone());
        }
    }
    topics
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_ordering() {
        assert!(GradingMode::AiPowered < GradingMode::Basic);
        assert!(GradingMode::Basic < GradingMode::TransportDegraded);
        assert!(GradingMode::TransportDegraded < GradingMode::PersistenceDegraded);
        assert_eq!(
            GradingMode::TransportDegraded.step_down(GradingMode::Basic),
            GradingMode::TransportDegraded
        );
        assert!(!GradingMode::AiPowered.is_degraded());
        assert!(GradingMode::Basic.is_degraded());
        assert!(GradingMode::PersistenceDegraded.is_degraded());
    }

    #[test]
    fn test_mode_serialization() {
        let json = serde_json::to_string(&GradingMode::TransportDegraded).unwrap();
        assert_eq!(json, "\"transport_degraded\"");
        assert_eq!(GradingMode::PersistenceDegraded.to_string(), "persistence_degraded");
    }

    #[test]
    fn test_clamp_score() {
        assert_eq!(QuestionResult::clamp_score(Some(12.0), Some(10.0)), (10.0, 10.0));
        assert_eq!(QuestionResult::clamp_score(Some(-1.0), Some(5.0)), (0.0, 5.0));
        assert_eq!(QuestionResult::clamp_score(Some(3.0), Some(0.0)), (3.0, 10.0));
        assert_eq!(QuestionResult::clamp_score(None, None), (0.0, 10.0));
        assert_eq!(QuestionResult::clamp_score(Some(f64::NAN), None), (0.0, 10.0));
    }

    #[test]
    fn test_from_loose_value() {
        let value = serde_json::json!({
            "question_text": "solve |x-1| <= 3",
            "student_answer": "[-2, 4]",
            "is_correct": false,
            "score": 15,
            "feedback": "check the endpoints",
            "errors": ["sign flipped"],
            "topic": "inequalities"
        });
        let q = QuestionResult::from_value(3, &value);
        assert_eq!(q.ordinal, 3);
        assert_eq!(q.score, 10.0);
        assert_eq!(q.max_score, 10.0);
        assert_eq!(q.initial_feedback, "check the endpoints");
        assert_eq!(q.enhanced_feedback, "check the endpoints\nsign flipped");
        assert_eq!(q.difficulty, "medium");
        assert!(q.authoritative);
    }
}
