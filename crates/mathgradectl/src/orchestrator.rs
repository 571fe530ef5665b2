//! Grading orchestrator
//!
//! Drives one assignment through the remote tools:
//!
//! 1. encode the image
//! 2. `recognize_homework` → candidate questions
//! 3. `analyze_question` per candidate → topic, difficulty, reference answer
//! 4. `grade_question` per candidate → score and feedback
//! 5. `summarize_feedback` → overall assessment
//! 6. `generate_similar_problems` for up to two weak topics
//!
//! Any failure steps the run down the mode ladder instead of failing it:
//! an unreachable endpoint yields a transport-degraded placeholder, a failed
//! tool call yields a basic placeholder, a failed save tags the result
//! persistence-degraded. Only malformed input is returned as an error.

use crate::image::{EncodedImage, ImageError, ImagePreprocessor};
use crate::registry::ConnectionRegistry;
use crate::rpc_client::Connection;
use crate::store::ResultStore;
use mathgrade_shared::grading::weak_topics;
use mathgrade_shared::{
    CapabilitySelector, Complexity, FeedbackSummary, GradingMode, GradingResult, QuestionResult,
    RemedialProblem, RemedialSet, TaskCategory, ToolOutput, TransportError,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Topics that get practice problems
const MAX_REMEDIAL_TOPICS: usize = 2;
const PROBLEMS_PER_TOPIC: u64 = 3;

#[derive(Error, Debug)]
pub enum GradeError {
    #[error("invalid image: {0}")]
    InvalidImage(#[from] ImageError),
}

/// One assignment to grade
#[derive(Debug, Clone)]
pub struct GradingRequest {
    pub homework_id: String,
    pub student_name: String,
    pub grade_level: String,
    pub image: Vec<u8>,
}

/// Why the AI-powered pipeline stopped
#[derive(Debug)]
struct StageFailure {
    stage: &'static str,
    reason: String,
    protocol_violation: bool,
}

impl StageFailure {
    fn transport(stage: &'static str, error: TransportError) -> Self {
        Self {
            stage,
            reason: error.to_string(),
            protocol_violation: error.is_protocol_violation(),
        }
    }

    fn output(stage: &'static str, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
            protocol_violation: false,
        }
    }
}

/// Output of a completed AI-powered pipeline
struct PipelineOutcome {
    results: Vec<QuestionResult>,
    assessment: FeedbackSummary,
    remedial: Vec<RemedialSet>,
    recovered: bool,
}

/// Per-run call context
struct Run<'a> {
    conn: &'a Connection,
    call_timeout: Duration,
    recovered: bool,
}

impl Run<'_> {
    /// Call a tool and decode its output. Output with nothing machine
    /// readable counts as a failed stage.
    async fn call(
        &mut self,
        stage: &'static str,
        tool: &str,
        args: Value,
    ) -> Result<Value, StageFailure> {
        let raw = self
            .conn
            .call(tool, args, self.call_timeout)
            .await
            .map_err(|e| StageFailure::transport(stage, e))?;

        let output = ToolOutput::from_result(raw);
        if output.is_recovered() {
            debug!(stage, "recovered JSON from unstructured tool output");
            self.recovered = true;
        }
        output
            .value()
            .cloned()
            .ok_or_else(|| StageFailure::output(stage, format!("{} returned no structured data", tool)))
    }
}

pub struct Orchestrator {
    registry: Arc<ConnectionRegistry>,
    selector: CapabilitySelector,
    preprocessor: Arc<dyn ImagePreprocessor>,
    store: Arc<dyn ResultStore>,
    call_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        selector: CapabilitySelector,
        preprocessor: Arc<dyn ImagePreprocessor>,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        let call_timeout = registry.client_config().call_timeout();
        Self {
            registry,
            selector,
            preprocessor,
            store,
            call_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Close the connections this orchestrator holds
    pub async fn shutdown(&self) {
        self.registry.close().await;
    }

    /// Grade one assignment. Always yields a result for a valid image.
    pub async fn grade(&self, request: GradingRequest) -> Result<GradingResult, GradeError> {
        let started = Instant::now();
        let image = self.preprocessor.preprocess(&request.image)?;
        info!(
            homework_id = %request.homework_id,
            bytes = image.byte_len,
            "grading assignment"
        );

        let mut result = match self.registry.acquire().await {
            Err(e) => {
                warn!("Tool endpoint unreachable ({}); producing transport-degraded result", e);
                self.transport_degraded(&request, &e, started)
            }
            Ok(conn) => match self.run_pipeline(&conn, &request, &image).await {
                Ok(outcome) => {
                    let mut result = GradingResult::new(
                        &request.homework_id,
                        &request.student_name,
                        &request.grade_level,
                        GradingMode::AiPowered,
                        outcome.results,
                        started.elapsed(),
                    );
                    result.assessment = Some(outcome.assessment);
                    result.remedial_problems = outcome.remedial;
                    result.heuristic_recovery = outcome.recovered;
                    result
                }
                Err(failure) => {
                    if failure.protocol_violation {
                        error!(
                            stage = failure.stage,
                            "Protocol violation from tool endpoint: {}", failure.reason
                        );
                        self.registry.invalidate().await;
                    }
                    warn!(
                        stage = failure.stage,
                        "Tool call failed ({}); producing basic result", failure.reason
                    );
                    self.basic(&request, &image, &failure, started)
                }
            },
        };

        self.persist(&mut result).await;
        info!(
            run_id = %result.run_id,
            mode = %result.mode,
            questions = result.statistics.total_questions,
            "grading finished"
        );
        Ok(result)
    }

    async fn run_pipeline(
        &self,
        conn: &Connection,
        request: &GradingRequest,
        image: &EncodedImage,
    ) -> Result<PipelineOutcome, StageFailure> {
        let mut run = Run {
            conn,
            call_timeout: self.call_timeout,
            recovered: false,
        };
        let grade_level = request.grade_level.as_str();

        // Recognition
        let model = self
            .selector
            .select(TaskCategory::Grading, true, Complexity::Medium);
        let recognized = run
            .call(
                "recognition",
                "recognize_homework",
                json!({ "image_data": image.base64, "grade_level": grade_level, "model": model }),
            )
            .await?;
        let candidates = candidates(&recognized);
        if candidates.is_empty() {
            info!("no questions recognized; grading an empty set");
        }
        debug!(count = candidates.len(), "recognized questions");

        // Analysis
        let model = self
            .selector
            .select(TaskCategory::Analysis, false, Complexity::Medium);
        let mut analyzed = Vec::with_capacity(candidates.len());
        for (ordinal, candidate) in candidates {
            let analysis = run
                .call(
                    "analysis",
                    "analyze_question",
                    json!({
                        "question_text": text_field(&candidate, "question_text"),
                        "student_answer": text_field(&candidate, "student_answer"),
                        "grade_level": grade_level,
                        "model": model,
                    }),
                )
                .await?;
            analyzed.push((ordinal, merge(candidate, &analysis)));
        }

        // Grading
        let model = self
            .selector
            .select(TaskCategory::Grading, false, Complexity::Medium);
        let mut results = Vec::with_capacity(analyzed.len());
        for (ordinal, question) in analyzed {
            let grading = run
                .call(
                    "grading",
                    "grade_question",
                    json!({
                        "question_text": text_field(&question, "question_text"),
                        "student_answer": text_field(&question, "student_answer"),
                        "correct_answer": text_field(&question, "correct_answer"),
                        "grade_level": grade_level,
                        "model": model,
                    }),
                )
                .await?;
            results.push(QuestionResult::from_value(ordinal, &merge(question, &grading)));
        }

        // Feedback synthesis
        let correct_count = results.iter().filter(|r| r.is_correct).count();
        let mut topics: Vec<&str> = Vec::new();
        for r in &results {
            if !topics.contains(&r.topic.as_str()) {
                topics.push(r.topic.as_str());
            }
        }
        let model = self.selector.select(
            TaskCategory::Feedback,
            false,
            Complexity::for_question_count(results.len()),
        );
        let summary = run
            .call(
                "feedback",
                "summarize_feedback",
                json!({
                    "grade_level": grade_level,
                    "total_questions": results.len(),
                    "correct_count": correct_count,
                    "topics": topics,
                    "model": model,
                }),
            )
            .await?;
        let assessment: FeedbackSummary = serde_json::from_value(summary)
            .map_err(|e| StageFailure::output("feedback", format!("malformed assessment: {}", e)))?;

        // Remedial problems
        let model = self
            .selector
            .select(TaskCategory::Feedback, false, Complexity::High);
        let mut remedial = Vec::new();
        for topic in weak_topics(&results, MAX_REMEDIAL_TOPICS) {
            let original = results
                .iter()
                .find(|r| !r.is_correct && r.topic == topic)
                .map(|r| r.question_text.clone())
                .unwrap_or_default();
            let generated = run
                .call(
                    "remedial",
                    "generate_similar_problems",
                    json!({
                        "original_question": original,
                        "topic": topic,
                        "grade_level": grade_level,
                        "count": PROBLEMS_PER_TOPIC,
                        "model": model,
                    }),
                )
                .await?;
            let problems: Vec<RemedialProblem> = generated
                .get("problems")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| StageFailure::output("remedial", format!("malformed problems: {}", e)))?
                .unwrap_or_default();
            remedial.push(RemedialSet { topic, problems });
        }

        Ok(PipelineOutcome {
            results,
            assessment,
            remedial,
            recovered: run.recovered,
        })
    }

    fn transport_degraded(
        &self,
        request: &GradingRequest,
        error: &TransportError,
        started: Instant,
    ) -> GradingResult {
        let placeholder = QuestionResult {
            ordinal: 1,
            question_text: "Homework could not be graded".to_string(),
            student_answer: String::new(),
            correct_answer: String::new(),
            score: 0.0,
            max_score: QuestionResult::DEFAULT_MAX_SCORE,
            is_correct: false,
            initial_feedback: "The grading service is unavailable, so this homework was not graded."
                .to_string(),
            enhanced_feedback: format!(
                "Could not reach the grading endpoint at {}: {}. Please submit again later.",
                self.registry.address(),
                error
            ),
            topic: "general".to_string(),
            difficulty: "unknown".to_string(),
            question_type: "unavailable".to_string(),
            authoritative: false,
        };
        let mut result = GradingResult::new(
            &request.homework_id,
            &request.student_name,
            &request.grade_level,
            GradingMode::AiPowered,
            vec![placeholder],
            started.elapsed(),
        );
        result.degrade(GradingMode::TransportDegraded, error.to_string());
        result
    }

    fn basic(
        &self,
        request: &GradingRequest,
        image: &EncodedImage,
        failure: &StageFailure,
        started: Instant,
    ) -> GradingResult {
        let (score, max_score) = QuestionResult::clamp_score(Some(5.0), None);
        let placeholder = QuestionResult {
            ordinal: 1,
            question_text: format!(
                "Homework submission ({:.1} KB image)",
                image.byte_len as f64 / 1024.0
            ),
            student_answer: String::new(),
            correct_answer: String::new(),
            score,
            max_score,
            is_correct: false,
            initial_feedback: format!(
                "Basic review for {} ({}): automatic grading was not available, a teacher should review this assignment.",
                request.student_name, request.grade_level
            ),
            enhanced_feedback: format!(
                "AI grading stopped at the {} stage: {}",
                failure.stage, failure.reason
            ),
            topic: "general".to_string(),
            difficulty: "medium".to_string(),
            question_type: "basic_review".to_string(),
            authoritative: false,
        };
        let mut result = GradingResult::new(
            &request.homework_id,
            &request.student_name,
            &request.grade_level,
            GradingMode::AiPowered,
            vec![placeholder],
            started.elapsed(),
        );
        result.degrade(
            GradingMode::Basic,
            format!("{} stage failed: {}", failure.stage, failure.reason),
        );
        result
    }

    async fn persist(&self, result: &mut GradingResult) {
        match self.store.create(result).await {
            Ok(id) => debug!(%id, "result saved"),
            Err(e) => {
                warn!("Failed to save result {}: {}", result.run_id, e);
                result.degrade(
                    GradingMode::PersistenceDegraded,
                    format!("failed to save result: {}", e),
                );
            }
        }
    }
}

/// Recognized questions with their ordinals. Accepts `{questions: [...]}`
/// or a bare list.
fn candidates(recognized: &Value) -> Vec<(u32, Value)> {
    let items = recognized
        .get("questions")
        .and_then(Value::as_array)
        .or_else(|| recognized.as_array());
    items
        .map(|items| {
            items
                .iter()
                .filter(|q| q.is_object())
                .enumerate()
                .map(|(i, q)| {
                    let ordinal = q
                        .get("number")
                        .and_then(Value::as_u64)
                        .map(|n| n as u32)
                        .unwrap_or(i as u32 + 1);
                    (ordinal, q.clone())
                })
                .collect()
        })
        .unwrap_or_default()
}

fn text_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Overlay the fields of `update` onto `base`
fn merge(base: Value, update: &Value) -> Value {
    let mut merged = match base {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    if let Some(fields) = update.as_object() {
        for (key, value) in fields {
            if !value.is_null() {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(merged)
}
