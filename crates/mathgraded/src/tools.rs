//! Standard tool catalog.
//!
//! Every tool builds a prompt from its arguments and asks the model backend
//! for a JSON answer. Results go back as `{content: [{type: "text", text}]}`
//! so callers decide how to decode them. `analyze_homework` is the one-shot
//! variant and assembles statistics itself.

use crate::backend::{CompletionRequest, ModelBackend};
use crate::dispatch::ToolHandler;
use async_trait::async_trait;
use mathgrade_shared::tool_output::text_content;
use mathgrade_shared::{
    CapabilityDescriptor, CapabilitySelector, Complexity, GradingMode, GradingStatistics,
    QuestionResult, TaskCategory, ToolError, ToolOutput,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

pub const ANALYZE_HOMEWORK: &str = "analyze_homework";
pub const RECOGNIZE_HOMEWORK: &str = "recognize_homework";
pub const ANALYZE_QUESTION: &str = "analyze_question";
pub const GRADE_QUESTION: &str = "grade_question";
pub const SUMMARIZE_FEEDBACK: &str = "summarize_feedback";
pub const GENERATE_SIMILAR_PROBLEMS: &str = "generate_similar_problems";
pub const GENERATE_DETAILED_FEEDBACK: &str = "generate_detailed_feedback";
pub const VALIDATE_MATH_EXPRESSION: &str = "validate_math_expression";

const MAX_SIMILAR_PROBLEMS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandardTool {
    AnalyzeHomework,
    RecognizeHomework,
    AnalyzeQuestion,
    GradeQuestion,
    SummarizeFeedback,
    GenerateSimilarProblems,
    GenerateDetailedFeedback,
    ValidateMathExpression,
}

impl StandardTool {
    pub const ALL: [StandardTool; 8] = [
        StandardTool::AnalyzeHomework,
        StandardTool::RecognizeHomework,
        StandardTool::AnalyzeQuestion,
        StandardTool::GradeQuestion,
        StandardTool::SummarizeFeedback,
        StandardTool::GenerateSimilarProblems,
        StandardTool::GenerateDetailedFeedback,
        StandardTool::ValidateMathExpression,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::AnalyzeHomework => ANALYZE_HOMEWORK,
            Self::RecognizeHomework => RECOGNIZE_HOMEWORK,
            Self::AnalyzeQuestion => ANALYZE_QUESTION,
            Self::GradeQuestion => GRADE_QUESTION,
            Self::SummarizeFeedback => SUMMARIZE_FEEDBACK,
            Self::GenerateSimilarProblems => GENERATE_SIMILAR_PROBLEMS,
            Self::GenerateDetailedFeedback => GENERATE_DETAILED_FEEDBACK,
            Self::ValidateMathExpression => VALIDATE_MATH_EXPRESSION,
        }
    }

    fn description(self) -> &'static str {
        match self {
            Self::AnalyzeHomework => "Recognize and grade every question in a homework image in one pass",
            Self::RecognizeHomework => "Recognize questions and student answers in a homework image",
            Self::AnalyzeQuestion => "Determine topic, difficulty and reference answer of one question",
            Self::GradeQuestion => "Grade one student answer against the reference answer",
            Self::SummarizeFeedback => "Write an overall assessment for a graded assignment",
            Self::GenerateSimilarProblems => "Generate practice problems similar to a missed question",
            Self::GenerateDetailedFeedback => "Write detailed teaching feedback for a wrong answer",
            Self::ValidateMathExpression => "Check a math expression and optionally its expected result",
        }
    }

    /// Selector inputs for the default model when the caller names none
    fn task(self) -> (TaskCategory, bool, Complexity) {
        match self {
            Self::AnalyzeHomework | Self::RecognizeHomework => {
                (TaskCategory::Grading, true, Complexity::Medium)
            }
            Self::AnalyzeQuestion => (TaskCategory::Analysis, false, Complexity::Medium),
            Self::GradeQuestion => (TaskCategory::Grading, false, Complexity::Medium),
            Self::SummarizeFeedback | Self::GenerateDetailedFeedback => {
                (TaskCategory::Feedback, false, Complexity::Medium)
            }
            Self::GenerateSimilarProblems => (TaskCategory::Feedback, false, Complexity::High),
            Self::ValidateMathExpression => (TaskCategory::Analysis, false, Complexity::Low),
        }
    }

    /// (max tokens, temperature)
    fn generation(self) -> (u32, f32) {
        match self {
            Self::AnalyzeHomework | Self::RecognizeHomework => (2000, 0.1),
            Self::AnalyzeQuestion => (1000, 0.1),
            Self::GradeQuestion => (800, 0.1),
            Self::SummarizeFeedback => (1000, 0.3),
            Self::GenerateSimilarProblems => (1000, 0.5),
            Self::GenerateDetailedFeedback => (1000, 0.3),
            Self::ValidateMathExpression => (500, 0.0),
        }
    }

    fn input_schema(self) -> Value {
        let s = |d: &str| json!({ "type": "string", "description": d });
        let model = s("Model identifier override");
        match self {
            Self::AnalyzeHomework => json!({
                "type": "object",
                "properties": {
                    "image_data": s("Base64 encoded homework image"),
                    "grade_level": s("Student grade level"),
                    "student_name": s("Student name"),
                    "analysis_type": { "type": "string", "enum": ["quick", "full", "detailed"], "default": "full" },
                    "model": model
                },
                "required": ["image_data", "grade_level"]
            }),
            Self::RecognizeHomework => json!({
                "type": "object",
                "properties": {
                    "image_data": s("Base64 encoded homework image"),
                    "grade_level": s("Student grade level"),
                    "model": model
                },
                "required": ["image_data", "grade_level"]
            }),
            Self::AnalyzeQuestion => json!({
                "type": "object",
                "properties": {
                    "question_text": s("Question text"),
                    "student_answer": s("Student answer"),
                    "grade_level": s("Student grade level"),
                    "model": model
                },
                "required": ["question_text", "grade_level"]
            }),
            Self::GradeQuestion => json!({
                "type": "object",
                "properties": {
                    "question_text": s("Question text"),
                    "student_answer": s("Student answer"),
                    "correct_answer": s("Reference answer"),
                    "grade_level": s("Student grade level"),
                    "model": model
                },
                "required": ["question_text", "grade_level"]
            }),
            Self::SummarizeFeedback => json!({
                "type": "object",
                "properties": {
                    "grade_level": s("Student grade level"),
                    "total_questions": { "type": "integer", "minimum": 0 },
                    "correct_count": { "type": "integer", "minimum": 0 },
                    "topics": { "type": "array", "items": { "type": "string" } },
                    "model": model
                },
                "required": ["grade_level", "total_questions", "correct_count"]
            }),
            Self::GenerateSimilarProblems => json!({
                "type": "object",
                "properties": {
                    "original_question": s("Question the student missed"),
                    "topic": s("Topic to practice"),
                    "grade_level": s("Student grade level"),
                    "difficulty_level": { "type": "string", "enum": ["easier", "same", "harder"], "default": "same" },
                    "count": { "type": "integer", "minimum": 1, "maximum": MAX_SIMILAR_PROBLEMS, "default": 3 },
                    "model": model
                },
                "required": ["original_question"]
            }),
            Self::GenerateDetailedFeedback => json!({
                "type": "object",
                "properties": {
                    "question_text": s("Question text"),
                    "student_answer": s("Student answer"),
                    "correct_answer": s("Reference answer"),
                    "feedback_type": { "type": "string", "enum": ["brief", "detailed", "encouraging"], "default": "detailed" },
                    "model": model
                },
                "required": ["question_text", "student_answer", "correct_answer"]
            }),
            Self::ValidateMathExpression => json!({
                "type": "object",
                "properties": {
                    "expression": s("Math expression"),
                    "expected_result": s("Expected result"),
                    "grade_level": s("Student grade level"),
                    "model": model
                },
                "required": ["expression"]
            }),
        }
    }

    pub fn descriptor(self) -> CapabilityDescriptor {
        CapabilityDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }

    /// Validate arguments and render the prompt
    fn prompt(self, args: &Value) -> Result<String, ToolError> {
        let prompt = match self {
            Self::AnalyzeHomework => {
                required_str(args, "image_data")?;
                let grade = required_str(args, "grade_level")?;
                let depth = optional_str(args, "analysis_type").unwrap_or("full");
                format!(
                    "Grade this {grade} math homework image ({depth} analysis). For every question return \
                     question_text, student_answer, correct_answer, is_correct, score, max_score (10), \
                     feedback, topic and difficulty. Reply with JSON only: {{\"results\": [ ... ]}}"
                )
            }
            Self::RecognizeHomework => {
                required_str(args, "image_data")?;
                let grade = required_str(args, "grade_level")?;
                format!(
                    "Read this {grade} math homework image and list every question with the student's answer. \
                     Reply with JSON only: {{\"questions\": [{{\"number\": 1, \"question_text\": \"...\", \
                     \"student_answer\": \"...\", \"confidence\": 0.95}}], \"total_questions\": 1}}"
                )
            }
            Self::AnalyzeQuestion => {
                let question = required_str(args, "question_text")?;
                let answer = optional_str(args, "student_answer").unwrap_or("");
                let grade = required_str(args, "grade_level")?;
                format!(
                    "Analyze this {grade} math question.\nQuestion: {question}\nStudent answer: {answer}\n\
                     Reply with JSON only: {{\"question_type\": \"...\", \"topic\": \"...\", \
                     \"difficulty\": \"...\", \"correct_answer\": \"...\", \"solution_steps\": [\"...\"]}}"
                )
            }
            Self::GradeQuestion => {
                let question = required_str(args, "question_text")?;
                let answer = optional_str(args, "student_answer").unwrap_or("(no answer)");
                let reference = optional_str(args, "correct_answer").unwrap_or("unknown");
                let grade = required_str(args, "grade_level")?;
                format!(
                    "Grade this {grade} math answer.\nQuestion: {question}\nReference answer: {reference}\n\
                     Student answer: {answer}\nReply with JSON only: {{\"is_correct\": true, \"score\": 8, \
                     \"max_score\": 10, \"feedback\": \"...\", \"errors\": [\"...\"]}}"
                )
            }
            Self::SummarizeFeedback => {
                let grade = required_str(args, "grade_level")?;
                let total = required_u64(args, "total_questions")?;
                let correct = required_u64(args, "correct_count")?;
                if correct > total {
                    return Err(ToolError::InvalidArguments(format!(
                        "correct_count {} exceeds total_questions {}",
                        correct, total
                    )));
                }
                let topics = args
                    .get("topics")
                    .and_then(Value::as_array)
                    .map(|t| {
                        t.iter()
                            .filter_map(Value::as_str)
                            .collect::<Vec<_>>()
                            .join(", ")
                    })
                    .unwrap_or_default();
                format!(
                    "Write overall learning feedback for a {grade} student.\nQuestions: {total}\n\
                     Correct: {correct}\nTopics: {topics}\nReply with JSON only: \
                     {{\"overall_assessment\": \"...\", \"strengths\": [\"...\"], \"weaknesses\": [\"...\"], \
                     \"suggestions\": [\"...\"]}}"
                )
            }
            Self::GenerateSimilarProblems => {
                let question = required_str(args, "original_question")?;
                let count = match args.get("count") {
                    None | Some(Value::Null) => 3,
                    Some(v) => v
                        .as_u64()
                        .filter(|c| (1..=MAX_SIMILAR_PROBLEMS).contains(c))
                        .ok_or_else(|| {
                            ToolError::InvalidArguments(format!(
                                "count must be an integer between 1 and {}",
                                MAX_SIMILAR_PROBLEMS
                            ))
                        })?,
                };
                let topic = optional_str(args, "topic").unwrap_or("the same topic");
                let difficulty = optional_str(args, "difficulty_level").unwrap_or("same");
                let grade = optional_str(args, "grade_level").unwrap_or("the same grade");
                format!(
                    "Write {count} practice problems on {topic} for a student at {grade}, difficulty \
                     '{difficulty}' relative to this question: {question}\nReply with JSON only: \
                     {{\"topic\": \"{topic}\", \"problems\": [{{\"question\": \"...\", \"answer\": \"...\", \
                     \"hint\": \"...\"}}]}}"
                )
            }
            Self::GenerateDetailedFeedback => {
                let question = required_str(args, "question_text")?;
                let answer = required_str(args, "student_answer")?;
                let reference = required_str(args, "correct_answer")?;
                let style = optional_str(args, "feedback_type").unwrap_or("detailed");
                format!(
                    "Write {style} teaching feedback.\nQuestion: {question}\nStudent answer: {answer}\n\
                     Correct answer: {reference}\nReply with JSON only: {{\"feedback\": \"...\", \
                     \"suggestions\": [\"...\"]}}"
                )
            }
            Self::ValidateMathExpression => {
                let expression = required_str(args, "expression")?;
                let expected = optional_str(args, "expected_result")
                    .map(|e| format!("\nExpected result: {}", e))
                    .unwrap_or_default();
                format!(
                    "Check whether this math expression is well formed and evaluate it.\n\
                     Expression: {expression}{expected}\nReply with JSON only: {{\"valid\": true, \
                     \"result\": \"...\", \"matches_expected\": true, \"explanation\": \"...\"}}"
                )
            }
        };
        Ok(prompt)
    }
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing required string '{}'", key)))
}

fn optional_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

fn required_u64(args: &Value, key: &str) -> Result<u64, ToolError> {
    args.get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing required integer '{}'", key)))
}

/// A standard tool served by a model backend
pub struct BackendTool {
    tool: StandardTool,
    backend: Arc<dyn ModelBackend>,
    selector: CapabilitySelector,
    max_tokens_cap: u32,
}

impl BackendTool {
    pub fn new(
        tool: StandardTool,
        backend: Arc<dyn ModelBackend>,
        selector: CapabilitySelector,
        max_tokens_cap: u32,
    ) -> Self {
        Self {
            tool,
            backend,
            selector,
            max_tokens_cap,
        }
    }

    fn assemble_analysis(&self, text: &str, args: &Value, started: Instant) -> Result<Value, ToolError> {
        let output = ToolOutput::from_text(text);
        let items = output
            .value()
            .and_then(|v| v.get("results").or_else(|| v.get("questions")))
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ToolError::Handler("model output did not contain a results list".to_string())
            })?;

        let results: Vec<QuestionResult> = items
            .iter()
            .enumerate()
            .map(|(i, v)| QuestionResult::from_value(i as u32 + 1, v))
            .collect();
        let statistics = GradingStatistics::compute(&results);

        let body = json!({
            "success": true,
            "results": results,
            "statistics": statistics,
            "processing_time": started.elapsed().as_secs_f64(),
            "mode": GradingMode::AiPowered,
            "student_name": optional_str(args, "student_name").unwrap_or(""),
            "grade_level": optional_str(args, "grade_level").unwrap_or(""),
            "heuristic_recovery": output.is_recovered(),
        });
        Ok(text_content(body.to_string()))
    }
}

#[async_trait]
impl ToolHandler for BackendTool {
    fn descriptor(&self) -> CapabilityDescriptor {
        self.tool.descriptor()
    }

    async fn call(&self, args: Value) -> Result<Value, ToolError> {
        if !args.is_object() {
            return Err(ToolError::InvalidArguments(
                "arguments must be an object".to_string(),
            ));
        }
        let prompt = self.tool.prompt(&args)?;

        let (task, image, complexity) = self.tool.task();
        let model = optional_str(&args, "model")
            .unwrap_or_else(|| self.selector.select(task, image, complexity))
            .to_string();
        let (max_tokens, temperature) = self.tool.generation();
        let image_base64 = if image {
            optional_str(&args, "image_data").map(str::to_string)
        } else {
            None
        };

        let request = CompletionRequest {
            tool: self.tool.name().to_string(),
            model,
            prompt,
            image_base64,
            max_tokens: max_tokens.min(self.max_tokens_cap),
            temperature,
        };

        let started = Instant::now();
        let text = self
            .backend
            .complete(request)
            .await
            .map_err(|e| ToolError::Handler(e.to_string()))?;

        match self.tool {
            StandardTool::AnalyzeHomework => self.assemble_analysis(&text, &args, started),
            _ => Ok(text_content(text)),
        }
    }
}
