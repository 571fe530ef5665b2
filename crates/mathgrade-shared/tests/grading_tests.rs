//! Statistics and result-model tests

use mathgrade_shared::grading::weak_topics;
use mathgrade_shared::{GradingMode, GradingResult, GradingStatistics, QuestionResult};
use std::time::Duration;

fn question(ordinal: u32, topic: &str, score: f64, max: f64, correct: bool) -> QuestionResult {
    QuestionResult {
        ordinal,
        question_text: format!("question {}", ordinal),
        student_answer: "x = 2".to_string(),
        correct_answer: "x = 2".to_string(),
        score,
        max_score: max,
        is_correct: correct,
        initial_feedback: String::new(),
        enhanced_feedback: String::new(),
        topic: topic.to_string(),
        difficulty: "medium".to_string(),
        question_type: "calculation".to_string(),
        authoritative: true,
    }
}

#[test]
fn test_empty_results() {
    let stats = GradingStatistics::compute(&[]);
    assert_eq!(stats.total_questions, 0);
    assert_eq!(stats.accuracy_rate, 0.0);
    assert_eq!(stats.score_percentage, 0.0);
    assert!(stats.topic_breakdown.is_empty());
}

#[test]
fn test_half_correct() {
    let results = vec![
        question(1, "sets", 9.0, 10.0, true),
        question(2, "inequalities", 3.0, 10.0, false),
    ];
    let stats = GradingStatistics::compute(&results);
    assert_eq!(stats.total_questions, 2);
    assert_eq!(stats.correct_count, 1);
    assert_eq!(stats.accuracy_rate, 50.0);
    assert_eq!(stats.total_score, 12.0);
    assert_eq!(stats.max_total_score, 20.0);
    assert_eq!(stats.score_percentage, 60.0);
    assert_eq!(stats.topic_breakdown.len(), 2);
    assert_eq!(stats.topic_breakdown["sets"].correct, 1);
    assert_eq!(stats.topic_breakdown["inequalities"].total, 1);
}

#[test]
fn test_zero_max_score() {
    let stats = GradingStatistics::compute(&[question(1, "t", 0.0, 0.0, false)]);
    assert_eq!(stats.score_percentage, 0.0);
}

#[test]
fn test_statistics_invariants() {
    let scores = [0.0, 2.5, 5.0, 10.0, 7.0, 1.0, 9.5];
    for n in 0..scores.len() {
        let results: Vec<QuestionResult> = scores[..n]
            .iter()
            .enumerate()
            .map(|(i, &s)| {
                let (score, max) = QuestionResult::clamp_score(Some(s * 1.3), Some(10.0));
                question(i as u32 + 1, if i % 2 == 0 { "a" } else { "b" }, score, max, s > 5.0)
            })
            .collect();
        let stats = GradingStatistics::compute(&results);
        assert!(stats.correct_count <= stats.total_questions);
        assert!((0.0..=100.0).contains(&stats.accuracy_rate));
        if stats.max_total_score > 0.0 {
            assert!(stats.total_score <= stats.max_total_score);
        }
        let per_topic: usize = stats.topic_breakdown.values().map(|t| t.total).sum();
        assert_eq!(per_topic, stats.total_questions);
    }
}

#[test]
fn test_corrected_creates_new_record() {
    let original = question(1, "sets", 3.0, 10.0, false);
    let fixed = original.corrected(14.0, true, "regraded");
    assert_eq!(original.score, 3.0);
    assert!(!original.is_correct);
    assert_eq!(fixed.score, 10.0);
    assert!(fixed.is_correct);
    assert_eq!(fixed.initial_feedback, "regraded");
    assert_eq!(fixed.question_text, original.question_text);
}

#[test]
fn test_weak_topics_limit_and_order() {
    let results = vec![
        question(1, "functions", 2.0, 10.0, false),
        question(2, "sets", 10.0, 10.0, true),
        question(3, "functions", 1.0, 10.0, false),
        question(4, "inequalities", 0.0, 10.0, false),
        question(5, "derivatives", 0.0, 10.0, false),
    ];
    assert_eq!(weak_topics(&results, 2), vec!["functions", "inequalities"]);
    assert!(weak_topics(&results[1..2], 2).is_empty());
}

#[test]
fn test_degrade_never_raises_mode() {
    let mut result = GradingResult::new(
        "hw1",
        "Li Lei",
        "grade 10",
        GradingMode::TransportDegraded,
        vec![question(1, "t", 0.0, 10.0, false)],
        Duration::from_millis(100),
    );
    result.degrade(GradingMode::Basic, "late failure");
    assert_eq!(result.mode, GradingMode::TransportDegraded);
    result.degrade(GradingMode::PersistenceDegraded, "store offline");
    assert_eq!(result.mode, GradingMode::PersistenceDegraded);
    assert_eq!(result.degradations.len(), 2);
    assert!((result.processing_time - 0.1).abs() < 1e-9);
}

#[test]
fn test_result_json_shape() {
    let result = GradingResult::new(
        "hw1",
        "Li Lei",
        "grade 10",
        GradingMode::AiPowered,
        vec![question(1, "sets", 8.0, 10.0, true)],
        Duration::from_secs(1),
    );
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["mode"], "ai_powered");
    assert_eq!(json["statistics"]["total_questions"], 1);
    assert_eq!(json["statistics"]["topic_breakdown"]["sets"]["correct"], 1);
    let back: GradingResult = serde_json::from_value(json).unwrap();
    assert_eq!(back.run_id, result.run_id);
}
