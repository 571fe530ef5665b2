//! Grading pipeline and fallback tests against a live endpoint with a
//! scripted model backend

use futures_util::{SinkExt, StreamExt};
use mathgrade_shared::config::ClientConfig;
use mathgrade_shared::{CapabilitySelector, EndpointAddress, GradingMode};
use mathgradectl::image::Base64Encoder;
use mathgradectl::store::{InMemoryStore, ResultStore};
use mathgradectl::{
    ConnectionRegistry, ConnectionState, GradeError, GradingRequest, GradingService, Orchestrator,
};
use mathgraded::backend::{ScriptedBackend, ScriptedBackendBuilder};
use mathgraded::{serve, EndpointState, ToolRegistry};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

const JPEG: [u8; 8] = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F'];

fn client_config() -> ClientConfig {
    ClientConfig {
        connect_timeout_secs: 2,
        handshake_timeout_secs: 2,
        call_timeout_secs: 5,
        keepalive_timeout_secs: 1,
        connect_attempts: 1,
        retry_delay_ms: 10,
    }
}

fn request() -> GradingRequest {
    GradingRequest {
        homework_id: "hw-42".to_string(),
        student_name: "Li Lei".to_string(),
        grade_level: "grade 10".to_string(),
        image: JPEG.to_vec(),
    }
}

async fn endpoint(backend: ScriptedBackend) -> (EndpointAddress, Arc<ScriptedBackend>) {
    let backend = Arc::new(backend);
    let registry = ToolRegistry::standard(backend.clone(), CapabilitySelector::default(), 2000);
    let state = Arc::new(EndpointState::new(registry));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = serve(listener, state).await;
    });
    (EndpointAddress::new("127.0.0.1", port), backend)
}

async fn unreachable_address() -> EndpointAddress {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    EndpointAddress::new("127.0.0.1", port)
}

fn orchestrator(addr: EndpointAddress, store: Arc<dyn ResultStore>) -> Orchestrator {
    Orchestrator::new(
        Arc::new(ConnectionRegistry::new(addr, client_config())),
        CapabilitySelector::default(),
        Arc::new(Base64Encoder::default()),
        store,
    )
}

/// Two questions, the second one wrong
fn two_question_script() -> ScriptedBackendBuilder {
    ScriptedBackend::builder()
        .json(
            "recognize_homework",
            json!({"questions": [
                {"number": 1, "question_text": "A = {1,2}, B = {2,3}. Find A ∩ B", "student_answer": "{2}"},
                {"number": 2, "question_text": "Solve |x - 1| <= 3", "student_answer": "x <= 4"}
            ], "total_questions": 2}),
        )
        .json(
            "analyze_question",
            json!({"topic": "sets", "difficulty": "easy", "correct_answer": "{2}", "question_type": "calculation"}),
        )
        .json(
            "analyze_question",
            json!({"topic": "inequalities", "difficulty": "medium", "correct_answer": "-2 <= x <= 4"}),
        )
        .json(
            "grade_question",
            json!({"is_correct": true, "score": 9, "max_score": 10, "feedback": "Correct."}),
        )
        .json(
            "grade_question",
            json!({"is_correct": false, "score": 4, "max_score": 10, "feedback": "Missing the lower bound.", "errors": ["dropped -2 <= x"]}),
        )
        .json(
            "summarize_feedback",
            json!({
                "overall_assessment": "Solid on sets, review inequalities.",
                "strengths": ["set operations"],
                "weaknesses": ["absolute value inequalities"],
                "suggestions": ["Split |x - a| <= b into two inequalities"]
            }),
        )
        .json(
            "generate_similar_problems",
            json!({"topic": "inequalities", "problems": [
                {"question": "Solve |x + 2| < 5", "answer": "-7 < x < 3", "hint": "Two cases"}
            ]}),
        )
}

#[tokio::test]
async fn test_unreachable_endpoint_is_transport_degraded() {
    let store = Arc::new(InMemoryStore::new());
    let orch = orchestrator(unreachable_address().await, store.clone());

    let result = orch.grade(request()).await.unwrap();
    assert_eq!(result.mode, GradingMode::TransportDegraded);
    assert_eq!(result.results.len(), 1);
    let q = &result.results[0];
    assert!(!q.is_correct);
    assert_eq!(q.score, 0.0);
    assert_eq!(q.max_score, 10.0);
    assert!(!q.authoritative);
    assert_eq!(result.statistics.total_questions, 1);
    assert_eq!(result.statistics.accuracy_rate, 0.0);
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_recognition_failure_is_basic() {
    let (addr, backend) = endpoint(
        ScriptedBackend::builder()
            .fail("recognize_homework", "vision model overloaded")
            .build(),
    )
    .await;
    let orch = orchestrator(addr, Arc::new(InMemoryStore::new()));

    let result = orch.grade(request()).await.unwrap();
    assert_eq!(result.mode, GradingMode::Basic);
    assert_eq!(result.results.len(), 1);
    let q = &result.results[0];
    assert_eq!(q.score, 5.0);
    assert_eq!(q.max_score, 10.0);
    assert!(!q.is_correct);
    assert!(!q.authoritative);
    assert!(q.enhanced_feedback.contains("vision model overloaded"));
    assert!(q.initial_feedback.contains("Li Lei"));
    // No further remote calls after the failure
    assert_eq!(backend.call_count("analyze_question"), 0);
    assert_eq!(result.degradations.len(), 1);
}

#[tokio::test]
async fn test_blank_page_stays_ai_powered() {
    let (addr, backend) = endpoint(
        ScriptedBackend::builder()
            .json("recognize_homework", json!({"questions": [], "total_questions": 0}))
            .json("summarize_feedback", json!({"overall_assessment": "Nothing to grade on this page."}))
            .build(),
    )
    .await;
    let store = Arc::new(InMemoryStore::new());
    let orch = orchestrator(addr, store.clone());

    let result = orch.grade(request()).await.unwrap();
    assert_eq!(result.mode, GradingMode::AiPowered);
    assert!(result.degradations.is_empty());
    assert!(result.results.is_empty());
    assert_eq!(result.statistics.total_questions, 0);
    assert_eq!(result.statistics.accuracy_rate, 0.0);
    assert_eq!(result.statistics.score_percentage, 0.0);
    assert!(result.assessment.is_some());
    assert!(result.remedial_problems.is_empty());

    assert_eq!(backend.call_count("analyze_question"), 0);
    assert_eq!(backend.call_count("grade_question"), 0);
    assert_eq!(backend.call_count("summarize_feedback"), 1);
    assert_eq!(backend.call_count("generate_similar_problems"), 0);
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_full_pipeline() {
    let (addr, backend) = endpoint(two_question_script().build()).await;
    let store = Arc::new(InMemoryStore::new());
    let orch = orchestrator(addr, store.clone());

    let result = orch.grade(request()).await.unwrap();
    assert_eq!(result.mode, GradingMode::AiPowered);
    assert!(result.degradations.is_empty());
    assert_eq!(result.results.len(), 2);

    let stats = &result.statistics;
    assert_eq!(stats.total_questions, 2);
    assert_eq!(stats.correct_count, 1);
    assert_eq!(stats.accuracy_rate, 50.0);
    assert_eq!(stats.total_score, 13.0);
    assert_eq!(stats.max_total_score, 20.0);
    assert!((stats.score_percentage - 65.0).abs() < 1e-9);
    assert_eq!(stats.topic_breakdown.len(), 2);
    assert_eq!(stats.topic_breakdown["sets"].correct, 1);
    assert_eq!(stats.topic_breakdown["inequalities"].total, 1);

    let wrong = &result.results[1];
    assert_eq!(wrong.ordinal, 2);
    assert_eq!(wrong.correct_answer, "-2 <= x <= 4");
    assert!(wrong.enhanced_feedback.contains("dropped -2 <= x"));
    assert!(wrong.authoritative);

    let assessment = result.assessment.as_ref().unwrap();
    assert_eq!(assessment.strengths, vec!["set operations"]);
    assert_eq!(result.remedial_problems.len(), 1);
    assert_eq!(result.remedial_problems[0].topic, "inequalities");
    assert_eq!(result.remedial_problems[0].problems.len(), 1);
    assert!(!result.heuristic_recovery);

    assert_eq!(backend.call_count("generate_similar_problems"), 1);
    let calls = backend.calls();
    let recognition = calls.iter().find(|c| c.tool == "recognize_homework").unwrap();
    assert_eq!(recognition.model, "nvidia/llama-3.2-90b-vision-instruct");
    let analysis = calls.iter().find(|c| c.tool == "analyze_question").unwrap();
    assert_eq!(analysis.model, "nvidia/llama-3.1-70b-instruct");
    let remedial = calls.iter().find(|c| c.tool == "generate_similar_problems").unwrap();
    assert_eq!(remedial.model, "nvidia/llama-3.1-70b-instruct");

    assert_eq!(store.read(result.run_id).await.unwrap().results.len(), 2);
}

#[tokio::test]
async fn test_all_correct_skips_remedial() {
    let backend = ScriptedBackend::builder()
        .json(
            "recognize_homework",
            json!({"questions": [{"question_text": "2 + 2", "student_answer": "4"}]}),
        )
        .json("analyze_question", json!({"topic": "arithmetic", "correct_answer": "4"}))
        .reply(
            "grade_question",
            "Looks right to me.\n```json\n{\"is_correct\": true, \"score\": 10, \"max_score\": 10}\n```",
        )
        .json("summarize_feedback", json!({"overall_assessment": "All correct."}))
        .build();
    let (addr, backend) = endpoint(backend).await;
    let orch = orchestrator(addr, Arc::new(InMemoryStore::new()));

    let result = orch.grade(request()).await.unwrap();
    assert_eq!(result.mode, GradingMode::AiPowered);
    assert!(result.heuristic_recovery);
    assert!(result.remedial_problems.is_empty());
    assert_eq!(backend.call_count("generate_similar_problems"), 0);
    assert_eq!(result.statistics.accuracy_rate, 100.0);
}

#[tokio::test]
async fn test_unstructured_grading_output_is_basic() {
    let backend = ScriptedBackend::builder()
        .json(
            "recognize_homework",
            json!({"questions": [{"question_text": "2 + 2", "student_answer": "5"}]}),
        )
        .json("analyze_question", json!({"topic": "arithmetic", "correct_answer": "4"}))
        .reply("grade_question", "I am not sure how to grade this.")
        .build();
    let (addr, _) = endpoint(backend).await;
    let orch = orchestrator(addr, Arc::new(InMemoryStore::new()));

    let result = orch.grade(request()).await.unwrap();
    assert_eq!(result.mode, GradingMode::Basic);
    assert!(result.results[0].enhanced_feedback.contains("grading"));
}

#[tokio::test]
async fn test_persistence_failure_keeps_grading() {
    let (addr, _) = endpoint(two_question_script().build()).await;
    let orch = orchestrator(addr, Arc::new(InMemoryStore::failing()));

    let result = orch.grade(request()).await.unwrap();
    assert_eq!(result.mode, GradingMode::PersistenceDegraded);
    assert_eq!(result.results.len(), 2);
    assert_eq!(result.statistics.correct_count, 1);
    assert!(result.assessment.is_some());
    assert!(result.degradations[0].reason.contains("failed to save"));
}

#[tokio::test]
async fn test_invalid_image_is_rejected() {
    let (addr, backend) = endpoint(two_question_script().build()).await;
    let orch = orchestrator(addr, Arc::new(InMemoryStore::new()));

    let mut bad = request();
    bad.image = b"not an image".to_vec();
    assert!(matches!(
        orch.grade(bad).await,
        Err(GradeError::InvalidImage(_))
    ));
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_protocol_violation_invalidates_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let welcome = json!({"type": "welcome", "message": "stub", "server_info": {"version": "2.0", "capabilities": []}});
        ws.send(Message::Text(welcome.to_string().into())).await.unwrap();
        while let Some(Ok(frame)) = ws.next().await {
            if let Message::Text(_) = frame {
                let bogus = json!({"jsonrpc": "2.0", "id": 4242, "result": {}});
                let _ = ws.send(Message::Text(bogus.to_string().into())).await;
            }
        }
    });

    let orch = orchestrator(EndpointAddress::new("127.0.0.1", port), Arc::new(InMemoryStore::new()));
    let result = orch.grade(request()).await.unwrap();
    assert_eq!(result.mode, GradingMode::Basic);
    assert!(result.results[0].enhanced_feedback.contains("mismatch"));
    assert_eq!(orch.registry().state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_connection_reused_across_runs() {
    let (addr, backend) = endpoint(two_question_script().build()).await;
    let orch = orchestrator(addr, Arc::new(InMemoryStore::new()));

    let first = orch.grade(request()).await.unwrap();
    let second = orch.grade(request()).await.unwrap();
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(second.mode, GradingMode::AiPowered);
    assert_eq!(backend.call_count("recognize_homework"), 2);
    assert_eq!(orch.registry().state().await, ConnectionState::Open);

    orch.shutdown().await;
    assert_eq!(orch.registry().state().await, ConnectionState::Disconnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_grading_service_worker() {
    let (addr, _) = endpoint(two_question_script().build()).await;
    let service = GradingService::spawn(orchestrator(addr, Arc::new(InMemoryStore::new()))).unwrap();

    let result = service.grade(request()).await.unwrap();
    assert_eq!(result.mode, GradingMode::AiPowered);
    assert_eq!(result.results.len(), 2);

    tokio::task::spawn_blocking(move || service.shutdown())
        .await
        .unwrap();
}

#[test]
fn test_grading_service_blocking() {
    let addr = EndpointAddress::new("127.0.0.1", 9);
    let mut config = client_config();
    config.connect_timeout_secs = 1;
    let orch = Orchestrator::new(
        Arc::new(ConnectionRegistry::new(addr, config)),
        CapabilitySelector::default(),
        Arc::new(Base64Encoder::default()),
        Arc::new(InMemoryStore::new()),
    );
    let service = GradingService::spawn(orch).unwrap();

    let result = service.grade_blocking(request()).unwrap();
    assert_eq!(result.mode, GradingMode::TransportDegraded);
    service.shutdown();
}
