//! Command implementations

use anyhow::{Context, Result};
use mathgrade_shared::{CapabilitySelector, GraderConfig, GradingResult, ToolOutput};
use mathgradectl::image::Base64Encoder;
use mathgradectl::store::JsonFileStore;
use mathgradectl::{ConnectionRegistry, GradingRequest, GradingService, Orchestrator};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

fn registry(config: &GraderConfig) -> Arc<ConnectionRegistry> {
    Arc::new(ConnectionRegistry::new(
        config.endpoint.address(),
        config.client.clone(),
    ))
}

pub async fn grade(
    config: &GraderConfig,
    image: &Path,
    grade_level: String,
    student_name: String,
    homework_id: Option<String>,
    json: bool,
) -> Result<()> {
    let bytes = tokio::fs::read(image)
        .await
        .with_context(|| format!("Failed to read {}", image.display()))?;
    let homework_id = homework_id.unwrap_or_else(|| {
        image
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "homework".to_string())
    });

    let orchestrator = Orchestrator::new(
        registry(config),
        CapabilitySelector::new(config.models.clone()),
        Arc::new(Base64Encoder::default()),
        Arc::new(JsonFileStore::new(config.storage.results_dir.clone())),
    );
    let service = GradingService::spawn(orchestrator)?;
    let result = service
        .grade(GradingRequest {
            homework_id,
            student_name,
            grade_level,
            image: bytes,
        })
        .await?;
    tokio::task::spawn_blocking(move || service.shutdown())
        .await
        .context("Grading worker did not shut down cleanly")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }
    Ok(())
}

fn print_result(result: &GradingResult) {
    let stats = &result.statistics;
    println!("Homework {} - {} ({})", result.homework_id, result.student_name, result.grade_level);
    if result.mode.is_degraded() {
        println!("Mode: {} (not fully graded, please review)", result.mode);
    } else {
        println!("Mode: {}", result.mode);
    }
    for d in &result.degradations {
        println!("  {}: {}", d.mode, d.reason);
    }
    println!(
        "Score: {:.1}/{:.1} ({:.1}%), {} of {} correct ({:.1}%)",
        stats.total_score,
        stats.max_total_score,
        stats.score_percentage,
        stats.correct_count,
        stats.total_questions,
        stats.accuracy_rate
    );
    println!();

    for q in &result.results {
        let mark = if q.is_correct { "✓" } else { "✗" };
        println!("{} {}. {} [{:.1}/{:.1}]", mark, q.ordinal, q.question_text, q.score, q.max_score);
        if !q.student_answer.is_empty() {
            println!("    answer: {}", q.student_answer);
        }
        if !q.is_correct && !q.correct_answer.is_empty() {
            println!("    correct: {}", q.correct_answer);
        }
        if !q.initial_feedback.is_empty() {
            println!("    {}", q.initial_feedback);
        }
    }

    if let Some(assessment) = &result.assessment {
        println!();
        println!("{}", assessment.overall_assessment);
        for s in &assessment.suggestions {
            println!("  - {}", s);
        }
    }

    for set in &result.remedial_problems {
        println!();
        println!("Practice: {}", set.topic);
        for (i, p) in set.problems.iter().enumerate() {
            println!("  {}. {}", i + 1, p.question);
        }
    }

    if result.heuristic_recovery {
        println!();
        println!("(some tool output was recovered from free text)");
    }
    println!();
    println!("Run {} in {:.2}s", result.run_id, result.processing_time);
}

pub async fn tools(config: &GraderConfig) -> Result<()> {
    let registry = registry(config);
    match registry.acquire().await {
        Ok(conn) => {
            match conn.list_capabilities(config.client.call_timeout()).await {
                Ok(tools) => {
                    for tool in tools {
                        println!("{:<28} {}", tool.name, tool.description);
                    }
                }
                Err(e) => eprintln!("tools/list failed: {}", e),
            }
        }
        Err(e) => eprintln!("{}", e),
    }
    registry.close().await;
    Ok(())
}

pub async fn ping(config: &GraderConfig) -> Result<()> {
    let registry = registry(config);
    match registry.acquire().await {
        Ok(conn) => {
            let info = conn.server_info();
            let alive = conn.keepalive(config.client.keepalive_timeout()).await;
            println!(
                "{} protocol {} ({} tools): {}",
                registry.address(),
                info.version,
                info.capabilities.len(),
                if alive { "alive" } else { "no pong" }
            );
        }
        Err(e) => eprintln!("{}", e),
    }
    registry.close().await;
    Ok(())
}

pub async fn call(config: &GraderConfig, tool: &str, args: &str) -> Result<()> {
    let args: Value = serde_json::from_str(args).context("Arguments must be a JSON object")?;
    if !args.is_object() {
        anyhow::bail!("Arguments must be a JSON object");
    }

    let registry = registry(config);
    match registry.acquire().await {
        Ok(conn) => match conn.call(tool, args, config.client.call_timeout()).await {
            Ok(result) => {
                let output = ToolOutput::from_result(result);
                match output.value() {
                    Some(value) => println!("{}", serde_json::to_string_pretty(value)?),
                    None => println!("{}", output.display_text()),
                }
            }
            Err(e) => eprintln!("{} failed: {}", tool, e),
        },
        Err(e) => eprintln!("{}", e),
    }
    registry.close().await;
    Ok(())
}
