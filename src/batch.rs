//! Batch question answering over CSV.
//!
//! Reads `id,question` rows and writes `id,answer,documents` rows, one per
//! input row and in input order. `documents` lists the sources the answer
//! was built from, joined by `"; "`. A row whose question cannot be
//! answered is logged, counted in [`BatchSummary::failed`] and written with
//! empty `answer` and `documents` so ids stay aligned.

use std::io::{Read, Write};
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::Engine;
use crate::models::ChatMessage;

#[derive(Debug, Deserialize)]
struct QuestionRow {
    id: String,
    question: String,
}

#[derive(Debug, Serialize)]
struct AnswerRow<'a> {
    id: &'a str,
    answer: &'a str,
    documents: String,
}

#[derive(Debug, Default, Serialize)]
pub struct BatchSummary {
    pub questions: usize,
    pub answered: usize,
    /// `(id, error)` for rows that could not be answered.
    pub failed: Vec<(String, String)>,
    pub elapsed_secs: f64,
}

/// Answer every question in `input` and write the results to `output`.
pub async fn run_batch<R: Read, W: Write>(engine: &Engine, input: R, output: W) -> Result<BatchSummary> {
    let started = Instant::now();
    let mut reader = csv::Reader::from_reader(input);
    let mut writer = csv::Writer::from_writer(output);
    let mut summary = BatchSummary::default();

    for (line, row) in reader.deserialize::<QuestionRow>().enumerate() {
        let row = row.with_context(|| format!("Invalid input row {}", line + 1))?;
        summary.questions += 1;

        let (answer, documents) = match engine.answer(&[ChatMessage::new("user", row.question.as_str())]).await {
            Ok(answer) => {
                summary.answered += 1;
                (answer.answer.unwrap_or_default(), answer.files_used.join("; "))
            }
            Err(e) => {
                tracing::warn!(id = %row.id, error = %e, "question failed");
                summary.failed.push((row.id.clone(), e.to_string()));
                (String::new(), String::new())
            }
        };
        writer.serialize(AnswerRow {
            id: &row.id,
            answer: &answer,
            documents,
        })?;
    }
    writer.flush()?;

    summary.elapsed_secs = started.elapsed().as_secs_f64();
    tracing::info!(
        questions = summary.questions,
        answered = summary.answered,
        failed = summary.failed.len(),
        "batch finished"
    );
    Ok(summary)
}

/// [`run_batch`] between two files. `output` is created or truncated.
pub async fn run_batch_files(engine: &Engine, input: &Path, output: &Path) -> Result<BatchSummary> {
    let reader = std::fs::File::open(input).with_context(|| format!("Failed to open {}", input.display()))?;
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let writer = std::fs::File::create(output).with_context(|| format!("Failed to create {}", output.display()))?;
    run_batch(engine, reader, writer).await
}
