use std::collections::HashSet;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::core::config::Settings;
use crate::db::types::AnnotationKind;
use crate::store::RubricSnapshot;

const GRADING_SYSTEM_PROMPT: &str = r#"You are an experienced writing teacher grading a student essay against a rubric.

For every rubric criterion choose exactly one of its listed levels, using the level id given in the rubric. Write short, specific feedback for each criterion addressed to the student.

You may also mark passages of the essay. Offsets are character positions in the essay text, start inclusive and end exclusive. Use "highlight" for strong passages, "strikethrough" for text that should be removed and "comment" for a remark attached to a passage (a comment is required for this kind).

Respond with strict JSON:
{
  "scores": [
    {"criterion_id": "<criterion id>", "level_id": "<level id>", "feedback": "<feedback>"}
  ],
  "annotations": [
    {"kind": "highlight|strikethrough|comment", "start": <int>, "end": <int>, "comment": "<text or null>"}
  ]
}
"#;

#[derive(Debug, Clone, Copy)]
pub(crate) struct GradingRequest<'a> {
    pub(crate) essay_id: Uuid,
    pub(crate) essay_text: &'a str,
    pub(crate) rubric: &'a RubricSnapshot,
    pub(crate) prompt: &'a str,
    pub(crate) source_text: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LevelSelection {
    pub(crate) criterion_id: Uuid,
    pub(crate) level_id: Uuid,
    pub(crate) feedback: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AnnotationDraft {
    pub(crate) kind: AnnotationKind,
    pub(crate) start_offset: i32,
    pub(crate) end_offset: i32,
    pub(crate) comment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct GraderOutput {
    pub(crate) scores: Vec<LevelSelection>,
    pub(crate) annotations: Vec<AnnotationDraft>,
}

#[derive(Debug, Error)]
pub(crate) enum GraderError {
    #[error("grader call failed: {0}")]
    Failed(String),
    #[error("grader timed out")]
    Timeout,
    #[error("grader response breaks the rubric contract: {0}")]
    ContractViolation(String),
}

/// Opaque scoring function: essay text plus rubric in, one level per criterion out.
#[async_trait]
pub(crate) trait EssayGrader: Send + Sync {
    async fn score(&self, request: GradingRequest<'_>) -> Result<GraderOutput, GraderError>;
}

/// Character-offset span check shared by AI output and teacher edits.
pub(crate) fn validate_span(
    kind: AnnotationKind,
    start_offset: i32,
    end_offset: i32,
    comment: Option<&str>,
    text_len: usize,
) -> Result<(), String> {
    if start_offset < 0 || end_offset <= start_offset {
        return Err(format!("invalid span [{start_offset}, {end_offset})"));
    }
    if end_offset as usize > text_len {
        return Err(format!("span end {end_offset} exceeds text length {text_len}"));
    }
    if kind == AnnotationKind::Comment && comment.map(str::trim).unwrap_or_default().is_empty() {
        return Err("comment annotations need comment text".to_string());
    }
    Ok(())
}

/// Checks the grader picked exactly one declared level for every criterion and that every
/// annotation span fits the essay. Any breach is reported, never corrected.
pub(crate) fn validate_output(
    rubric: &RubricSnapshot,
    output: &GraderOutput,
    text_len: usize,
) -> Result<(), String> {
    let mut seen = HashSet::new();
    for selection in &output.scores {
        let criterion = rubric
            .criterion(selection.criterion_id)
            .ok_or_else(|| format!("unknown criterion {}", selection.criterion_id))?;

        if !seen.insert(selection.criterion_id) {
            return Err(format!("criterion {} scored more than once", selection.criterion_id));
        }

        if criterion.level(selection.level_id).is_none() {
            return Err(format!(
                "level {} is not declared for criterion '{}'",
                selection.level_id, criterion.criterion.name
            ));
        }
    }

    if let Some(missing) = rubric.criteria.iter().find(|entry| !seen.contains(&entry.criterion.id))
    {
        return Err(format!("criterion '{}' was not scored", missing.criterion.name));
    }

    for annotation in &output.annotations {
        validate_span(
            annotation.kind,
            annotation.start_offset,
            annotation.end_offset,
            annotation.comment.as_deref(),
            text_len,
        )?;
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
struct RawOutput {
    #[serde(default)]
    scores: Vec<RawScore>,
    #[serde(default)]
    annotations: Vec<RawAnnotation>,
}

#[derive(Debug, Deserialize)]
struct RawScore {
    criterion_id: String,
    level_id: String,
    #[serde(default)]
    feedback: String,
}

#[derive(Debug, Deserialize)]
struct RawAnnotation {
    kind: AnnotationKind,
    start: i32,
    end: i32,
    #[serde(default)]
    comment: Option<String>,
}

fn parse_uuid(raw: &str, what: &str) -> Result<Uuid, GraderError> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| GraderError::ContractViolation(format!("{what} '{raw}' is not a declared id")))
}

fn parse_output(content: &str) -> Result<GraderOutput, GraderError> {
    let raw: RawOutput = serde_json::from_str(content)
        .map_err(|err| GraderError::Failed(format!("unparseable grader JSON: {err}")))?;

    let scores = raw
        .scores
        .into_iter()
        .map(|score| {
            Ok(LevelSelection {
                criterion_id: parse_uuid(&score.criterion_id, "criterion")?,
                level_id: parse_uuid(&score.level_id, "level")?,
                feedback: score.feedback.trim().to_string(),
            })
        })
        .collect::<Result<Vec<_>, GraderError>>()?;

    let annotations = raw
        .annotations
        .into_iter()
        .map(|annotation| AnnotationDraft {
            kind: annotation.kind,
            start_offset: annotation.start,
            end_offset: annotation.end,
            comment: annotation.comment.filter(|comment| !comment.trim().is_empty()),
        })
        .collect();

    Ok(GraderOutput { scores, annotations })
}

fn rubric_payload(rubric: &RubricSnapshot) -> Value {
    json!({
        "title": rubric.rubric.title,
        "criteria": rubric.criteria.iter().map(|entry| json!({
            "criterion_id": entry.criterion.id,
            "name": entry.criterion.name,
            "levels": entry.levels.iter().map(|level| json!({
                "level_id": level.id,
                "score": level.score,
                "descriptor": level.descriptor,
            })).collect::<Vec<_>>(),
        })).collect::<Vec<_>>(),
    })
}

/// OpenAI-compatible chat-completions grader in JSON mode.
#[derive(Debug, Clone)]
pub(crate) struct OpenAiEssayGrader {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f64,
}

impl OpenAiEssayGrader {
    pub(crate) fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let grader = settings.grader();
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(settings.grading().grader_timeout())
            .build()
            .context("Failed to build grader HTTP client")?;

        Ok(Self {
            client,
            api_key: grader.api_key.clone(),
            base_url: grader.base_url.trim_end_matches('/').to_string(),
            model: grader.model.clone(),
            max_tokens: grader.max_tokens,
            temperature: grader.temperature,
        })
    }
}

#[async_trait]
impl EssayGrader for OpenAiEssayGrader {
    async fn score(&self, request: GradingRequest<'_>) -> Result<GraderOutput, GraderError> {
        let timer = Instant::now();

        let user_prompt = format!(
            "Assignment prompt:\n{}\n\nSource text:\n{}\n\nRubric:\n{}\n\nEssay:\n{}\n",
            request.prompt,
            request.source_text.unwrap_or("(none)"),
            serde_json::to_string_pretty(&rubric_payload(request.rubric)).unwrap_or_default(),
            request.essay_text,
        );

        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": GRADING_SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt}
            ],
            "max_completion_tokens": self.max_tokens,
            "temperature": self.temperature,
            "response_format": {"type": "json_object"}
        });

        tracing::info!(essay_id = %request.essay_id, model = %self.model, "Sending grading request");

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    GraderError::Timeout
                } else {
                    GraderError::Failed(format!("failed to call grader API: {err}"))
                }
            })?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(GraderError::Failed(format!("grader API error (status {status}): {body}")));
        }

        let content = body
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| GraderError::Failed("missing grader response content".to_string()))?;

        let output = parse_output(content)?;

        let tokens_used =
            body.get("usage").and_then(|usage| usage.get("total_tokens")).and_then(Value::as_u64);
        tracing::info!(
            essay_id = %request.essay_id,
            duration_seconds = timer.elapsed().as_secs_f64(),
            tokens_used = tokens_used,
            "Grading response received"
        );

        Ok(output)
    }
}
