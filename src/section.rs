use chrono::Utc;
use serde::Deserialize;

use crate::analysis;
use crate::content::{
    self, FALLBACK_MODEL, FALLBACK_QUALITY_SCORE, GenerationMetadata, GenerationRequest, PartType,
    ScriptPart, SectionContent, SpokenScript,
};
use crate::error::{GenerationError, ModelError};
use crate::model::ModelClient;
use crate::prompt;

/// Generates the content of one section, falling back to a local template
/// when the model cannot produce a usable answer.
#[derive(Clone)]
pub struct SectionGenerator {
    client: Option<ModelClient>,
}

impl SectionGenerator {
    pub fn new(client: ModelClient) -> Self {
        Self {
            client: Some(client),
        }
    }

    /// Generator that never calls a model; every section gets fallback content.
    pub fn offline() -> Self {
        Self { client: None }
    }

    pub fn client(&self) -> Option<&ModelClient> {
        self.client.as_ref()
    }

    /// Only `PoolExhausted` is returned as an error. Exhausted retries and
    /// malformed model output become fallback content.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<SectionContent, GenerationError> {
        let Some(client) = &self.client else {
            return Ok(fallback_content(request, "offline engine"));
        };

        let prompt = prompt::build_section_prompt(request);
        tracing::debug!(
            section_index = request.section.index,
            prompt_chars = prompt.chars().count(),
            "generate section"
        );

        let outcome = match client.generate(&prompt).await {
            Ok(raw) => parse_response(&raw.text)
                .map(|response| (response, raw.model))
                .map_err(GenerationError::from),
            Err(err) => Err(err),
        };

        match outcome {
            Ok((response, model)) => Ok(content_from_response(request, response, model)),
            Err(err) if err.is_recoverable() => {
                tracing::warn!(
                    section_index = request.section.index,
                    section_title = %request.section.title,
                    error = %err,
                    "section generation failed; using fallback content"
                );
                Ok(fallback_content(request, &err.to_string()))
            }
            Err(err) => Err(err),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct LectureResponse {
    spoken_script: SpokenScript,
    structured_outline: OutlineArtifact,
    #[serde(default)]
    learning_objectives: Vec<String>,
    #[serde(default)]
    key_points: Vec<String>,
    #[serde(default)]
    exercises: Vec<String>,
}

/// Outline shapes the model may return. Anything else is rejected.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum OutlineArtifact {
    Text { text: String },
    /// Older prompt versions asked for a node tree.
    Mindmap { root: MindmapNode },
}

#[derive(Debug, Clone, Deserialize)]
struct MindmapNode {
    label: String,
    #[serde(default)]
    children: Vec<MindmapNode>,
}

impl OutlineArtifact {
    fn render(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::Mindmap { root } => {
                let mut out = String::new();
                render_node(root, 0, &mut out);
                out
            }
        }
    }
}

fn render_node(node: &MindmapNode, depth: usize, out: &mut String) {
    let label = node.label.trim();
    if !label.is_empty() {
        out.push_str(&"  ".repeat(depth));
        out.push_str(label);
        out.push('\n');
    }
    for child in &node.children {
        render_node(child, depth + 1, out);
    }
}

fn parse_response(text: &str) -> Result<LectureResponse, ModelError> {
    let json = extract_json_object(text)?;
    let mut response: LectureResponse = serde_json::from_str(json)
        .map_err(|err| ModelError::Malformed(format!("parse lecture json: {err}")))?;

    let script = &mut response.spoken_script;
    if script.parts.is_empty() {
        return Err(ModelError::Malformed("spoken_script has no parts".to_owned()));
    }
    for part in &mut script.parts {
        part.script = strip_decoration(&part.script);
        if part.script.is_empty() {
            return Err(ModelError::Malformed(format!(
                "{:?} part has an empty script",
                part.part_type
            )));
        }
        if !part.duration_minutes.is_finite() || part.duration_minutes < 0.0 {
            return Err(ModelError::Malformed(format!(
                "{:?} part has invalid duration {}",
                part.part_type, part.duration_minutes
            )));
        }
        clean_items(&mut part.speaker_notes);
        clean_items(&mut part.visual_aids);
    }
    clean_items(&mut script.key_phrases);
    clean_items(&mut script.interaction_points);
    script.transition_to_next = strip_decoration(&script.transition_to_next);

    clean_items(&mut response.learning_objectives);
    clean_items(&mut response.key_points);
    clean_items(&mut response.exercises);
    Ok(response)
}

fn extract_json_object(text: &str) -> Result<&str, ModelError> {
    let start = text
        .find('{')
        .ok_or_else(|| ModelError::Malformed("missing `{` in model output".to_owned()))?;
    let end = text
        .rfind('}')
        .ok_or_else(|| ModelError::Malformed("missing `}` in model output".to_owned()))?;
    if end <= start {
        return Err(ModelError::Malformed("invalid json object span".to_owned()));
    }
    Ok(&text[start..=end])
}

fn strip_decoration(text: &str) -> String {
    text.replace("**", "").trim().to_owned()
}

fn clean_items(items: &mut Vec<String>) {
    *items = items
        .iter()
        .map(|item| strip_decoration(item))
        .filter(|item| !item.is_empty())
        .collect();
}

fn content_from_response(
    request: &GenerationRequest,
    response: LectureResponse,
    model: String,
) -> SectionContent {
    let structured_outline = strip_outline_decoration(&response.structured_outline.render());
    let requested = request.section_duration_minutes;
    let scripted = response.spoken_script.total_minutes();
    let within = content::within_tolerance(scripted, requested);
    if !within {
        tracing::warn!(
            section_index = request.section.index,
            requested_minutes = requested,
            scripted_minutes = scripted,
            "script duration outside tolerance"
        );
    }

    let quality_score = content::quality_score(
        &response.spoken_script,
        &structured_outline,
        &response.learning_objectives,
        &response.key_points,
        &response.exercises,
    );

    tracing::info!(
        section_index = request.section.index,
        model_used = %model,
        quality_score,
        "section generated"
    );

    SectionContent {
        section_id: request.section.id.clone(),
        section_number: request.section.number.clone(),
        section_title: request.section.title.clone(),
        spoken_script: response.spoken_script,
        structured_outline,
        learning_objectives: response.learning_objectives,
        key_points: response.key_points,
        exercises: response.exercises,
        generation_metadata: GenerationMetadata {
            generated_at: Utc::now(),
            model_used: model,
            quality_score,
            requested_minutes: requested,
            scripted_minutes: scripted,
            duration_within_tolerance: within,
            fallback_reason: None,
        },
    }
}

// Keeps indentation, which carries the outline hierarchy.
fn strip_outline_decoration(text: &str) -> String {
    text.replace("**", "")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim_matches('\n')
        .to_owned()
}

/// Deterministic placeholder built from the section title alone; only the
/// part durations follow the requested minutes.
pub fn fallback_content(request: &GenerationRequest, reason: &str) -> SectionContent {
    let title = request.section.title.as_str();
    let minutes = f64::from(request.section_duration_minutes);
    let share = |fraction: f64| (minutes * fraction * 10.0).round() / 10.0;
    let intro = share(0.2);
    let summary = share(0.2);
    let body = ((minutes - intro - summary) * 10.0).round() / 10.0;

    let part = |part_type, duration_minutes, script: String, note: &str| ScriptPart {
        part_type,
        duration_minutes,
        script,
        speaker_notes: vec![note.to_owned()],
        visual_aids: vec![format!("{title}の要点スライド")],
    };

    let spoken_script = SpokenScript {
        parts: vec![
            part(
                PartType::Intro,
                intro,
                format!(
                    "それでは「{title}」について学んでいきましょう。このセクションでは、{title}の全体像と押さえるべきポイントを順番に確認します。"
                ),
                "受講者の前提知識を確認する",
            ),
            part(
                PartType::Body,
                body,
                format!(
                    "まず、{title}とは何かを整理します。次に、{title}がなぜ重要なのかを確認し、具体的な進め方をステップごとに見ていきます。最後に、実務で{title}を活かすときの注意点を押さえます。"
                ),
                "ステップごとに区切って説明する",
            ),
            part(
                PartType::Summary,
                summary,
                format!(
                    "ここまで{title}の要点を確認しました。学んだ内容を振り返り、次の行動につなげていきましょう。"
                ),
                "要点を3つに絞って復習する",
            ),
        ],
        key_phrases: vec![title.to_owned()],
        interaction_points: vec![format!("{title}について知っていることを質問する")],
        transition_to_next: String::new(),
    };

    let structured_outline = format!(
        "講義の目的\n\
\x20 {title}の要点を理解し、実務で活用できる状態になる\n\
{title}とは\n\
\x20 {title}の定義と位置づけ\n\
{title}の重要性\n\
\x20 ・学習の土台となる理由\n\
\x20 ・実務での効果\n\
\x20 ・見落とした場合の影響\n\
{title}の全体像\n\
\x20 構成要素と各要素の役割\n\
{title}の具体的な解説\n\
\x20 STEP1 現状の整理\n\
\x20 STEP2 手順の実践\n\
\x20 STEP3 振り返りと改善\n\
{title}の補足\n\
\x20 最も重要なポイントの再確認\n\
{title}の課題\n\
\x20 講義後に取り組むアクションプラン"
    );

    let scripted_minutes = spoken_script.total_minutes();
    SectionContent {
        section_id: request.section.id.clone(),
        section_number: request.section.number.clone(),
        section_title: title.to_owned(),
        spoken_script,
        structured_outline,
        learning_objectives: analysis::learning_objectives(title),
        key_points: vec![
            format!("{title}の定義"),
            format!("{title}の重要性"),
            format!("{title}の進め方"),
        ],
        exercises: vec![format!("{title}を自分の業務に当てはめて整理する")],
        generation_metadata: GenerationMetadata {
            generated_at: Utc::now(),
            model_used: FALLBACK_MODEL.to_owned(),
            quality_score: FALLBACK_QUALITY_SCORE,
            requested_minutes: request.section_duration_minutes,
            scripted_minutes,
            duration_within_tolerance: content::within_tolerance(
                scripted_minutes,
                request.section_duration_minutes,
            ),
            fallback_reason: Some(reason.to_owned()),
        },
    }
}
