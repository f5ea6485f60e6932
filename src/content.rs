use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::outline::Section;

pub const MIN_SECTION_MINUTES: u32 = 5;
/// Scripted minutes may differ from the requested minutes by this fraction
/// before the section is flagged.
pub const DURATION_TOLERANCE: f64 = 0.2;
pub const FALLBACK_MODEL: &str = "fallback";
pub const FALLBACK_QUALITY_SCORE: u8 = 30;
/// Floor for model-written content so it always ranks above a fallback.
pub const MIN_MODEL_QUALITY_SCORE: u8 = FALLBACK_QUALITY_SCORE + 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseInfo {
    pub title: String,
    #[serde(default, alias = "outline")]
    pub outline_text: String,
    #[serde(default = "CourseInfo::default_target_audience")]
    pub target_audience: String,
    #[serde(default = "CourseInfo::default_difficulty")]
    pub difficulty: String,
    #[serde(default = "CourseInfo::default_total_duration_minutes", alias = "duration")]
    pub total_duration_minutes: u32,
    #[serde(default = "CourseInfo::default_tone")]
    pub tone: String,
}

impl CourseInfo {
    pub fn default_target_audience() -> String {
        "初心者".to_owned()
    }
    pub fn default_difficulty() -> String {
        "中級".to_owned()
    }
    pub fn default_total_duration_minutes() -> u32 {
        60
    }
    pub fn default_tone() -> String {
        "通常".to_owned()
    }

    /// Even share of the course duration, never below five minutes.
    pub fn section_minutes(&self, section_count: usize) -> u32 {
        let count = u32::try_from(section_count.max(1)).unwrap_or(u32::MAX);
        (self.total_duration_minutes / count).max(MIN_SECTION_MINUTES)
    }
}

/// Unit of work for the section generator.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub section: Section,
    pub course_info: Arc<CourseInfo>,
    /// The whole parsed outline, shared unchanged by every request of a run.
    pub context_sections: Arc<[Section]>,
    pub additional_elements: String,
    pub section_duration_minutes: u32,
}

impl GenerationRequest {
    pub fn new(
        section: Section,
        course_info: Arc<CourseInfo>,
        context_sections: Arc<[Section]>,
    ) -> Self {
        let section_duration_minutes = course_info.section_minutes(context_sections.len());
        Self {
            section,
            course_info,
            context_sections,
            additional_elements: String::new(),
            section_duration_minutes,
        }
    }

    pub fn with_additional_elements(mut self, additional_elements: impl Into<String>) -> Self {
        self.additional_elements = additional_elements.into();
        self
    }

    pub fn with_duration_minutes(mut self, minutes: u32) -> Self {
        self.section_duration_minutes = minutes.max(1);
        self
    }

    pub fn previous_section(&self) -> Option<&Section> {
        let index = self.section.index.checked_sub(1)?;
        self.context_sections.get(index)
    }

    pub fn next_section(&self) -> Option<&Section> {
        self.context_sections.get(self.section.index + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartType {
    #[serde(alias = "導入")]
    Intro,
    #[serde(alias = "本編")]
    Body,
    #[serde(alias = "まとめ")]
    Summary,
}

impl PartType {
    pub fn label(self) -> &'static str {
        match self {
            Self::Intro => "導入",
            Self::Body => "本編",
            Self::Summary => "まとめ",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptPart {
    pub part_type: PartType,
    #[serde(alias = "duration")]
    pub duration_minutes: f64,
    pub script: String,
    #[serde(default)]
    pub speaker_notes: Vec<String>,
    #[serde(default)]
    pub visual_aids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpokenScript {
    #[serde(alias = "script_parts")]
    pub parts: Vec<ScriptPart>,
    #[serde(default)]
    pub key_phrases: Vec<String>,
    #[serde(default)]
    pub interaction_points: Vec<String>,
    #[serde(default)]
    pub transition_to_next: String,
}

impl SpokenScript {
    pub fn total_minutes(&self) -> f64 {
        self.parts.iter().map(|p| p.duration_minutes).sum()
    }

    pub fn has_all_part_types(&self) -> bool {
        [PartType::Intro, PartType::Body, PartType::Summary]
            .iter()
            .all(|ty| self.parts.iter().any(|p| p.part_type == *ty))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetadata {
    pub generated_at: DateTime<Utc>,
    pub model_used: String,
    pub quality_score: u8,
    pub requested_minutes: u32,
    pub scripted_minutes: f64,
    pub duration_within_tolerance: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

impl GenerationMetadata {
    pub fn is_fallback(&self) -> bool {
        self.model_used == FALLBACK_MODEL
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionContent {
    pub section_id: String,
    pub section_number: String,
    pub section_title: String,
    pub spoken_script: SpokenScript,
    /// Self-contained, copyable hierarchical text.
    pub structured_outline: String,
    pub learning_objectives: Vec<String>,
    pub key_points: Vec<String>,
    pub exercises: Vec<String>,
    pub generation_metadata: GenerationMetadata,
}

impl SectionContent {
    /// Fraction of the required teaching fields that are present.
    /// Template fields of fallback content do not count.
    pub fn coverage(&self) -> f64 {
        if self.generation_metadata.is_fallback() {
            return 0.0;
        }
        let present = [
            &self.learning_objectives,
            &self.key_points,
            &self.exercises,
        ]
        .iter()
        .filter(|items| !items.is_empty())
        .count();
        present as f64 / 3.0
    }

    /// Single text block for pasting into slides or notes.
    pub fn copy_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{} {}", self.section_number, self.section_title);
        out.push('\n');
        out.push_str(self.structured_outline.trim_end());
        out.push_str("\n\n");
        for part in &self.spoken_script.parts {
            let _ = writeln!(
                out,
                "[{}] {}分",
                part.part_type.label(),
                format_minutes(part.duration_minutes)
            );
            out.push_str(part.script.trim_end());
            out.push_str("\n\n");
        }
        if !self.spoken_script.transition_to_next.is_empty() {
            out.push_str(self.spoken_script.transition_to_next.trim_end());
            out.push('\n');
        }
        out.trim_end().to_owned() + "\n"
    }
}

pub fn within_tolerance(scripted_minutes: f64, requested_minutes: u32) -> bool {
    let requested = f64::from(requested_minutes);
    (scripted_minutes - requested).abs() <= requested * DURATION_TOLERANCE
}

/// Weighted completeness of model-written content, `MIN_MODEL_QUALITY_SCORE..=100`.
///
/// Objectives 25, key points 20, exercises 20, intro/body/summary present 20,
/// outline text 10, speaker notes on every part 5.
pub fn quality_score(
    script: &SpokenScript,
    structured_outline: &str,
    learning_objectives: &[String],
    key_points: &[String],
    exercises: &[String],
) -> u8 {
    let mut score = 0u8;
    if !learning_objectives.is_empty() {
        score += 25;
    }
    if !key_points.is_empty() {
        score += 20;
    }
    if !exercises.is_empty() {
        score += 20;
    }
    if script.has_all_part_types() {
        score += 20;
    }
    if !structured_outline.trim().is_empty() {
        score += 10;
    }
    if !script.parts.is_empty() && script.parts.iter().all(|p| !p.speaker_notes.is_empty()) {
        score += 5;
    }
    score.max(MIN_MODEL_QUALITY_SCORE)
}

fn format_minutes(minutes: f64) -> String {
    if minutes.fract() == 0.0 {
        format!("{minutes:.0}")
    } else {
        format!("{minutes:.1}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(part_type: PartType, minutes: f64, notes: &[&str]) -> ScriptPart {
        ScriptPart {
            part_type,
            duration_minutes: minutes,
            script: format!("{part_type:?} script"),
            speaker_notes: notes.iter().map(|n| (*n).to_owned()).collect(),
            visual_aids: Vec::new(),
        }
    }

    fn full_script() -> SpokenScript {
        SpokenScript {
            parts: vec![
                part(PartType::Intro, 2.0, &["smile"]),
                part(PartType::Body, 15.0, &["slow down"]),
                part(PartType::Summary, 3.0, &["recap"]),
            ],
            key_phrases: Vec::new(),
            interaction_points: Vec::new(),
            transition_to_next: String::new(),
        }
    }

    #[test]
    fn course_info_defaults_apply_when_fields_missing() {
        let info: CourseInfo = serde_yaml::from_str("title: Rust入門\noutline: |\n  1. A\n").unwrap();
        assert_eq!(info.outline_text, "1. A\n");
        assert_eq!(info.target_audience, "初心者");
        assert_eq!(info.difficulty, "中級");
        assert_eq!(info.total_duration_minutes, 60);
        assert_eq!(info.tone, "通常");
    }

    #[test]
    fn section_minutes_has_a_floor() {
        let mut info: CourseInfo = serde_json::from_str(r#"{"title":"t"}"#).unwrap();
        assert_eq!(info.section_minutes(3), 20);
        assert_eq!(info.section_minutes(0), 60);
        info.total_duration_minutes = 30;
        assert_eq!(info.section_minutes(10), MIN_SECTION_MINUTES);
    }

    #[test]
    fn part_type_accepts_japanese_labels() {
        let part: ScriptPart = serde_json::from_str(
            r#"{"part_type":"まとめ","duration":3,"script":"以上です"}"#,
        )
        .unwrap();
        assert_eq!(part.part_type, PartType::Summary);
        assert_eq!(part.duration_minutes, 3.0);
        assert!(part.speaker_notes.is_empty());

        let err = serde_json::from_str::<ScriptPart>(
            r#"{"part_type":"outro","duration":3,"script":"bye"}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn tolerance_is_twenty_percent_either_way() {
        assert!(within_tolerance(20.0, 20));
        assert!(within_tolerance(24.0, 20));
        assert!(within_tolerance(16.0, 20));
        assert!(!within_tolerance(24.5, 20));
        assert!(!within_tolerance(15.0, 20));
    }

    #[test]
    fn quality_score_weights_fields() {
        let script = full_script();
        let items = vec!["x".to_owned()];
        assert_eq!(quality_score(&script, "outline", &items, &items, &items), 100);
        assert_eq!(quality_score(&script, "outline", &[], &items, &items), 75);

        let mut partial = full_script();
        partial.parts.retain(|p| p.part_type != PartType::Summary);
        partial.parts[0].speaker_notes.clear();
        assert_eq!(quality_score(&partial, "", &[], &[], &[]), MIN_MODEL_QUALITY_SCORE);

        let mut intro_only = full_script();
        intro_only.parts.truncate(1);
        intro_only.parts[0].speaker_notes.clear();
        let minimal = quality_score(&intro_only, "x", &[], &[], &[]);
        assert!(minimal > FALLBACK_QUALITY_SCORE);
    }

    #[test]
    fn copy_text_is_one_block() {
        let content = SectionContent {
            section_id: "section_1".to_owned(),
            section_number: "1-1".to_owned(),
            section_title: "Intro".to_owned(),
            spoken_script: full_script(),
            structured_outline: "講義の目的\n  基礎を押さえる".to_owned(),
            learning_objectives: vec!["a".to_owned()],
            key_points: Vec::new(),
            exercises: Vec::new(),
            generation_metadata: GenerationMetadata {
                generated_at: Utc::now(),
                model_used: "m".to_owned(),
                quality_score: 50,
                requested_minutes: 20,
                scripted_minutes: 20.0,
                duration_within_tolerance: true,
                fallback_reason: None,
            },
        };
        let text = content.copy_text();
        assert!(text.starts_with("1-1 Intro\n\n講義の目的\n"));
        assert!(text.contains("[本編] 15分\nBody script"));
        assert!(text.ends_with("Summary script\n"));
        assert!((content.coverage() - 1.0 / 3.0).abs() < f64::EPSILON);
    }
}
