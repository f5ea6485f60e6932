use serde::Serialize;

use crate::content::GenerationRequest;

pub const CONTEXT_BEGIN: &str = "BEGIN_SECTION_CONTEXT_JSON";
pub const CONTEXT_END: &str = "END_SECTION_CONTEXT_JSON";

#[derive(Debug, Clone, Serialize)]
struct PromptContext<'a> {
    course: PromptCourse<'a>,
    section: PromptSection<'a>,
    outline: Vec<PromptOutlineEntry<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    additional_elements: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
struct PromptCourse<'a> {
    title: &'a str,
    target_audience: &'a str,
    difficulty: &'a str,
    tone: &'a str,
    total_duration_minutes: u32,
}

#[derive(Debug, Clone, Serialize)]
struct PromptSection<'a> {
    number: &'a str,
    title: &'a str,
    duration_minutes: u32,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
enum Position {
    Previous,
    Current,
    Next,
    Other,
}

#[derive(Debug, Clone, Serialize)]
struct PromptOutlineEntry<'a> {
    number: &'a str,
    title: &'a str,
    position: Position,
}

/// Builds the single prompt for one section.
///
/// Other sections contribute only their titles so prompt size stays bounded
/// by the outline, never by generated content.
pub fn build_section_prompt(request: &GenerationRequest) -> String {
    let course = &request.course_info;
    let current = request.section.index;

    let context = PromptContext {
        course: PromptCourse {
            title: &course.title,
            target_audience: &course.target_audience,
            difficulty: &course.difficulty,
            tone: &course.tone,
            total_duration_minutes: course.total_duration_minutes,
        },
        section: PromptSection {
            number: &request.section.number,
            title: &request.section.title,
            duration_minutes: request.section_duration_minutes,
        },
        outline: request
            .context_sections
            .iter()
            .map(|s| PromptOutlineEntry {
                number: &s.number,
                title: &s.title,
                position: match s.index {
                    i if i == current => Position::Current,
                    i if i + 1 == current => Position::Previous,
                    i if i == current + 1 => Position::Next,
                    _ => Position::Other,
                },
            })
            .collect(),
        additional_elements: Some(request.additional_elements.trim()).filter(|s| !s.is_empty()),
    };
    let context_json = serde_json::to_value(&context)
        .map(|value| format!("{value:#}"))
        .unwrap_or_default();

    let minutes = request.section_duration_minutes;
    let extra_rule = if context.additional_elements.is_none() {
        String::new()
    } else {
        "- Weave every item of `additional_elements` into the script itself.\n".to_owned()
    };

    format!(
        "You are an expert lecturer and curriculum designer.\n\
\n\
Task: Write the lecture content for ONE section of a course.\n\
\n\
Input:\n\
- A JSON object is provided below.\n\
- `course` describes the whole course; write for its `target_audience`, `difficulty` and `tone`.\n\
- `section` is the section to write, with its allotted `duration_minutes`.\n\
- `outline` lists every section title in order. `position` marks the previous, current and next sections.\n\
\n\
{CONTEXT_BEGIN}\n\
{context_json}\n\
{CONTEXT_END}\n\
\n\
Hard rules:\n\
- Cover ONLY the current section. Refer to the next section in `transition_to_next` (or close the course if there is none).\n\
- Write `script` as natural spoken language, ready to be read aloud.\n\
- The durations of `script_parts` MUST add up to {minutes} minutes.\n\
- Use exactly the part types `intro`, `body`, `summary`, in that order.\n\
- The structured outline is short noun phrases in an indented hierarchy, one item per line.\n\
- Do NOT use Markdown decoration such as `**`.\n\
{extra_rule}\
\n\
Output:\n\
- Output ONLY a single JSON object (no commentary).\n\
- Schema:\n\
  {{\"spoken_script\":{{\"script_parts\":[{{\"part_type\":\"intro\",\"duration\":2,\"script\":\"...\",\"speaker_notes\":[\"...\"],\"visual_aids\":[\"...\"]}}],\"key_phrases\":[\"...\"],\"interaction_points\":[\"...\"],\"transition_to_next\":\"...\"}},\
\"structured_outline\":{{\"kind\":\"text\",\"text\":\"...\"}},\
\"learning_objectives\":[\"...\"],\"key_points\":[\"...\"],\"exercises\":[\"...\"]}}\n",
    )
}
