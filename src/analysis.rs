//! Heuristic checks over a parsed outline: structure validation and a
//! suggested learning path. Scores are keyword heuristics, not judgments of
//! content.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::content::CourseInfo;
use crate::outline::Section;

const SIMILARITY_THRESHOLD: f64 = 0.7;
const PASSING_SCORE: f64 = 80.0;

const STOP_WORDS: &[&str] = &[
    "の", "に", "は", "を", "が", "と", "で", "から", "まで", "より", "への", "による", "入門",
    "基礎", "応用", "実践",
];
const THEORY_KEYWORDS: &[&str] = &["理論", "概念", "定義", "原理", "基礎知識", "背景", "歴史"];
const PRACTICE_KEYWORDS: &[&str] = &[
    "実践", "演習", "ハンズオン", "プロジェクト", "事例", "ケーススタディ", "実装", "開発",
];
const COMPLEX_KEYWORDS: &[&str] = &["応用", "実装", "開発", "プロジェクト", "統合", "最適化", "デバッグ"];
const SIMPLE_KEYWORDS: &[&str] = &["入門", "基礎", "概要", "紹介", "理解"];

const MAX_KEY_SKILLS: usize = 3;

static WORD: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[ぁ-んァ-ン一-龯a-zA-Z0-9]+").ok());
static SKILL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"[A-Za-z]+(?:\s+[A-Za-z]+)?",
        r"[ぁ-んァ-ン一-龯]{2,}(?:技術|スキル|手法|方法)",
    ]
    .into_iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructureReport {
    pub is_valid: bool,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    pub score: f64,
}

/// Scores overlap, coverage of the course title, ordering and
/// theory/practice balance, weighted 30/30/20/20.
pub fn validate_structure(sections: &[Section], course_title: &str) -> StructureReport {
    let mut issues = Vec::new();
    for (i, a) in sections.iter().enumerate() {
        for b in &sections[i + 1..] {
            if title_similarity(&a.title, &b.title) > SIMILARITY_THRESHOLD {
                issues.push(format!(
                    "セクション{}と{}に内容の重複があります",
                    a.number, b.number
                ));
            }
        }
    }

    let course_keywords = extract_keywords(course_title);
    let covered = sections
        .iter()
        .flat_map(|s| extract_keywords(&s.title))
        .collect::<HashSet<_>>();
    let coverage =
        covered.intersection(&course_keywords).count() as f64 / course_keywords.len().max(1) as f64;

    let flow = logical_flow_score(sections);
    let balance = practical_balance_score(sections);

    let exclusivity = 1.0 - issues.len() as f64 * 0.1;
    let score =
        ((exclusivity * 0.3 + coverage * 0.3 + flow * 0.2 + balance * 0.2) * 100.0).clamp(0.0, 100.0);

    let mut suggestions = Vec::new();
    if score < PASSING_SCORE {
        suggestions.extend(
            [
                "セクション間の重複を減らし、相互排他性を高めてください",
                "講座目標に対する網羅性を向上させてください",
                "学習者にとって自然な順序で構成してください",
                "理論と実践のバランスを調整してください",
            ]
            .map(str::to_owned),
        );
    }

    StructureReport {
        is_valid: issues.is_empty(),
        issues,
        suggestions,
        score,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearningPathItem {
    pub section_id: String,
    pub title: String,
    pub duration_minutes: u32,
    pub complexity: f64,
    pub prerequisites: Vec<String>,
    pub learning_objectives: Vec<String>,
    pub key_skills: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearningPath {
    pub total_sections: usize,
    pub estimated_total_minutes: u32,
    pub path: Vec<LearningPathItem>,
}

pub fn learning_path(sections: &[Section], course: &CourseInfo) -> LearningPath {
    let section_count = u32::try_from(sections.len().max(1)).unwrap_or(u32::MAX);
    let base_minutes = f64::from(course.total_duration_minutes / section_count);

    let path = sections
        .iter()
        .enumerate()
        .map(|(i, section)| {
            let complexity = section_complexity(&section.title);
            LearningPathItem {
                section_id: section.id.clone(),
                title: section.title.clone(),
                duration_minutes: (base_minutes * (0.5 + complexity)) as u32,
                complexity,
                prerequisites: i
                    .checked_sub(1)
                    .map(|prev| vec![sections[prev].id.clone()])
                    .unwrap_or_default(),
                learning_objectives: learning_objectives(&section.title),
                key_skills: key_skills(&section.title),
            }
        })
        .collect::<Vec<_>>();

    LearningPath {
        total_sections: sections.len(),
        estimated_total_minutes: path
            .iter()
            .fold(0u32, |total, p| total.saturating_add(p.duration_minutes)),
        path,
    }
}

/// Two template objectives chosen by keywords in the title.
pub fn learning_objectives(title: &str) -> Vec<String> {
    let (first, second) = if title.contains("入門") || title.contains("基礎") {
        ("の基本概念を理解する", "の重要なポイントを説明できる")
    } else if title.contains("実践") || title.contains("演習") {
        ("を実際に行うことができる", "における問題を解決できる")
    } else if title.contains("応用") {
        ("を実務で活用できる", "の発展的な内容を理解する")
    } else {
        ("について説明できる", "を適切に活用できる")
    };
    vec![format!("{title}{first}"), format!("{title}{second}")]
}

/// Up to three skill terms found in the title: English words (optionally
/// paired) and Japanese terms ending in 技術/スキル/手法/方法.
pub fn key_skills(title: &str) -> Vec<String> {
    let mut skills: Vec<String> = Vec::new();
    for pattern in SKILL_PATTERNS.iter() {
        for found in pattern.find_iter(title) {
            let skill = found.as_str().to_owned();
            if !skills.contains(&skill) {
                skills.push(skill);
            }
        }
    }
    if skills.is_empty() {
        skills.push(format!("{title}に関する知識"));
    }
    skills.truncate(MAX_KEY_SKILLS);
    skills
}

pub fn section_complexity(title: &str) -> f64 {
    let title = title.to_lowercase();
    let mut complexity: f64 = 0.5;
    if COMPLEX_KEYWORDS.iter().any(|k| title.contains(k)) {
        complexity += 0.3;
    }
    if SIMPLE_KEYWORDS.iter().any(|k| title.contains(k)) {
        complexity -= 0.2;
    }
    complexity.clamp(0.1, 1.0)
}

fn extract_keywords(text: &str) -> HashSet<String> {
    let Some(word) = WORD.as_ref() else {
        return HashSet::new();
    };
    word.find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|w| w.chars().count() > 1 && !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

fn title_similarity(a: &str, b: &str) -> f64 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    let words_a = a.split_whitespace().collect::<HashSet<_>>();
    let words_b = b.split_whitespace().collect::<HashSet<_>>();
    if words_a.is_empty() || words_b.is_empty() {
        return 0.0;
    }
    let shared = words_a.intersection(&words_b).count();
    let union = words_a.union(&words_b).count();
    shared as f64 / union as f64
}

fn logical_flow_score(sections: &[Section]) -> f64 {
    let mut score: f64 = 0.8;
    for (i, pair) in sections.windows(2).enumerate() {
        let (title, next) = (&pair[0].title, &pair[1].title);
        if (title.contains("まとめ") || title.contains("総括")) && i + 2 < sections.len() {
            score -= 0.2;
        }
        if (next.contains("入門") || next.contains("基礎"))
            && (title.contains("応用") || title.contains("実践"))
        {
            score -= 0.2;
        }
    }
    score.max(0.0)
}

fn practical_balance_score(sections: &[Section]) -> f64 {
    if sections.is_empty() {
        return 0.0;
    }
    let count = |keywords: &[&str]| {
        sections
            .iter()
            .filter(|s| {
                let title = s.title.to_lowercase();
                keywords.iter().any(|k| title.contains(k))
            })
            .count() as f64
    };
    let total = sections.len() as f64;
    let theory = count(THEORY_KEYWORDS) / total;
    let practice = count(PRACTICE_KEYWORDS) / total;
    (1.0 - ((theory - 0.4).abs() + (practice - 0.6).abs()) / 2.0).max(0.0)
}
