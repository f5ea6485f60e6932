use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::content::{CourseInfo, GenerationRequest, SectionContent};
use crate::error::GenerationError;
use crate::outline::Section;
use crate::section::SectionGenerator;

pub const DEFAULT_PACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    SectionStarted {
        index: usize,
        total: usize,
        title: String,
    },
    SectionFinished {
        index: usize,
        total: usize,
        model_used: String,
        quality_score: u8,
    },
    RunFinished {
        completed: usize,
        total: usize,
        cancelled: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub sections_total: usize,
    pub sections_completed: usize,
    pub model_sections: usize,
    pub fallback_sections: usize,
    /// Share of completed sections written by the model, 0.0..=1.0.
    pub model_ratio: f64,
    pub average_quality: f64,
    pub coverage_score: f64,
    /// Indexes of sections whose script missed the duration tolerance.
    pub duration_flagged: Vec<usize>,
    pub cancelled: bool,
}

impl QualityReport {
    pub fn from_results(sections_total: usize, results: &[SectionContent], cancelled: bool) -> Self {
        let completed = results.len();
        let fallback_sections = results
            .iter()
            .filter(|r| r.generation_metadata.is_fallback())
            .count();
        let model_sections = completed - fallback_sections;
        let mean = |total: f64| {
            if completed == 0 {
                0.0
            } else {
                total / completed as f64
            }
        };

        Self {
            sections_total,
            sections_completed: completed,
            model_sections,
            fallback_sections,
            model_ratio: mean(model_sections as f64),
            average_quality: mean(
                results
                    .iter()
                    .map(|r| f64::from(r.generation_metadata.quality_score))
                    .sum(),
            ),
            coverage_score: mean(results.iter().map(SectionContent::coverage).sum()),
            duration_flagged: results
                .iter()
                .enumerate()
                .filter(|(_, r)| !r.generation_metadata.duration_within_tolerance)
                .map(|(i, _)| i)
                .collect(),
            cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CourseRun {
    pub results: Vec<SectionContent>,
    pub report: QualityReport,
}

/// Drives the section generator across a parsed outline.
pub struct CourseOrchestrator {
    generator: SectionGenerator,
    pace: Duration,
    additional_elements: String,
    section_minutes: Option<u32>,
    progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl CourseOrchestrator {
    pub fn new(generator: SectionGenerator) -> Self {
        Self {
            generator,
            pace: DEFAULT_PACE,
            additional_elements: String::new(),
            section_minutes: None,
            progress: None,
        }
    }

    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }

    pub fn with_additional_elements(mut self, additional_elements: impl Into<String>) -> Self {
        self.additional_elements = additional_elements.into();
        self
    }

    pub fn with_section_minutes(mut self, minutes: Option<u32>) -> Self {
        self.section_minutes = minutes;
        self
    }

    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Generates every section in outline order.
    ///
    /// Cancellation is honored between sections and during the pacing delay;
    /// an in-flight model call always finishes first.
    pub async fn run_all(
        &self,
        course: &CourseInfo,
        sections: &[Section],
        cancel: &CancellationToken,
    ) -> Result<CourseRun, GenerationError> {
        let course = Arc::new(course.clone());
        let context: Arc<[Section]> = sections.into();
        let total = context.len();
        let mut results = Vec::with_capacity(total);
        let mut cancelled = false;

        tracing::info!(course = %course.title, sections = total, "course run started");

        for (position, section) in context.iter().enumerate() {
            if position > 0 && !self.pace.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.pace) => {}
                }
            }
            if cancel.is_cancelled() {
                tracing::warn!(completed = results.len(), total, "course run cancelled");
                cancelled = true;
                break;
            }

            let content = self
                .generate_section(section, Arc::clone(&course), Arc::clone(&context))
                .await?;
            results.push(content);
        }

        let report = QualityReport::from_results(total, &results, cancelled);
        self.emit(ProgressEvent::RunFinished {
            completed: report.sections_completed,
            total,
            cancelled,
        });
        tracing::info!(
            completed = report.sections_completed,
            fallback_sections = report.fallback_sections,
            average_quality = report.average_quality,
            "course run finished"
        );

        Ok(CourseRun { results, report })
    }

    pub async fn run_one(
        &self,
        course: &CourseInfo,
        sections: &[Section],
        target_index: usize,
    ) -> Result<SectionContent, GenerationError> {
        let Some(section) = sections.get(target_index) else {
            return Err(GenerationError::SectionNotFound {
                index: target_index,
                len: sections.len(),
            });
        };
        self.generate_section(section, Arc::new(course.clone()), sections.into())
            .await
    }

    async fn generate_section(
        &self,
        section: &Section,
        course: Arc<CourseInfo>,
        context: Arc<[Section]>,
    ) -> Result<SectionContent, GenerationError> {
        let total = context.len();
        let mut request = GenerationRequest::new(section.clone(), course, context)
            .with_additional_elements(self.additional_elements.clone());
        if let Some(minutes) = self.section_minutes {
            request = request.with_duration_minutes(minutes);
        }

        self.emit(ProgressEvent::SectionStarted {
            index: section.index,
            total,
            title: section.title.clone(),
        });
        tracing::info!(
            section_index = section.index,
            number = %section.number,
            title = %section.title,
            minutes = request.section_duration_minutes,
            "section started"
        );

        let content = self.generator.generate(&request).await?;

        self.emit(ProgressEvent::SectionFinished {
            index: section.index,
            total,
            model_used: content.generation_metadata.model_used.clone(),
            quality_score: content.generation_metadata.quality_score,
        });
        Ok(content)
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(progress) = &self.progress
            && progress.send(event).is_err()
        {
            tracing::debug!("progress receiver dropped");
        }
    }
}
