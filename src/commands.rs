use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::analysis::{self, LearningPath, StructureReport};
use crate::cli::{CourseArgs, Engine, GenerationArgs, ParseArgs, SectionArgs};
use crate::content::CourseInfo;
use crate::course::{CourseOrchestrator, ProgressEvent};
use crate::gemini::{GeminiApi, GeminiConfig};
use crate::keys::KeyPool;
use crate::model::ModelClient;
use crate::outline::{self, Section};
use crate::section::SectionGenerator;

#[derive(Debug, Serialize)]
struct OutlineReport {
    sections: Vec<Section>,
    structure: StructureReport,
    learning_path: LearningPath,
}

pub fn parse(args: ParseArgs) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(&args.outline)
        .with_context(|| format!("read outline: {}", args.outline))?;
    let sections = outline::parse(&text);
    if sections.is_empty() {
        tracing::warn!(outline = %args.outline, "outline has no sections");
    }

    let course = CourseInfo {
        title: args.title,
        outline_text: text,
        target_audience: CourseInfo::default_target_audience(),
        difficulty: CourseInfo::default_difficulty(),
        total_duration_minutes: args.minutes,
        tone: CourseInfo::default_tone(),
    };
    let report = OutlineReport {
        structure: analysis::validate_structure(&sections, &course.title),
        learning_path: analysis::learning_path(&sections, &course),
        sections,
    };
    tracing::info!(
        sections = report.sections.len(),
        structure_score = report.structure.score,
        "outline parsed"
    );

    emit_json(&report, args.out.as_deref(), args.force)
}

pub async fn section(args: SectionArgs) -> anyhow::Result<()> {
    let (course, sections) = load_course(&args.generation.course)?;
    let generator = build_generator(args.generation.engine)?;
    let orchestrator = orchestrator(generator.clone(), &args.generation);

    let content = orchestrator
        .run_one(&course, &sections, args.index)
        .await
        .with_context(|| format!("generate section {}", args.index))?;
    if args.copy_text {
        eprint!("{}", content.copy_text());
    }
    log_key_statistics(&generator).await;

    emit_json(&content, args.generation.out.as_deref(), args.generation.force)
}

pub async fn course(args: CourseArgs) -> anyhow::Result<()> {
    let (course, sections) = load_course(&args.generation.course)?;
    let generator = build_generator(args.generation.engine)?;

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let orchestrator = orchestrator(generator.clone(), &args.generation)
        .with_pace(Duration::from_millis(args.pace_ms))
        .with_progress(progress_tx);

    let progress = tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            if let ProgressEvent::SectionFinished {
                index,
                total,
                model_used,
                quality_score,
            } = event
            {
                tracing::info!(
                    progress = %format!("{}/{total}", index + 1),
                    model_used = %model_used,
                    quality_score,
                    "section finished"
                );
            }
        }
    });

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; stopping after the current section");
                cancel.cancel();
            }
        })
    };

    let result = orchestrator.run_all(&course, &sections, &cancel).await;
    interrupt.abort();
    drop(orchestrator);
    let _ = progress.await;

    let run = result.context("generate course")?;
    log_key_statistics(&generator).await;

    emit_json(&run, args.generation.out.as_deref(), args.generation.force)
}

fn orchestrator(generator: SectionGenerator, args: &GenerationArgs) -> CourseOrchestrator {
    CourseOrchestrator::new(generator)
        .with_additional_elements(args.extra.clone().unwrap_or_default())
        .with_section_minutes(args.minutes)
}

fn build_generator(engine: Engine) -> anyhow::Result<SectionGenerator> {
    match engine {
        Engine::Offline => Ok(SectionGenerator::offline()),
        Engine::Gemini => {
            let keys = KeyPool::from_env().context("load Gemini API keys")?;
            let config = GeminiConfig::from_env().context("load Gemini config")?;
            tracing::info!(model = %config.model, base_url = %config.base_url, "using Gemini");
            let api = GeminiApi::new(config).context("init Gemini client")?;
            Ok(SectionGenerator::new(ModelClient::new(
                Arc::new(api),
                Arc::new(keys),
            )))
        }
    }
}

async fn log_key_statistics(generator: &SectionGenerator) {
    let Some(client) = generator.client() else {
        return;
    };
    let stats = client.keys().statistics().await;
    tracing::info!(
        total_keys = stats.total_keys,
        available_keys = stats.available_keys,
        success_reports = stats.success_reports,
        failure_reports = stats.failure_reports,
        "key pool statistics"
    );
    for key in &stats.keys {
        tracing::debug!(
            key = %key.key,
            uses = key.uses,
            consecutive_failures = key.consecutive_failures,
            state = ?key.state,
            "key"
        );
    }
}

fn load_course(path: &str) -> anyhow::Result<(CourseInfo, Vec<Section>)> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("read course: {path}"))?;
    let course: CourseInfo = if Path::new(path)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
    {
        serde_json::from_str(&raw).with_context(|| format!("parse course json: {path}"))?
    } else {
        serde_yaml::from_str(&raw).with_context(|| format!("parse course yaml: {path}"))?
    };
    if course.title.trim().is_empty() {
        anyhow::bail!("course title is empty: {path}");
    }

    let sections = outline::parse(&course.outline_text);
    if sections.is_empty() {
        anyhow::bail!("course outline has no sections: {path}");
    }
    Ok((course, sections))
}

fn emit_json<T: Serialize>(value: &T, out: Option<&str>, force: bool) -> anyhow::Result<()> {
    let mut json = serde_json::to_string_pretty(value).context("serialize output")?;
    json.push('\n');
    match out {
        Some(path) => write_output(path, &json, force),
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(json.as_bytes())
                .context("write stdout")?;
            stdout.flush().context("flush stdout")
        }
    }
}

fn write_output(path: &str, contents: &str, force: bool) -> anyhow::Result<()> {
    if Path::new(path).exists() && !force {
        anyhow::bail!("output already exists: {path}");
    }
    if let Some(parent) = Path::new(path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output dir: {}", parent.display()))?;
    }

    let mut options = OpenOptions::new();
    options.write(true);
    if force {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }

    let mut file = options
        .open(path)
        .with_context(|| format!("open output: {path}"))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("write output: {path}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_course_reads_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("course.yaml");
        std::fs::write(&yaml, "title: Rust入門\noutline: |\n  1. 所有権\n  2. 借用\n").unwrap();
        let (course, sections) = load_course(yaml.to_str().unwrap()).unwrap();
        assert_eq!(course.title, "Rust入門");
        assert_eq!(sections.len(), 2);

        let json = dir.path().join("course.JSON");
        std::fs::write(&json, r#"{"title":"t","outline_text":"a\nb\nc","duration":30}"#).unwrap();
        let (course, sections) = load_course(json.to_str().unwrap()).unwrap();
        assert_eq!(course.total_duration_minutes, 30);
        assert_eq!(sections[2].number, "3");
    }

    #[test]
    fn load_course_rejects_empty_outline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("course.yaml");
        std::fs::write(&path, "title: t\noutline: \"\"\n").unwrap();
        let err = load_course(path.to_str().unwrap()).unwrap_err();
        assert!(format!("{err:#}").contains("no sections"));
    }

    #[test]
    fn write_output_refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.json");
        let path = path.to_str().unwrap();

        write_output(path, "one", false).unwrap();
        assert!(write_output(path, "two", false).is_err());
        write_output(path, "three", true).unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "three");
    }
}
