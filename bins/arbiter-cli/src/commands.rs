// CLI commands for managing Arbiter
use anyhow::{bail, Context, Result};
use arbiter_common::config::{PipelineConfig, StoreBackend};
use arbiter_common::types::{EvaluationView, Language, VerdictSummary};
use arbiter_pipeline::language::{LanguageConfig, LanguageRegistry, LanguagesFile};
use arbiter_pipeline::memory::{MemoryCatalog, MemoryEventSink, MemoryStore, QuestionsFile};
use arbiter_pipeline::sandbox::DockerSandbox;
use arbiter_pipeline::{Backends, EvaluateRequest, EvaluationService};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Language entry as given on the command line
pub struct NewLanguage {
    pub name: String,
    pub version: String,
    pub image: Option<String>,
    pub source_file: String,
    pub compile_command: Option<String>,
    pub run_command: String,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
}

fn load_languages(path: &Path) -> Result<LanguagesFile> {
    if !path.exists() {
        return Ok(LanguagesFile::default());
    }
    LanguagesFile::read(path)
}

/// Add a language to the allow-list file
pub fn add_language(config_path: &Path, new: NewLanguage) -> Result<()> {
    println!("🚀 Adding language: {}", new.name);

    let language: Language = new
        .name
        .parse()
        .map_err(|e: String| anyhow::anyhow!("{}; supported: python, java, rust, javascript", e))?;
    if new.source_file.trim().is_empty() || new.run_command.trim().is_empty() {
        bail!("Source file and run command cannot be empty");
    }
    if new.memory_limit_mb == 0 || new.cpu_limit <= 0.0 {
        bail!("Memory and CPU limits must be positive");
    }

    let mut file = load_languages(config_path)?;
    let exists = file
        .languages
        .iter()
        .any(|l| l.name.parse::<Language>().map(|l| l == language).unwrap_or(false));
    if exists {
        bail!("Language '{}' already exists in config", language);
    }

    let image = new
        .image
        .unwrap_or_else(|| format!("arbiter-{}:{}", language, new.version));
    file.languages.push(LanguageConfig {
        name: language.to_string(),
        version: new.version,
        image,
        source_file: new.source_file,
        compile_command: new.compile_command,
        run_command: new.run_command,
        memory_limit_mb: new.memory_limit_mb,
        cpu_limit: new.cpu_limit,
    });

    println!("📝 Updating {}...", config_path.display());
    file.write(config_path)?;
    println!("✅ Language '{}' added successfully!", language);
    Ok(())
}

pub fn list_languages(config_path: &Path) -> Result<()> {
    let file = load_languages(config_path)?;
    if file.languages.is_empty() {
        println!("No languages configured in {}", config_path.display());
        return Ok(());
    }

    println!("{:<12} {:<10} {:<28} {:>8} {:>5}", "NAME", "VERSION", "IMAGE", "MEMORY", "CPU");
    for lang in &file.languages {
        println!(
            "{:<12} {:<10} {:<28} {:>6}Mi {:>5}",
            lang.name, lang.version, lang.image, lang.memory_limit_mb, lang.cpu_limit
        );
    }
    Ok(())
}

/// Write every question in the file to Redis, replacing existing entries
pub async fn seed_questions(questions_path: &Path, redis_url: &str) -> Result<()> {
    let file = QuestionsFile::read(questions_path)?;
    println!("🌱 Seeding {} question(s) into {}", file.questions.len(), redis_url);

    let client = redis::Client::open(redis_url).context("Invalid Redis URL")?;
    let mut conn = client
        .get_connection_manager()
        .await
        .context("Failed to connect to Redis")?;

    for question in &file.questions {
        arbiter_common::redis::put_question(&mut conn, question)
            .await
            .with_context(|| format!("Failed to store question {}", question.id))?;
        println!(
            "  {} ({} cases, total weight {})",
            question.id,
            question.test_cases.len(),
            question.total_weight()
        );
    }

    println!("✅ Done");
    Ok(())
}

/// Local evaluation of one source file
pub struct DryRun {
    pub question_id: String,
    pub source: PathBuf,
    pub language: String,
    pub graded: bool,
    pub questions_path: PathBuf,
    pub languages_path: PathBuf,
}

pub async fn dry_run(target: DryRun) -> Result<()> {
    let code = fs::read_to_string(&target.source)
        .with_context(|| format!("Failed to read {}", target.source.display()))?;

    let config = dry_run_config(&target);
    let languages = Arc::new(LanguageRegistry::load(&target.languages_path)?);
    let questions = QuestionsFile::read(&target.questions_path)?.questions;
    let sandbox = Arc::new(DockerSandbox::connect(Arc::clone(&languages))?);

    let service = EvaluationService::new(
        &config,
        languages,
        sandbox,
        Backends {
            store: Arc::new(MemoryStore::new()),
            catalog: Arc::new(MemoryCatalog::from_questions(questions)),
            events: Arc::new(MemoryEventSink::new()),
        },
    );

    let request = EvaluateRequest {
        user_id: "cli".to_string(),
        question_id: target.question_id.clone(),
        code,
        language: target.language.clone(),
    };

    println!("🧪 Evaluating {} against {}...", target.source.display(), target.question_id);
    let view = if target.graded {
        let submitted = service.submit(request).await?;
        service.result(submitted.submission_id).await?
    } else {
        service.run_tests(request).await?
    };

    print!("{}", render_view(&view));
    Ok(())
}

fn dry_run_config(target: &DryRun) -> PipelineConfig {
    let defaults = PipelineConfig::from_env();
    PipelineConfig {
        store_backend: StoreBackend::Memory,
        languages_path: target.languages_path.display().to_string(),
        questions_path: target.questions_path.display().to_string(),
        rate_limit_max: 0,
        ..defaults
    }
}

fn render_view(view: &EvaluationView) -> String {
    let mut out = String::new();
    for verdict in &view.verdicts {
        match verdict {
            VerdictSummary::Visible(v) => {
                let mark = if v.passed { "✅" } else { "❌" };
                out.push_str(&format!(
                    "{} case {:<3} weight {:<3} {} ({}ms)\n",
                    mark, v.test_id, v.weight, v.reason, v.detail.duration_ms
                ));
                if !v.passed {
                    out.push_str(&format!("     expected: {:?}\n", v.detail.expected_output));
                    out.push_str(&format!("     actual:   {:?}\n", v.detail.actual_output));
                    if !v.detail.stderr.is_empty() {
                        out.push_str(&format!("     stderr:   {}\n", v.detail.stderr.trim_end()));
                    }
                }
            }
            VerdictSummary::Hidden { test_id, passed, weight } => {
                let mark = if *passed { "✅" } else { "❌" };
                out.push_str(&format!(
                    "{} case {:<3} weight {:<3} (hidden)\n",
                    mark, test_id, weight
                ));
            }
        }
    }
    for warning in &view.warnings {
        out.push_str(&format!("⚠️  {}\n", warning));
    }
    if let Some(diagnostic) = &view.diagnostic {
        out.push_str(&format!("\nCompiler output:\n{}\n", diagnostic.trim_end()));
    }
    out.push_str(&format!("\nScore: {:.2}  Status: {}\n", view.score, view.status));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_common::types::{OverallStatus, VerdictDetail, VerdictReason, VisibleVerdict};
    use uuid::Uuid;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("arbiter-cli-{}-{}", std::process::id(), name))
    }

    fn python() -> NewLanguage {
        NewLanguage {
            name: "py".to_string(),
            version: "3.12".to_string(),
            image: None,
            source_file: "main.py".to_string(),
            compile_command: None,
            run_command: "python3 main.py".to_string(),
            memory_limit_mb: 256,
            cpu_limit: 0.5,
        }
    }

    #[test]
    fn test_add_language_normalizes_and_rejects_duplicates() {
        let path = scratch("languages.json");
        let _ = fs::remove_file(&path);

        add_language(&path, python()).unwrap();
        let file = LanguagesFile::read(&path).unwrap();
        assert_eq!(file.languages.len(), 1);
        assert_eq!(file.languages[0].name, "python");
        assert_eq!(file.languages[0].image, "arbiter-python:3.12");

        assert!(add_language(&path, python()).is_err());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_add_language_rejects_unknown_name() {
        let path = scratch("unknown.json");
        let mut lang = python();
        lang.name = "cobol".to_string();
        assert!(add_language(&path, lang).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_render_view_hides_hidden_detail() {
        let view = EvaluationView {
            submission_id: Uuid::nil(),
            score: 50.0,
            status: OverallStatus::Partial,
            verdicts: vec![
                VerdictSummary::Visible(VisibleVerdict {
                    test_id: 1,
                    passed: false,
                    reason: VerdictReason::WrongAnswer,
                    weight: 1,
                    detail: VerdictDetail {
                        input: "2".to_string(),
                        expected_output: "2".to_string(),
                        actual_output: "3".to_string(),
                        stderr: String::new(),
                        duration_ms: 4,
                    },
                }),
                VerdictSummary::Hidden { test_id: 2, passed: true, weight: 1 },
            ],
            warnings: vec![],
            diagnostic: None,
        };
        let text = render_view(&view);
        assert!(text.contains("wrong answer"));
        assert!(text.contains("case 2   weight 1   (hidden)"));
        assert!(text.contains("Score: 50.00  Status: partial"));
    }
}
