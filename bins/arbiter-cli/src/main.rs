mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "arbiter-cli")]
#[command(
    about = "Arbiter CLI - Manage languages, seed questions and dry-run evaluations",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a language to the sandbox allow-list
    AddLang {
        /// Language name (python, java, rust, javascript)
        #[arg(short, long)]
        name: String,

        /// Language version (e.g., 3.12, 17)
        #[arg(short, long, default_value = "latest")]
        version: String,

        /// Docker image (defaults to arbiter-{name}:{version})
        #[arg(short, long)]
        image: Option<String>,

        /// File the source is written to (e.g., main.py)
        #[arg(short, long)]
        source_file: String,

        /// Compile or syntax-check command, if the language has one
        #[arg(long)]
        compile: Option<String>,

        /// Command that runs the program
        #[arg(short, long)]
        run: String,

        /// Memory limit in MB
        #[arg(short, long, default_value = "256")]
        memory: u32,

        /// CPU limit
        #[arg(long, default_value = "0.5")]
        cpu: f32,

        #[arg(long, default_value = "config/languages.json")]
        config: PathBuf,
    },

    /// List configured languages
    ListLangs {
        #[arg(long, default_value = "config/languages.json")]
        config: PathBuf,
    },

    /// Load a questions file into Redis
    Seed {
        #[arg(short, long, default_value = "config/questions.json")]
        questions: PathBuf,

        #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
        redis_url: String,
    },

    /// Evaluate a source file locally against one question, nothing persisted
    Run {
        /// Question id (e.g., Q101)
        #[arg(short = 'Q', long)]
        question: String,

        /// Source file to evaluate
        #[arg(short, long)]
        file: PathBuf,

        #[arg(short, long)]
        language: String,

        /// Grade against hidden cases too
        #[arg(long, default_value = "false")]
        submit: bool,

        #[arg(long, default_value = "config/questions.json")]
        questions: PathBuf,

        #[arg(long, default_value = "config/languages.json")]
        languages: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::AddLang {
            name,
            version,
            image,
            source_file,
            compile,
            run,
            memory,
            cpu,
            config,
        } => {
            let language = commands::NewLanguage {
                name,
                version,
                image,
                source_file,
                compile_command: compile,
                run_command: run,
                memory_limit_mb: memory,
                cpu_limit: cpu,
            };
            commands::add_language(&config, language)?;
        }
        Commands::ListLangs { config } => {
            commands::list_languages(&config)?;
        }
        Commands::Seed { questions, redis_url } => {
            commands::seed_questions(&questions, &redis_url).await?;
        }
        Commands::Run {
            question,
            file,
            language,
            submit,
            questions,
            languages,
        } => {
            let target = commands::DryRun {
                question_id: question,
                source: file,
                language,
                graded: submit,
                questions_path: questions,
                languages_path: languages,
            };
            commands::dry_run(target).await?;
        }
    }

    Ok(())
}
