use std::io::Read;

use clap::Parser;
use redpen::{export_analysis_report, Analyzer, Feedback, StaticFeedback, TextAnalysisResult};

#[derive(Parser)]
#[command(
    name = "redpen",
    about = "Compare prose against a corrected rewrite and score writing quality",
    version
)]
struct Cli {
    /// File paths to analyze (reads stdin if none provided)
    files: Vec<String>,

    /// File holding the corrected rewrite of the input
    #[arg(long)]
    corrected: Option<String>,

    /// File holding the narrative feedback (sections and band estimate are parsed out)
    #[arg(long)]
    feedback: Option<String>,

    /// Seed for the score jitter, for reproducible output
    #[arg(long)]
    seed: Option<u64>,

    /// Print a markdown report instead of JSON
    #[arg(long)]
    report: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut feedback = match &cli.feedback {
        Some(path) => Feedback::parse(&read_file(path)),
        None => Feedback::default(),
    };
    if let Some(path) = &cli.corrected {
        feedback.corrected_text = Some(read_file(path));
    }

    let mut analyzer = Analyzer::new(StaticFeedback(feedback));
    if let Some(seed) = cli.seed {
        analyzer = analyzer.with_seed(seed);
    }

    if cli.files.is_empty() {
        let mut input = String::new();
        std::io::stdin()
            .read_to_string(&mut input)
            .expect("Failed to read stdin");
        let result = analyzer.analyze(&input).await;
        emit(&result, &input, cli.report);
    } else {
        for path in &cli.files {
            let text = read_file(path);
            let result = analyzer.analyze(&text).await;
            emit(&result, &text, cli.report);
        }
    }
}

fn read_file(path: &str) -> String {
    std::fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("Error reading {path}: {e}");
        std::process::exit(1);
    })
}

fn emit(result: &TextAnalysisResult, original: &str, report: bool) {
    if report {
        println!("{}", export_analysis_report(result, original));
    } else {
        println!("{}", serde_json::to_string_pretty(result).unwrap());
    }
}
