mod citations;
mod config;
mod error;
mod genai;
mod progress;
mod prompts;
mod research;
mod state;

use anyhow::Result;
use error::AgentError;
use genai::GeminiClient;
use research::{ResearchOrchestrator, ResearchProgress};
use state::ChatMessage;
use std::sync::Arc;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let question: String = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if question.trim().is_empty() {
        eprintln!("Usage: pro-search <question>");
        std::process::exit(2);
    }

    let api_key = std::env::var("GEMINI_API_KEY")
        .map_err(|_| AgentError::Configuration("GEMINI_API_KEY is not set".to_string()))?;

    let config = config::Config::load();
    let client = Arc::new(GeminiClient::new(api_key));
    let mut orchestrator = ResearchOrchestrator::new(config, client);

    let (tx, mut rx) = mpsc::unbounded_channel();
    orchestrator.set_progress_channel(tx);

    let printer = tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            match progress {
                ResearchProgress::Started => eprintln!("[research] starting"),
                ResearchProgress::GeneratingQueries => {
                    eprintln!("[research] generating search queries")
                }
                ResearchProgress::WorkersStarted(n) => {
                    eprintln!("[research] dispatching {} search worker(s)", n)
                }
                ResearchProgress::WorkerCompleted(query) => {
                    eprintln!("[research] finished \"{}\"", query)
                }
                ResearchProgress::Reflecting(current, max) => {
                    eprintln!("[research] reflecting ({}/{})", current, max)
                }
                ResearchProgress::Finalizing => eprintln!("[research] writing final answer"),
                ResearchProgress::Completed => eprintln!("[research] done"),
            }
        }
    });

    let result = orchestrator.run(vec![ChatMessage::user(question)]).await;

    // Closing the orchestrator's sender lets the printer drain and exit.
    drop(orchestrator);
    let _ = printer.await;

    if std::env::var("PROSEARCH_DEBUG").is_ok() {
        for entry in progress::recent(50) {
            eprintln!("[{}] {}", entry.kind.tag(), entry.text);
        }
    }

    let outcome = result?;

    println!("{}", outcome.message.content);
    if !outcome.unique_sources.is_empty() {
        println!("\nSources:");
        for source in &outcome.unique_sources {
            println!("  - {} ({})", source.title, source.value);
        }
    }

    Ok(())
}
