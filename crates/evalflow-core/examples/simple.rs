use std::sync::Arc;

use evalflow_core::scorers::{LexicalSimilarity, SimilarityScoringService};
use evalflow_core::{
    chat, ArtifactStore, ChatResponse, MemoryArtifactStore, Pipeline, SplitRequest,
};
use evalflow_store::SqliteStore;
use evalflow_types::{StepOutcome, TestCase};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let artifacts: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
    let results = Arc::new(SqliteStore::open_in_memory()?);

    // Chat under test: a canned answer per question
    let chat = chat::from_async_fn(|req| {
        let answer = match req.question.as_str() {
            "What is the capital of France?" => "Paris is the capital of France.",
            "How many legs does a spider have?" => "Spiders have eight legs.",
            _ => "I don't know.",
        };
        async move { Ok(ChatResponse::new(answer)) }
    });

    let pipeline = Pipeline::builder()
        .artifacts(artifacts.clone())
        .chat(chat)
        .scoring(Arc::new(SimilarityScoringService::new(LexicalSimilarity::new())))
        .results(results)
        .chunk_size(2)
        .build()?;

    // Example 1: Inline cases
    let cases = vec![
        TestCase::new("What is the capital of France?", "The capital of France is Paris."),
        TestCase::new("How many legs does a spider have?", "A spider has eight legs."),
        TestCase::new("Who wrote Hamlet?", "William Shakespeare wrote Hamlet."),
    ];
    report(pipeline.run_cases(SplitRequest::new("inline"), cases).await);

    // Example 2: Load a .json, .jsonl or .csv file if provided
    if let Some(path) = std::env::args().nth(1) {
        let bytes = std::fs::read(&path)?;
        let file_name = std::path::Path::new(&path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("cases.json");
        let key = format!("test-cases/{file_name}");
        artifacts.put(&key, bytes).await?;
        report(pipeline.run(SplitRequest::new(key)).await);
    }

    Ok(())
}

fn report(outcome: StepOutcome<evalflow_core::RunReport>) {
    match outcome {
        StepOutcome::Succeeded(run) => println!("{}", run.summary.summary_table()),
        StepOutcome::Failed { evaluation_id, error } => {
            eprintln!("evaluation {} failed: {error}", evaluation_id.unwrap_or_default())
        }
    }
}
