use crate::citations::{build_citations, insert_citation_markers, UrlResolver};
use crate::config::Config;
use crate::error::AgentError;
use crate::genai::{generate_structured, GenerationBackend};
use crate::progress::{self, Kind};
use crate::prompts;
use crate::state::{
    get_research_topic, ChatMessage, OverallState, ResearchOutcome, Source, WorkerOutput,
    WorkerTask,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const EMPTY_ANSWER_FALLBACK: &str =
    "I apologize, but I encountered an issue generating the response. Please try again.";

const REFLECTION_SUMMARY_SEPARATOR: &str = "\n\n---\n\n";
const ANSWER_SUMMARY_SEPARATOR: &str = "\n---\n\n";
const MAX_SOURCE_HINTS: usize = 10;
const FALLBACK_SOURCE_COUNT: usize = 5;
const SOURCE_MARKER_TOKENS: [&str; 4] = ["source", "reference", "[", "http"];

#[derive(Debug, Clone)]
pub enum ResearchProgress {
    Started,
    GeneratingQueries,
    WorkersStarted(usize),           // number of workers in the batch
    WorkerCompleted(String),         // search query
    Reflecting(usize, usize),        // current loop, max loops
    Finalizing,
    Completed,
}

#[derive(Debug, Deserialize)]
struct SearchQueryList {
    #[serde(default)]
    #[allow(dead_code)]
    rationale: String,
    query: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Reflection {
    is_sufficient: bool,
    #[serde(default)]
    knowledge_gap: String,
    #[serde(default)]
    follow_up_queries: Vec<String>,
}

/// Transition taken after each reflection.
#[derive(Debug)]
pub enum NextStep {
    Finalize,
    Dispatch(Vec<WorkerTask>),
}

/// Initial fan-out: one task per generated query, ids from 0.
pub fn initial_tasks(queries: &[String]) -> Vec<WorkerTask> {
    queries
        .iter()
        .enumerate()
        .map(|(idx, query)| WorkerTask {
            search_query: query.clone(),
            id: idx,
        })
        .collect()
}

/// Decide whether to finalize or fan out again. Follow-up task ids continue
/// from the number of queries already issued, so ids never collide across
/// loop iterations.
pub fn evaluate(state: &OverallState, max_loops: usize) -> NextStep {
    if state.is_sufficient || state.research_loop_count >= max_loops {
        return NextStep::Finalize;
    }

    NextStep::Dispatch(
        state
            .follow_up_queries
            .iter()
            .enumerate()
            .map(|(idx, query)| WorkerTask {
                search_query: query.clone(),
                id: state.number_of_ran_queries + idx,
            })
            .collect(),
    )
}

pub struct ResearchOrchestrator<B: GenerationBackend + 'static> {
    config: Config,
    backend: Arc<B>,
    progress_tx: Option<mpsc::UnboundedSender<ResearchProgress>>,
}

impl<B: GenerationBackend + 'static> ResearchOrchestrator<B> {
    pub fn new(config: Config, backend: Arc<B>) -> Self {
        ResearchOrchestrator {
            config,
            backend,
            progress_tx: None,
        }
    }

    pub fn set_progress_channel(&mut self, tx: mpsc::UnboundedSender<ResearchProgress>) {
        self.progress_tx = Some(tx);
    }

    fn send_progress(&self, progress: ResearchProgress) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.send(progress);
        }
    }

    /// Main entry point: run the full research loop for a conversation.
    pub async fn run(&self, messages: Vec<ChatMessage>) -> Result<ResearchOutcome, AgentError> {
        self.run_with_state(OverallState::new(messages)).await
    }

    /// Like `run`, but the caller supplies the initial state, including any
    /// per-run overrides (query count, loop cap, reasoning model).
    pub async fn run_with_state(
        &self,
        mut state: OverallState,
    ) -> Result<ResearchOutcome, AgentError> {
        progress::clear();
        progress::log("research run started");
        self.send_progress(ResearchProgress::Started);

        // One-time seed from configuration; not re-applied on later loops.
        if state.initial_search_query_count.is_none() {
            state.initial_search_query_count =
                Some(self.config.research.number_of_initial_queries);
        }
        let max_loops = state
            .max_research_loops
            .unwrap_or(self.config.research.max_research_loops);

        self.send_progress(ResearchProgress::GeneratingQueries);
        state.query_list = self.generate_queries(&state).await?;

        if std::env::var("PROSEARCH_DEBUG").is_ok() {
            eprintln!(
                "\n[research] generated {} initial queries:",
                state.query_list.len()
            );
            for (i, query) in state.query_list.iter().enumerate() {
                eprintln!("  {}. {}", i + 1, query);
            }
            eprintln!();
        }

        // The short-URL map lives for exactly one run.
        let resolver = Arc::new(UrlResolver::new());
        let mut batch = initial_tasks(&state.query_list);

        loop {
            self.send_progress(ResearchProgress::WorkersStarted(batch.len()));
            let outputs = self.execute_workers(batch, resolver.clone()).await?;
            for output in outputs {
                state.apply_worker_output(output);
            }

            self.send_progress(ResearchProgress::Reflecting(
                state.research_loop_count + 1,
                max_loops,
            ));
            self.reflect(&mut state).await?;

            match evaluate(&state, max_loops) {
                NextStep::Finalize => {
                    if state.is_sufficient {
                        eprintln!(
                            "[research] research sufficient after {} loop(s)",
                            state.research_loop_count
                        );
                    } else {
                        eprintln!(
                            "[research] max research loops ({}) reached, finalizing",
                            max_loops
                        );
                    }
                    break;
                }
                NextStep::Dispatch(tasks) => {
                    eprintln!(
                        "[research] loop {}: dispatching {} follow-up queries",
                        state.research_loop_count,
                        tasks.len()
                    );
                    batch = tasks;
                }
            }
        }

        self.send_progress(ResearchProgress::Finalizing);
        let outcome = self.finalize_answer(&state).await?;
        self.send_progress(ResearchProgress::Completed);
        Ok(outcome)
    }

    /// Turn the conversation's research topic into the initial query set.
    /// A non-conformant structured response is fatal here: there is no safe
    /// default for "no queries".
    async fn generate_queries(&self, state: &OverallState) -> Result<Vec<String>, AgentError> {
        let count = state
            .initial_search_query_count
            .unwrap_or(self.config.research.number_of_initial_queries);
        let topic = get_research_topic(&state.messages);
        let prompt = prompts::query_writer_instructions(&prompts::current_date(), &topic, count);

        progress::log_with(Kind::QueryGen, format!("requesting up to {} queries", count));
        let result: SearchQueryList = generate_structured(
            self.backend.as_ref(),
            "query generator",
            &prompt,
            &self.config.models.query_generator_model,
            1.0,
        )
        .await?;

        if result.query.is_empty() {
            return Err(AgentError::SchemaParse {
                component: "query generator",
                detail: "empty query list".to_string(),
            });
        }
        Ok(result.query)
    }

    /// Execute one batch of web research workers concurrently and barrier
    /// on the whole batch. Results are merged in task-id order so state
    /// sequences are deterministic regardless of completion order.
    async fn execute_workers(
        &self,
        tasks: Vec<WorkerTask>,
        resolver: Arc<UrlResolver>,
    ) -> Result<Vec<WorkerOutput>, AgentError> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let (tx, mut rx) = mpsc::channel(tasks.len());
        let mut handles = Vec::new();

        for task in tasks {
            let tx = tx.clone();
            let backend = self.backend.clone();
            let resolver = resolver.clone();
            let model = self.config.models.query_generator_model.clone();
            let progress_tx = self.progress_tx.clone();

            let handle = tokio::spawn(async move {
                let result = web_research(backend.as_ref(), &resolver, &task, &model).await;

                if let Some(progress) = progress_tx {
                    let _ = progress
                        .send(ResearchProgress::WorkerCompleted(task.search_query.clone()));
                }

                let _ = tx.send((task.id, result)).await;
            });

            handles.push(handle);
        }

        // Drop the original sender so rx knows when all workers are done.
        drop(tx);

        let mut results = Vec::new();
        while let Some(item) = rx.recv().await {
            results.push(item);
        }

        for handle in handles {
            let _ = handle.await;
        }

        results.sort_by_key(|(id, _)| *id);

        let mut outputs = Vec::new();
        for (id, result) in results {
            match result {
                Ok(output) => outputs.push(output),
                Err(AgentError::Service { context, message }) => {
                    return Err(AgentError::Service {
                        context: format!("web research worker {}: {}", id, context),
                        message,
                    });
                }
                Err(other) => return Err(other),
            }
        }
        Ok(outputs)
    }

    /// Inspect accumulated research and decide sufficiency. The loop count
    /// is incremented before the prompt is formatted, so it reflects loops
    /// completed including this reflection. A non-conformant structured
    /// response degrades to a conservative "not sufficient" default, which
    /// bounds the damage to one extra loop.
    async fn reflect(&self, state: &mut OverallState) -> Result<(), AgentError> {
        state.research_loop_count += 1;
        let model = state
            .reasoning_model
            .clone()
            .unwrap_or_else(|| self.config.models.reflection_model.clone());

        let topic = get_research_topic(&state.messages);
        let summaries = state.web_research_result.join(REFLECTION_SUMMARY_SEPARATOR);
        let prompt = prompts::reflection_instructions(&prompts::current_date(), &topic, &summaries);

        let result = match generate_structured::<Reflection, _>(
            self.backend.as_ref(),
            "reflection",
            &prompt,
            &model,
            1.0,
        )
        .await
        {
            Ok(reflection) => reflection,
            Err(AgentError::SchemaParse { detail, .. }) => {
                eprintln!(
                    "[research] reflection output unparseable ({}), using conservative fallback",
                    detail
                );
                progress::log_with(Kind::Reflection, "schema parse failed, fallback engaged");
                Reflection {
                    is_sufficient: false,
                    knowledge_gap: "Unable to parse structured response".to_string(),
                    follow_up_queries: vec!["Need more information".to_string()],
                }
            }
            Err(other) => return Err(other),
        };

        state.is_sufficient = result.is_sufficient;
        state.knowledge_gap = result.knowledge_gap;
        state.follow_up_queries = result.follow_up_queries;
        state.number_of_ran_queries = state.search_query.len();

        progress::log_with(
            Kind::Reflection,
            format!(
                "loop {}: sufficient={}, {} follow-ups",
                state.research_loop_count,
                state.is_sufficient,
                state.follow_up_queries.len()
            ),
        );
        Ok(())
    }

    /// Merge all research into the final cited answer.
    async fn finalize_answer(&self, state: &OverallState) -> Result<ResearchOutcome, AgentError> {
        let model = state
            .reasoning_model
            .clone()
            .unwrap_or_else(|| self.config.models.answer_model.clone());
        let topic = get_research_topic(&state.messages);

        let mut summaries = state.web_research_result.join(ANSWER_SUMMARY_SEPARATOR);
        if !state.sources_gathered.is_empty() {
            summaries.push_str("\n\nAvailable sources to reference:\n");
            for (i, source) in state
                .sources_gathered
                .iter()
                .take(MAX_SOURCE_HINTS)
                .enumerate()
            {
                summaries.push_str(&format!("[{}] {} - {}\n", i + 1, source.title, source.short_url));
            }
            summaries.push_str(
                "\nPlease reference these sources in your answer using the format [title](url) where appropriate.\n",
            );
        }

        let prompt = prompts::answer_instructions(&prompts::current_date(), &topic, &summaries);
        progress::log_with(Kind::Finalizer, "generating final answer");
        let generated = self.backend.generate_text(&prompt, &model, 0.0).await?;

        Ok(resolve_final_answer(generated, &state.sources_gathered))
    }
}

/// One web research worker: a single grounded search call, then citation
/// resolution and marker insertion against the raw response text.
async fn web_research<B: GenerationBackend + ?Sized>(
    backend: &B,
    resolver: &UrlResolver,
    task: &WorkerTask,
    model: &str,
) -> Result<WorkerOutput, AgentError> {
    let prompt = prompts::web_searcher_instructions(&prompts::current_date(), &task.search_query);
    let response = backend.generate_with_search(&prompt, model, 0.0).await?;

    let citations = build_citations(&response.chunks, &response.supports, resolver, task.id);
    let modified_text = insert_citation_markers(&response.text, &citations);
    let sources: Vec<Source> = citations.into_iter().flat_map(|c| c.segments).collect();

    progress::log_with(
        Kind::Worker,
        format!(
            "worker {} finished \"{}\" with {} source segments",
            task.id, task.search_query, sources.len()
        ),
    );

    Ok(WorkerOutput {
        search_query: task.search_query.clone(),
        research_text: modified_text,
        sources,
    })
}

/// Post-process the generated answer: substitute the apology for empty
/// output, rewrite short URLs back to the original URLs, and keep only the
/// sources the text actually references. When nothing matches, fall back to
/// the first few gathered sources and, if the text carries no source
/// markers at all, append a synthesized Sources section.
pub fn resolve_final_answer(generated: String, sources_gathered: &[Source]) -> ResearchOutcome {
    let mut content = if generated.trim().is_empty() {
        EMPTY_ANSWER_FALLBACK.to_string()
    } else {
        generated
    };

    fn retain(source: &Source, unique: &mut Vec<Source>) {
        if !unique.iter().any(|s| s.short_url == source.short_url) {
            unique.push(source.clone());
        }
    }

    let mut unique_sources: Vec<Source> = Vec::new();

    for source in sources_gathered {
        if !source.short_url.is_empty() && content.contains(&source.short_url) {
            content = content.replace(&source.short_url, &source.value);
            retain(source, &mut unique_sources);
        } else if !source.value.is_empty() && content.contains(&source.value) {
            retain(source, &mut unique_sources);
        } else if !source.label.is_empty() && content.contains(&format!("[{}]", source.label)) {
            retain(source, &mut unique_sources);
        }
    }

    if unique_sources.is_empty() && !sources_gathered.is_empty() {
        for source in sources_gathered {
            if unique_sources.len() >= FALLBACK_SOURCE_COUNT {
                break;
            }
            retain(source, &mut unique_sources);
        }

        let lowered = content.to_lowercase();
        if !SOURCE_MARKER_TOKENS.iter().any(|m| lowered.contains(m)) {
            content.push_str("\n\n**Sources:**\n");
            for (i, source) in unique_sources.iter().enumerate() {
                let title = if source.label.is_empty() {
                    format!("Source {}", i + 1)
                } else {
                    source.label.clone()
                };
                let url = if source.value.is_empty() {
                    source.short_url.clone()
                } else {
                    source.value.clone()
                };
                if !url.is_empty() {
                    content.push_str(&format!("{}. [{}]({})\n", i + 1, title, url));
                }
            }
        }
    }

    ResearchOutcome {
        message: ChatMessage::assistant(content),
        unique_sources,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genai::{GroundedResponse, GroundingChunk, GroundingSupport, SupportSegment, WebChunk};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted backend: `generate_text` pops replies in call order (query
    /// generation, then one per reflection, then the final answer);
    /// `generate_with_search` replays one canned grounded response per call.
    struct MockBackend {
        text_replies: Mutex<VecDeque<String>>,
        search_reply: GroundedResponse,
        search_calls: AtomicUsize,
        search_prompts: Mutex<Vec<String>>,
    }

    impl MockBackend {
        fn new(text_replies: Vec<&str>) -> Self {
            MockBackend {
                text_replies: Mutex::new(text_replies.into_iter().map(String::from).collect()),
                search_reply: GroundedResponse {
                    text: "canned research result".to_string(),
                    chunks: Vec::new(),
                    supports: Vec::new(),
                },
                search_calls: AtomicUsize::new(0),
                search_prompts: Mutex::new(Vec::new()),
            }
        }

        fn with_search_reply(mut self, reply: GroundedResponse) -> Self {
            self.search_reply = reply;
            self
        }
    }

    #[async_trait]
    impl GenerationBackend for MockBackend {
        async fn generate_text(
            &self,
            _prompt: &str,
            _model: &str,
            _temperature: f32,
        ) -> Result<String, AgentError> {
            self.text_replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| AgentError::service("mock", "no scripted reply left"))
        }

        async fn generate_with_search(
            &self,
            prompt: &str,
            _model: &str,
            _temperature: f32,
        ) -> Result<GroundedResponse, AgentError> {
            self.search_calls.fetch_add(1, Ordering::SeqCst);
            self.search_prompts.lock().unwrap().push(prompt.to_string());
            Ok(self.search_reply.clone())
        }
    }

    fn test_config(initial_queries: usize, max_loops: usize) -> Config {
        let mut config = Config::default();
        config.research.number_of_initial_queries = initial_queries;
        config.research.max_research_loops = max_loops;
        config
    }

    fn source(id: usize, short: &str, value: &str, label: &str) -> Source {
        Source {
            id,
            short_url: short.to_string(),
            value: value.to_string(),
            label: label.to_string(),
            title: label.to_string(),
        }
    }

    const QUERIES_TWO: &str =
        r#"{"rationale": "r", "query": ["rust adoption 2026", "rust foundation members"]}"#;
    const QUERIES_ONE: &str = r#"{"rationale": "r", "query": ["rust adoption 2026"]}"#;
    const SUFFICIENT: &str =
        r#"{"is_sufficient": true, "knowledge_gap": "", "follow_up_queries": []}"#;
    const INSUFFICIENT: &str = r#"{"is_sufficient": false, "knowledge_gap": "missing benchmarks", "follow_up_queries": ["rust benchmark results 2026"]}"#;

    #[test]
    fn test_initial_task_ids_start_at_zero() {
        let tasks = initial_tasks(&["a".to_string(), "b".to_string()]);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, 0);
        assert_eq!(tasks[1].id, 1);
    }

    #[test]
    fn test_follow_up_ids_continue_from_ran_queries() {
        let mut state = OverallState::default();
        state.is_sufficient = false;
        state.research_loop_count = 1;
        state.number_of_ran_queries = 3;
        state.follow_up_queries = vec!["x".to_string(), "y".to_string()];

        match evaluate(&state, 5) {
            NextStep::Dispatch(tasks) => {
                assert_eq!(tasks[0].id, 3);
                assert_eq!(tasks[1].id, 4);
            }
            NextStep::Finalize => panic!("expected dispatch"),
        }
    }

    #[test]
    fn test_evaluate_finalizes_on_sufficiency() {
        let mut state = OverallState::default();
        state.is_sufficient = true;
        state.research_loop_count = 1;
        state.follow_up_queries = vec!["x".to_string()];
        assert!(matches!(evaluate(&state, 5), NextStep::Finalize));
    }

    #[test]
    fn test_evaluate_finalizes_at_loop_cap() {
        let mut state = OverallState::default();
        state.is_sufficient = false;
        state.research_loop_count = 2;
        state.follow_up_queries = vec!["x".to_string()];
        assert!(matches!(evaluate(&state, 2), NextStep::Finalize));
    }

    #[tokio::test]
    async fn test_single_batch_when_first_reflection_sufficient() {
        let backend = Arc::new(MockBackend::new(vec![
            QUERIES_TWO,
            SUFFICIENT,
            "Rust keeps growing.",
        ]));
        let orchestrator = ResearchOrchestrator::new(test_config(2, 3), backend.clone());

        let outcome = orchestrator
            .run(vec![ChatMessage::user("How popular is Rust?")])
            .await
            .unwrap();

        assert_eq!(outcome.message.content, "Rust keeps growing.");
        assert_eq!(backend.search_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_loop_bounded_when_never_sufficient() {
        // Two reflections both insufficient; max_loops = 2 forces
        // finalization after the second one.
        let backend = Arc::new(MockBackend::new(vec![
            QUERIES_ONE,
            INSUFFICIENT,
            INSUFFICIENT,
            "Best effort answer.",
        ]));
        let orchestrator = ResearchOrchestrator::new(test_config(1, 2), backend.clone());

        let outcome = orchestrator
            .run(vec![ChatMessage::user("How fast is Rust?")])
            .await
            .unwrap();

        assert_eq!(outcome.message.content, "Best effort answer.");
        // One initial query plus one follow-up batch; the second set of
        // follow-ups is never dispatched.
        assert_eq!(backend.search_calls.load(Ordering::SeqCst), 2);
        assert!(backend.text_replies.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reflection_parse_failure_falls_back_and_terminates() {
        let backend = Arc::new(MockBackend::new(vec![
            QUERIES_ONE,
            "this is not json",
            "still not json",
            "Answer anyway.",
        ]));
        let orchestrator = ResearchOrchestrator::new(test_config(1, 2), backend.clone());

        let outcome = orchestrator
            .run(vec![ChatMessage::user("topic")])
            .await
            .unwrap();

        assert_eq!(outcome.message.content, "Answer anyway.");
        // The fallback follow-up query drives one extra batch.
        assert_eq!(backend.search_calls.load(Ordering::SeqCst), 2);
        let prompts = backend.search_prompts.lock().unwrap();
        assert!(prompts[1].contains("Need more information"));
    }

    #[tokio::test]
    async fn test_query_generation_parse_failure_is_fatal() {
        let backend = Arc::new(MockBackend::new(vec!["no json at all"]));
        let orchestrator = ResearchOrchestrator::new(test_config(2, 2), backend);

        let err = orchestrator
            .run(vec![ChatMessage::user("topic")])
            .await
            .unwrap_err();

        match err {
            AgentError::SchemaParse { component, .. } => {
                assert_eq!(component, "query generator")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_per_run_override_caps_loops() {
        let backend = Arc::new(MockBackend::new(vec![
            QUERIES_ONE,
            INSUFFICIENT,
            "Answer.",
        ]));
        let orchestrator = ResearchOrchestrator::new(test_config(1, 5), backend.clone());

        let mut state = OverallState::new(vec![ChatMessage::user("topic")]);
        state.max_research_loops = Some(1);
        orchestrator.run_with_state(state).await.unwrap();

        // The per-run cap of 1 finalizes after the first reflection even
        // though the configured default would allow 5.
        assert_eq!(backend.search_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_short_urls_restored_in_final_answer() {
        let reply = GroundedResponse {
            text: "Rust is memory safe.".to_string(),
            chunks: vec![GroundingChunk {
                web: WebChunk {
                    uri: "https://a.example/page".to_string(),
                    title: "a.example".to_string(),
                },
            }],
            supports: vec![GroundingSupport {
                segment: SupportSegment {
                    start_index: Some(0),
                    end_index: Some(20),
                },
                grounding_chunk_indices: vec![0],
            }],
        };
        let backend = Arc::new(
            MockBackend::new(vec![
                QUERIES_ONE,
                SUFFICIENT,
                "Safety matters [a](https://search.local/id/0-0).",
            ])
            .with_search_reply(reply),
        );
        let orchestrator = ResearchOrchestrator::new(test_config(1, 2), backend);

        let outcome = orchestrator
            .run(vec![ChatMessage::user("Is Rust safe?")])
            .await
            .unwrap();

        assert_eq!(
            outcome.message.content,
            "Safety matters [a](https://a.example/page)."
        );
        assert_eq!(outcome.unique_sources.len(), 1);
        assert_eq!(outcome.unique_sources[0].value, "https://a.example/page");
    }

    #[test]
    fn test_finalizer_empty_answer_without_sources() {
        let outcome = resolve_final_answer("   ".to_string(), &[]);
        assert_eq!(outcome.message.content, EMPTY_ANSWER_FALLBACK);
        assert!(outcome.unique_sources.is_empty());
    }

    #[test]
    fn test_finalizer_replaces_short_urls() {
        let sources = vec![source(
            0,
            "https://search.local/id/0-0",
            "https://a.example/page",
            "a",
        )];
        let outcome = resolve_final_answer(
            "See [a](https://search.local/id/0-0) for details.".to_string(),
            &sources,
        );
        assert_eq!(
            outcome.message.content,
            "See [a](https://a.example/page) for details."
        );
        assert_eq!(outcome.unique_sources, sources);
    }

    #[test]
    fn test_finalizer_retains_on_bracket_label() {
        let sources = vec![source(
            0,
            "https://search.local/id/0-0",
            "https://a.example/page",
            "wikipedia",
        )];
        let outcome =
            resolve_final_answer("As [wikipedia] explains, it depends.".to_string(), &sources);
        assert_eq!(outcome.unique_sources.len(), 1);
    }

    #[test]
    fn test_finalizer_fallback_appends_sources_section() {
        let sources: Vec<Source> = (0..7)
            .map(|i| {
                source(
                    i,
                    &format!("https://search.local/id/0-{i}"),
                    &format!("https://site{i}.example/page"),
                    &format!("site{i}"),
                )
            })
            .collect();

        // No short URL, original URL, label, or marker token in the text.
        let outcome = resolve_final_answer("A bare answer with no citations.".to_string(), &sources);

        assert_eq!(outcome.unique_sources.len(), 5);
        assert!(outcome.message.content.contains("**Sources:**"));
        assert!(outcome
            .message
            .content
            .contains("1. [site0](https://site0.example/page)"));
    }

    #[test]
    fn test_finalizer_fallback_skips_section_when_marker_present() {
        let sources = vec![source(
            0,
            "https://search.local/id/0-0",
            "https://a.example/page",
            "a",
        )];
        // "reference" is one of the marker tokens.
        let outcome =
            resolve_final_answer("See the reference list elsewhere.".to_string(), &sources);
        assert_eq!(outcome.unique_sources.len(), 1);
        assert!(!outcome.message.content.contains("**Sources:**"));
    }

    #[test]
    fn test_finalizer_dedups_repeated_sources() {
        let duplicated = source(
            0,
            "https://search.local/id/0-0",
            "https://a.example/page",
            "a",
        );
        let sources = vec![duplicated.clone(), duplicated.clone()];
        let outcome = resolve_final_answer(
            "Both spans cite [a](https://search.local/id/0-0) and [a](https://a.example/page).".to_string(),
            &sources,
        );
        assert_eq!(outcome.unique_sources.len(), 1);
    }
}
