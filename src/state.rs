use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A web resource referenced by grounded research text. `short_url` is the
/// compact token substituted into model output; `value` is the original URL
/// restored at finalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: usize,
    pub short_url: String,
    pub value: String,
    pub label: String,
    pub title: String,
}

/// A text span of raw research output together with the sources that
/// support it. Offsets are character offsets into the unmodified text.
#[derive(Debug, Clone, PartialEq)]
pub struct Citation {
    pub start_index: usize,
    pub end_index: usize,
    pub segments: Vec<Source>,
}

/// One unit of web research. Ids are unique within a run: the initial batch
/// numbers from 0, follow-up batches continue from the count of queries
/// already issued.
#[derive(Debug, Clone)]
pub struct WorkerTask {
    pub search_query: String,
    pub id: usize,
}

/// A worker's self-contained contribution, applied to the shared state by
/// the orchestrator after the batch barrier.
#[derive(Debug, Clone)]
pub struct WorkerOutput {
    pub search_query: String,
    pub research_text: String,
    pub sources: Vec<Source>,
}

/// Shared state of one research run, owned by the orchestrator and mutated
/// only between batches.
#[derive(Debug, Clone, Default)]
pub struct OverallState {
    pub messages: Vec<ChatMessage>,
    pub query_list: Vec<String>,
    pub search_query: Vec<String>,
    pub web_research_result: Vec<String>,
    pub sources_gathered: Vec<Source>,
    pub research_loop_count: usize,
    pub is_sufficient: bool,
    pub knowledge_gap: String,
    pub follow_up_queries: Vec<String>,
    pub number_of_ran_queries: usize,
    pub initial_search_query_count: Option<usize>,
    pub max_research_loops: Option<usize>,
    pub reasoning_model: Option<String>,
}

impl OverallState {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        OverallState {
            messages,
            ..Default::default()
        }
    }

    pub fn apply_worker_output(&mut self, output: WorkerOutput) {
        self.sources_gathered.extend(output.sources);
        self.search_query.push(output.search_query);
        self.web_research_result.push(output.research_text);
    }
}

/// The terminal result of a run: the answer message with short URLs
/// rewritten back to real URLs, plus the deduplicated sources it cites.
#[derive(Debug, Clone)]
pub struct ResearchOutcome {
    pub message: ChatMessage,
    pub unique_sources: Vec<Source>,
}

/// Derive the research topic from the message history: the last message's
/// content for a single-turn conversation, otherwise the full history as
/// `User:`/`Assistant:` lines.
pub fn get_research_topic(messages: &[ChatMessage]) -> String {
    if messages.len() == 1 {
        return messages[0].content.clone();
    }

    let mut topic = String::new();
    for message in messages {
        match message.role {
            Role::User => topic.push_str(&format!("User: {}\n", message.content)),
            Role::Assistant => topic.push_str(&format!("Assistant: {}\n", message.content)),
        }
    }
    topic
}
