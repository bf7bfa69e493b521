use crate::genai::{GroundingChunk, GroundingSupport};
use crate::state::{Citation, Source};
use std::collections::HashMap;
use std::sync::Mutex;

/// Run-scoped map from original URL to its short identifier. Shared by all
/// workers of one run; allocation is a single get-or-create under the lock,
/// so repeated chunks for the same URL always reuse the same short URL no
/// matter which worker resolves first.
pub struct UrlResolver {
    inner: Mutex<ResolverInner>,
}

struct ResolverInner {
    map: HashMap<String, Source>,
    next_id: usize,
}

impl UrlResolver {
    pub fn new() -> Self {
        UrlResolver {
            inner: Mutex::new(ResolverInner {
                map: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    pub fn resolve(&self, url: &str, title: &str, worker_id: usize) -> Source {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(existing) = inner.map.get(url) {
            return existing.clone();
        }

        let id = inner.next_id;
        inner.next_id += 1;

        let source = Source {
            id,
            short_url: format!("https://search.local/id/{}-{}", worker_id, id),
            value: url.to_string(),
            label: derive_label(title),
            title: title.to_string(),
        };
        inner.map.insert(url.to_string(), source.clone());
        source
    }
}

/// Display label for a source: the first dot-separated component of the
/// page title (titles are usually domain names here), or the full title
/// when it has no dot.
fn derive_label(title: &str) -> String {
    match title.split_once('.') {
        Some((first, _)) if !first.is_empty() => first.to_string(),
        _ => title.to_string(),
    }
}

/// Map grounding supports onto citation records. Supports without an end
/// offset are skipped; chunk indices that fall outside the chunk list are
/// ignored rather than failing the worker.
pub fn build_citations(
    chunks: &[GroundingChunk],
    supports: &[GroundingSupport],
    resolver: &UrlResolver,
    worker_id: usize,
) -> Vec<Citation> {
    let mut citations = Vec::new();

    for support in supports {
        let end_index = match support.segment.end_index {
            Some(end) => end,
            None => continue,
        };
        let start_index = support.segment.start_index.unwrap_or(0);

        let mut segments = Vec::new();
        for &chunk_index in &support.grounding_chunk_indices {
            if let Some(chunk) = chunks.get(chunk_index) {
                segments.push(resolver.resolve(&chunk.web.uri, &chunk.web.title, worker_id));
            }
        }

        citations.push(Citation {
            start_index,
            end_index,
            segments,
        });
    }

    citations
}

/// Insert ` [label](short_url)` markers into `text` at each citation's end
/// offset. Offsets are character offsets into the original text, so
/// insertion proceeds in descending end-offset order: earlier insertions
/// never shift the positions of later ones.
pub fn insert_citation_markers(text: &str, citations: &[Citation]) -> String {
    let mut sorted: Vec<&Citation> = citations.iter().collect();
    sorted.sort_by(|a, b| {
        b.end_index
            .cmp(&a.end_index)
            .then(b.start_index.cmp(&a.start_index))
    });

    let mut modified = text.to_string();
    for citation in sorted {
        let mut marker = String::new();
        for segment in &citation.segments {
            marker.push_str(&format!(" [{}]({})", segment.label, segment.short_url));
        }
        let at = char_to_byte_offset(text, citation.end_index);
        modified.insert_str(at, &marker);
    }
    modified
}

/// Byte position of the given character offset in the original text,
/// clamped to the end (grounding offsets can overrun the returned text).
fn char_to_byte_offset(text: &str, char_offset: usize) -> usize {
    text.char_indices()
        .nth(char_offset)
        .map(|(byte_idx, _)| byte_idx)
        .unwrap_or(text.len())
}
