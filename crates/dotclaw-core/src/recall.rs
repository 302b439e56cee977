//! Per-group memory recall.
//!
//! Builds the handful of one-line memory strings injected into a turn:
//! hybrid keyword + vector retrieval with diversification, stop-word
//! handling, and token-budget packing, plus the compact user-profile
//! fragment. Backed by [`MemoryStore`]; vector similarity participates
//! only when an [`Embedder`] is configured.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use dotclaw_store::{MemoryFilter, MemoryStore, ScoredMemory};
use dotclaw_types::config::RecallConfig;
use dotclaw_types::memory::MemoryStats;

/// Narrow interface over recall so alternate memory backends can be
/// swapped in.
#[async_trait]
pub trait RecallBackend: Send + Sync {
    /// Ordered recall lines for one turn, each prefixed `(type) `.
    async fn build_recall(
        &self,
        group_folder: &str,
        user_id: &str,
        query: &str,
        max_results: u32,
        max_tokens: u32,
    ) -> Vec<String>;

    /// Compact prompt fragment describing the user, when anything is
    /// known about them.
    async fn build_user_profile(&self, group_folder: &str, user_id: &str) -> Option<String>;

    /// Store statistics for the group.
    async fn stats(&self, group_folder: &str) -> MemoryStats;
}

/// Produces embedding vectors for content and queries.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed one text; `None` when the backend is unavailable.
    async fn embed(&self, text: &str) -> Option<Vec<f32>>;
}

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "my", "me", "i", "you", "your", "of", "to", "in", "on",
    "for", "with", "is", "are", "was", "were", "be", "it", "this", "that", "do", "does", "did",
    "can", "could", "please", "about", "what", "when", "how", "who",
];

const GREETINGS: &[&str] = &[
    "hi", "hello", "hey", "yo", "sup", "ok", "okay", "thanks", "thank you", "bye", "good morning",
    "good night", "lol", "nice",
];

const MEMORY_INTENT: &[&str] = &[
    "remember",
    "previously",
    "last time",
    "you said",
    "recall",
    "remind me what",
    "we discussed",
];

/// Most recent query tokens kept after normalization.
const MAX_QUERY_TOKENS: usize = 12;
/// Character budget for the normalized query.
const MAX_QUERY_CHARS: usize = 200;
/// Per-line cap for recall output.
const MAX_LINE_CHARS: usize = 200;
/// Total cap for the user profile fragment.
const MAX_PROFILE_CHARS: usize = 1200;
/// Per-item cap inside the user profile.
const MAX_PROFILE_ITEM_CHARS: usize = 140;

/// Hybrid keyword/vector recall over the memory store.
pub struct HybridRecall {
    store: MemoryStore,
    embedder: Option<Arc<dyn Embedder>>,
    cfg: RecallConfig,
}

impl HybridRecall {
    /// Build a recall backend. `embedder` enables the vector path only
    /// when `cfg.embeddings_enabled` is also set.
    pub fn new(store: MemoryStore, embedder: Option<Arc<dyn Embedder>>, cfg: RecallConfig) -> Self {
        Self {
            store,
            embedder,
            cfg,
        }
    }

    /// Embed rows missing an embedding (batch backfill). Returns how many
    /// rows were updated.
    pub async fn backfill_embeddings(&self, batch: u32) -> usize {
        let Some(embedder) = self.embedder.as_ref().filter(|_| self.cfg.embeddings_enabled) else {
            return 0;
        };
        let Ok(missing) = self.store.missing_embeddings(batch).await else {
            return 0;
        };
        let mut updated = 0;
        for (id, content) in missing {
            if let Some(vector) = embedder.embed(&content).await
                && self.store.set_embedding(&id, vector).await.is_ok()
            {
                updated += 1;
            }
        }
        updated
    }
}

/// Lowercase, strip stop words, keep the most recent tokens within a
/// character budget.
pub fn normalize_query(query: &str) -> Vec<String> {
    let tokens: Vec<String> = query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1 && !STOP_WORDS.contains(t))
        .map(str::to_string)
        .collect();

    let start = tokens.len().saturating_sub(MAX_QUERY_TOKENS);
    let mut kept: Vec<String> = tokens[start..].to_vec();
    while kept.iter().map(|t| t.len() + 1).sum::<usize>() > MAX_QUERY_CHARS {
        kept.remove(0);
    }
    kept
}

/// Whether a prompt is too low-signal to recall for. Explicit memory
/// intent always bypasses the short-circuit.
pub fn is_low_signal(query: &str) -> bool {
    let trimmed = query.trim().to_lowercase();
    if MEMORY_INTENT.iter().any(|m| trimmed.contains(m)) {
        return false;
    }
    if trimmed.len() < 12 {
        return true;
    }
    GREETINGS.contains(&trimmed.trim_end_matches(['!', '.', '?']))
}

/// Leading topic keyword of a memory's content: its first non-stop-word
/// token.
fn topic_keyword(content: &str) -> String {
    content
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .find(|t| t.len() > 1 && !STOP_WORDS.contains(t))
        .unwrap_or_default()
        .to_string()
}

fn one_line(content: &str) -> String {
    let flat = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.len() > MAX_LINE_CHARS {
        let cut = floor_char_boundary(&flat, MAX_LINE_CHARS);
        format!("{}…", &flat[..cut])
    } else {
        flat
    }
}

fn floor_char_boundary(s: &str, mut at: usize) -> usize {
    while at > 0 && !s.is_char_boundary(at) {
        at -= 1;
    }
    at
}

/// Merge keyword and vector hits into one ranked list.
///
/// Scores from each path are normalized by their maximum, then combined
/// with `vector_weight`. An item found by both paths gets both
/// contributions.
fn merge_hits(
    keyword: Vec<ScoredMemory>,
    vector: Vec<ScoredMemory>,
    vector_weight: f64,
) -> Vec<ScoredMemory> {
    fn normalized(hits: &[ScoredMemory]) -> HashMap<String, f64> {
        let max = hits.iter().map(|h| h.score).fold(f64::MIN, f64::max);
        hits.iter()
            .map(|h| {
                let norm = if max > 0.0 { h.score / max } else { 1.0 };
                (h.item.id.clone(), norm)
            })
            .collect()
    }

    let kw_scores = normalized(&keyword);
    let vec_scores = normalized(&vector);

    let mut merged: HashMap<String, ScoredMemory> = HashMap::new();
    for hit in keyword.into_iter().chain(vector) {
        merged.entry(hit.item.id.clone()).or_insert(hit);
    }

    let mut out: Vec<ScoredMemory> = merged
        .into_values()
        .map(|mut hit| {
            let kw = kw_scores.get(&hit.item.id).copied().unwrap_or(0.0);
            let vec = vec_scores.get(&hit.item.id).copied().unwrap_or(0.0);
            hit.score = (1.0 - vector_weight) * kw + vector_weight * vec;
            hit
        })
        .collect();
    out.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    out
}

/// Diversify a ranked list: at most two items per leading topic keyword,
/// and types spread across the top via round-robin over kinds.
fn diversify(hits: Vec<ScoredMemory>, max_results: usize) -> Vec<ScoredMemory> {
    let mut topic_counts: HashMap<String, usize> = HashMap::new();
    let mut buckets: Vec<(String, std::collections::VecDeque<ScoredMemory>)> = Vec::new();

    for hit in hits {
        let topic = topic_keyword(&hit.item.content);
        let count = topic_counts.entry(topic).or_insert(0);
        if *count >= 2 {
            continue;
        }
        *count += 1;
        match buckets.iter_mut().find(|(kind, _)| *kind == hit.item.kind) {
            Some((_, bucket)) => bucket.push_back(hit),
            None => {
                let kind = hit.item.kind.clone();
                let mut bucket = std::collections::VecDeque::new();
                bucket.push_back(hit);
                buckets.push((kind, bucket));
            }
        }
    }

    let mut out = Vec::new();
    while out.len() < max_results {
        let mut progressed = false;
        for (_, bucket) in buckets.iter_mut() {
            if let Some(hit) = bucket.pop_front() {
                out.push(hit);
                progressed = true;
                if out.len() == max_results {
                    break;
                }
            }
        }
        if !progressed {
            break;
        }
    }
    out
}

/// Pack diversified hits into the token budget, keeping the
/// highest-importance items first.
fn pack(hits: Vec<ScoredMemory>, max_tokens: u32) -> Vec<String> {
    let mut by_importance = hits;
    by_importance.sort_by(|a, b| {
        b.item
            .importance
            .partial_cmp(&a.item.importance)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let budget = max_tokens as usize * 4;
    let mut used = 0;
    let mut out = Vec::new();
    for hit in by_importance {
        let line = format!("({}) {}", hit.item.kind, one_line(&hit.item.content));
        if used + line.len() > budget && !out.is_empty() {
            continue;
        }
        used += line.len();
        out.push(line);
    }
    out
}

#[async_trait]
impl RecallBackend for HybridRecall {
    async fn build_recall(
        &self,
        group_folder: &str,
        _user_id: &str,
        query: &str,
        max_results: u32,
        max_tokens: u32,
    ) -> Vec<String> {
        if max_results == 0 || max_tokens == 0 || is_low_signal(query) {
            return Vec::new();
        }
        let tokens = normalize_query(query);
        if tokens.is_empty() {
            return Vec::new();
        }

        let overfetch = max_results * 3;
        let keyword = self
            .store
            .search_keyword(group_folder, &tokens, overfetch)
            .await
            .unwrap_or_default();

        let vector = match (&self.embedder, self.cfg.embeddings_enabled) {
            (Some(embedder), true) => match embedder.embed(query).await {
                Some(embedding) => self
                    .store
                    .search_vector(group_folder, embedding, overfetch)
                    .await
                    .unwrap_or_default(),
                None => Vec::new(),
            },
            _ => Vec::new(),
        };

        let merged = merge_hits(keyword, vector, self.cfg.vector_weight);
        let diversified = diversify(merged, max_results as usize);
        let lines = pack(diversified, max_tokens);
        debug!(group = group_folder, lines = lines.len(), "built recall");
        lines
    }

    async fn build_user_profile(&self, group_folder: &str, user_id: &str) -> Option<String> {
        let items = self
            .store
            .list(
                group_folder,
                MemoryFilter {
                    scope: Some(dotclaw_types::memory::MemoryScope::User),
                    subject_id: Some(user_id.to_string()),
                    kind: None,
                },
                50,
            )
            .await
            .ok()?;
        if items.is_empty() {
            return None;
        }

        // Preferences and relationships surface before generic facts.
        let mut ordered = items;
        ordered.sort_by_key(|item| match item.kind.as_str() {
            "preference" => 0,
            "relationship" => 1,
            _ => 2,
        });

        let mut out = String::from("Known about this user:\n");
        for item in ordered {
            let mut line = one_line(&item.content);
            if line.len() > MAX_PROFILE_ITEM_CHARS {
                let cut = floor_char_boundary(&line, MAX_PROFILE_ITEM_CHARS);
                line = format!("{}…", &line[..cut]);
            }
            let entry = format!("- ({}) {}\n", item.kind, line);
            if out.len() + entry.len() > MAX_PROFILE_CHARS {
                out.push('…');
                break;
            }
            out.push_str(&entry);
        }
        Some(out.trim_end().to_string())
    }

    async fn stats(&self, group_folder: &str) -> MemoryStats {
        self.store.stats(group_folder).await.unwrap_or_default()
    }
}
