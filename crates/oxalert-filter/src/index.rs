use crate::parser::ParsedMetric;
use crate::tags::{self, TagClause, TagIndex};
use crate::wildcard::{self, Segment, WildcardTrie};
use arc_swap::ArcSwap;
use oxalert_common::types::is_tag_pattern;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

type PatternHash = [u8; 32];

fn hash_pattern(pattern: &str) -> PatternHash {
    Sha256::digest(pattern.as_bytes()).into()
}

#[derive(Debug, Clone)]
enum Compiled {
    Wildcard(Vec<Segment>),
    Tags(Vec<TagClause>),
}

fn compile(pattern: &str) -> Option<Compiled> {
    if is_tag_pattern(pattern) {
        match tags::parse_selector(pattern) {
            Ok(clauses) => Some(Compiled::Tags(clauses)),
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "Dropping invalid pattern");
                None
            }
        }
    } else {
        let compiled = wildcard::compile(pattern).map(Compiled::Wildcard);
        if compiled.is_none() {
            tracing::warn!(pattern = %pattern, "Dropping invalid pattern");
        }
        compiled
    }
}

/// Immutable snapshot of the compiled pattern set.
#[derive(Debug, Default)]
pub struct PatternIndex {
    patterns: Vec<String>,
    trie: WildcardTrie,
    tags: TagIndex,
}

impl PatternIndex {
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Patterns in the snapshot, in insertion order.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Patterns matching a series. The order is deterministic for a given
    /// snapshot.
    pub fn matches(&self, name: &str, labels: &BTreeMap<String, String>) -> Vec<String> {
        let mut ids = Vec::new();
        if labels.is_empty() {
            self.trie.matches(name, &mut ids);
        }
        self.tags.matches(name, labels, &mut ids);
        ids.sort_unstable();
        ids.dedup();
        ids.into_iter().map(|i| self.patterns[i].clone()).collect()
    }

    pub fn match_metric(&self, metric: &ParsedMetric) -> Vec<String> {
        self.matches(&metric.metric, &metric.labels)
    }
}

/// Copy-on-write holder of the current [`PatternIndex`].
///
/// Readers load the current snapshot without locking; [`refresh`] builds a
/// new one and swaps it in. Compiled patterns are kept between refreshes,
/// keyed by the SHA-256 of the pattern text, so a refresh only compiles what
/// changed.
///
/// [`refresh`]: PatternMatcher::refresh
pub struct PatternMatcher {
    current: ArcSwap<PatternIndex>,
    cache: Mutex<HashMap<PatternHash, Arc<Compiled>>>,
    fallback_warn_threshold: usize,
}

impl PatternMatcher {
    pub fn new(fallback_warn_threshold: usize) -> Self {
        Self {
            current: ArcSwap::from_pointee(PatternIndex::default()),
            cache: Mutex::new(HashMap::new()),
            fallback_warn_threshold,
        }
    }

    pub fn load(&self) -> Arc<PatternIndex> {
        self.current.load_full()
    }

    /// Rebuilds the index from `patterns` and publishes it. Invalid patterns
    /// are logged and skipped. Returns the number of patterns indexed.
    pub fn refresh(&self, patterns: &[String]) -> usize {
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut index = PatternIndex::default();
        let mut live: HashMap<PatternHash, Arc<Compiled>> = HashMap::with_capacity(patterns.len());
        for pattern in patterns {
            let hash = hash_pattern(pattern);
            let compiled = match live.get(&hash).or_else(|| cache.get(&hash)) {
                Some(c) => Arc::clone(c),
                None => match compile(pattern) {
                    Some(c) => Arc::new(c),
                    None => continue,
                },
            };
            if live.insert(hash, Arc::clone(&compiled)).is_some() {
                continue;
            }
            let id = index.patterns.len();
            index.patterns.push(pattern.clone());
            match compiled.as_ref() {
                Compiled::Wildcard(segments) => index.trie.insert(segments, id),
                Compiled::Tags(clauses) => index.tags.insert(clauses.clone(), id),
            }
        }
        *cache = live;

        if index.tags.fallback_len() > self.fallback_warn_threshold {
            tracing::warn!(
                fallback = index.tags.fallback_len(),
                threshold = self.fallback_warn_threshold,
                "Many tag patterns lack an equality clause; matching them is linear"
            );
        }
        let count = index.len();
        self.current.store(Arc::new(index));
        count
    }
}
