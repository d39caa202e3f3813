use std::collections::HashMap;

/// One dot-separated segment of a wildcard pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    /// A bare `*`.
    Any,
    /// Anything else with glob syntax (`cpu*`, `{a,b}`, `?`, `[0-9]`).
    Glob(String),
}

impl Segment {
    fn parse(s: &str) -> Segment {
        if s == "*" {
            Segment::Any
        } else if s.contains(['*', '?', '[', '{']) {
            Segment::Glob(s.to_string())
        } else {
            Segment::Literal(s.to_string())
        }
    }
}

/// Splits a wildcard pattern into segments. Returns `None` for patterns the
/// trie cannot hold (empty, or with an empty segment).
pub fn compile(pattern: &str) -> Option<Vec<Segment>> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return None;
    }
    let mut out = Vec::new();
    for seg in pattern.split('.') {
        if seg.is_empty() {
            return None;
        }
        out.push(Segment::parse(seg));
    }
    Some(out)
}

#[derive(Debug, Default)]
struct Node {
    literal: HashMap<String, Node>,
    any: Option<Box<Node>>,
    globs: Vec<(String, Node)>,
    terminals: Vec<usize>,
}

/// Trie over dot-segmented wildcard patterns.
#[derive(Debug, Default)]
pub struct WildcardTrie {
    root: Node,
    len: usize,
}

impl WildcardTrie {
    pub fn insert(&mut self, segments: &[Segment], id: usize) {
        let mut node = &mut self.root;
        for seg in segments {
            node = match seg {
                Segment::Literal(s) => node.literal.entry(s.clone()).or_default(),
                Segment::Any => &mut **node.any.get_or_insert_with(Box::default),
                Segment::Glob(g) => {
                    let idx = match node.globs.iter().position(|(p, _)| p == g) {
                        Some(idx) => idx,
                        None => {
                            node.globs.push((g.clone(), Node::default()));
                            node.globs.len() - 1
                        }
                    };
                    &mut node.globs[idx].1
                }
            };
        }
        node.terminals.push(id);
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Ids of every pattern matching `metric`, appended to `out`.
    pub fn matches(&self, metric: &str, out: &mut Vec<usize>) {
        let segments: Vec<&str> = metric.split('.').collect();
        walk(&self.root, &segments, out);
    }
}

fn walk(node: &Node, rest: &[&str], out: &mut Vec<usize>) {
    let Some((head, tail)) = rest.split_first() else {
        out.extend_from_slice(&node.terminals);
        return;
    };
    if let Some(child) = node.literal.get(*head) {
        walk(child, tail, out);
    }
    if let Some(child) = &node.any {
        walk(child, tail, out);
    }
    for (glob, child) in &node.globs {
        if glob_match::glob_match(glob, head) {
            walk(child, tail, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trie(patterns: &[&str]) -> WildcardTrie {
        let mut t = WildcardTrie::default();
        for (i, p) in patterns.iter().enumerate() {
            t.insert(&compile(p).unwrap(), i);
        }
        t
    }

    fn matched(t: &WildcardTrie, metric: &str) -> Vec<usize> {
        let mut out = Vec::new();
        t.matches(metric, &mut out);
        out.sort_unstable();
        out
    }

    #[test]
    fn literal_star_and_braces() {
        let t = trie(&[
            "server.web1.cpu",
            "server.*.cpu",
            "server.{web1,web2}.cpu",
            "server.web*.mem",
            "server.*",
        ]);
        assert_eq!(matched(&t, "server.web1.cpu"), vec![0, 1, 2]);
        assert_eq!(matched(&t, "server.db1.cpu"), vec![1]);
        assert_eq!(matched(&t, "server.web9.mem"), vec![3]);
        assert_eq!(matched(&t, "server.x"), vec![4]);
        assert!(matched(&t, "server.web1.cpu.extra").is_empty());
    }

    #[test]
    fn rejects_empty_segments() {
        assert!(compile("a..b").is_none());
        assert!(compile("").is_none());
        assert_eq!(
            compile("a.*.c*").unwrap(),
            vec![
                Segment::Literal("a".into()),
                Segment::Any,
                Segment::Glob("c*".into())
            ]
        );
    }
}
