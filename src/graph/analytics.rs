//! Graph analytics over the evidence graph.
//!
//! By default both measures run on the citation subgraph only (Page nodes
//! and cites edges), keeping Fragment/Claim structure out of the scores.
//! Cycles are valid in citations (A cites B cites A via later editions);
//! the damping factor handles sinks and cycles, so no topological ordering
//! is attempted.

use crate::graph::engine::EvidenceGraph;
use std::collections::{HashMap, HashSet, VecDeque};

/// Damping factor for PageRank.
const DAMPING: f64 = 0.85;
/// Convergence threshold on the L1 delta between iterations.
const EPSILON: f64 = 1e-8;
/// Iteration cap.
const MAX_ITERATIONS: usize = 100;

/// Directed graph snapshot used by the analytics passes.
#[derive(Debug, Clone, Default)]
pub struct AnalyticsGraph {
    nodes: Vec<String>,
    edges: Vec<(String, String)>,
}

impl AnalyticsGraph {
    /// Citation subgraph: Page nodes and cites edges.
    pub fn citation_only(graph: &EvidenceGraph) -> Self {
        let mut nodes: HashSet<String> = graph
            .source_pages()
            .iter()
            .map(|p| p.to_string())
            .collect();
        let mut edges = Vec::new();
        for edge in graph.cites_edges() {
            nodes.insert(edge.source_id.clone());
            nodes.insert(edge.target_id.clone());
            edges.push((edge.source_id.clone(), edge.target_id.clone()));
        }
        let mut nodes: Vec<String> = nodes.into_iter().collect();
        nodes.sort();
        Self { nodes, edges }
    }

    /// Full graph: pages, claims and fragments with every edge, including
    /// the derived evidence_source edges.
    pub fn full(graph: &EvidenceGraph) -> Self {
        let mut built = Self::citation_only(graph);
        let mut nodes: HashSet<String> = built.nodes.drain(..).collect();
        for edge in graph.nli_edges() {
            nodes.insert(edge.source_id.clone());
            nodes.insert(edge.target_id.clone());
            built
                .edges
                .push((edge.source_id.clone(), edge.target_id.clone()));
        }
        for derived in graph.evidence_source_edges() {
            let source = derived.claim_id.to_string();
            let target = derived.page_id.to_string();
            nodes.insert(source.clone());
            nodes.insert(target.clone());
            built.edges.push((source, target));
        }
        built.nodes = nodes.into_iter().collect();
        built.nodes.sort();
        built
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}

/// PageRank over the snapshot. Returns node -> score; scores sum to ~1.
pub fn calculate_pagerank(graph: &AnalyticsGraph) -> HashMap<String, f64> {
    let n = graph.nodes.len();
    if n == 0 {
        return HashMap::new();
    }

    let index: HashMap<&str, usize> = graph
        .nodes
        .iter()
        .enumerate()
        .map(|(i, node)| (node.as_str(), i))
        .collect();

    let mut out_links: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (source, target) in &graph.edges {
        if let (Some(&s), Some(&t)) = (index.get(source.as_str()), index.get(target.as_str())) {
            out_links[s].push(t);
        }
    }

    let mut rank = vec![1.0 / n as f64; n];
    for _ in 0..MAX_ITERATIONS {
        let mut next = vec![(1.0 - DAMPING) / n as f64; n];
        let mut sink_mass = 0.0;
        for (i, targets) in out_links.iter().enumerate() {
            if targets.is_empty() {
                sink_mass += rank[i];
            } else {
                let share = DAMPING * rank[i] / targets.len() as f64;
                for &t in targets {
                    next[t] += share;
                }
            }
        }
        // Sink mass is redistributed uniformly; cycles need no special case.
        let sink_share = DAMPING * sink_mass / n as f64;
        for value in next.iter_mut() {
            *value += sink_share;
        }

        let delta: f64 = rank
            .iter()
            .zip(next.iter())
            .map(|(a, b)| (a - b).abs())
            .sum();
        rank = next;
        if delta < EPSILON {
            break;
        }
    }

    graph
        .nodes
        .iter()
        .enumerate()
        .map(|(i, node)| (node.clone(), rank[i]))
        .collect()
}

/// Betweenness centrality (Brandes, unweighted, directed).
pub fn calculate_betweenness_centrality(graph: &AnalyticsGraph) -> HashMap<String, f64> {
    let n = graph.nodes.len();
    let index: HashMap<&str, usize> = graph
        .nodes
        .iter()
        .enumerate()
        .map(|(i, node)| (node.as_str(), i))
        .collect();

    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (source, target) in &graph.edges {
        if let (Some(&s), Some(&t)) = (index.get(source.as_str()), index.get(target.as_str())) {
            adjacency[s].push(t);
        }
    }

    let mut centrality = vec![0.0f64; n];
    for s in 0..n {
        let mut stack = Vec::new();
        let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut sigma = vec![0.0f64; n];
        let mut distance = vec![-1i64; n];
        sigma[s] = 1.0;
        distance[s] = 0;

        let mut queue = VecDeque::new();
        queue.push_back(s);
        while let Some(v) = queue.pop_front() {
            stack.push(v);
            for &w in &adjacency[v] {
                if distance[w] < 0 {
                    distance[w] = distance[v] + 1;
                    queue.push_back(w);
                }
                if distance[w] == distance[v] + 1 {
                    sigma[w] += sigma[v];
                    predecessors[w].push(v);
                }
            }
        }

        let mut delta = vec![0.0f64; n];
        while let Some(w) = stack.pop() {
            for &v in &predecessors[w] {
                delta[v] += (sigma[v] / sigma[w]) * (1.0 + delta[w]);
            }
            if w != s {
                centrality[w] += delta[w];
            }
        }
    }

    graph
        .nodes
        .iter()
        .enumerate()
        .map(|(i, node)| (node.clone(), centrality[i]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_of(nodes: &[&str], edges: &[(&str, &str)]) -> AnalyticsGraph {
        AnalyticsGraph {
            nodes: nodes.iter().map(|s| s.to_string()).collect(),
            edges: edges
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_pagerank_sums_to_one() {
        let g = graph_of(&["a", "b", "c"], &[("a", "b"), ("b", "c"), ("c", "a")]);
        let ranks = calculate_pagerank(&g);
        let total: f64 = ranks.values().sum();
        assert!((total - 1.0).abs() < 1e-6);
        // Symmetric cycle: equal ranks.
        assert!((ranks["a"] - ranks["b"]).abs() < 1e-6);
        assert!((ranks["b"] - ranks["c"]).abs() < 1e-6);
    }

    #[test]
    fn test_pagerank_converges_on_cycles() {
        // A cites B cites A, with a third page pointed at by both.
        let g = graph_of(
            &["a", "b", "hub"],
            &[("a", "b"), ("b", "a"), ("a", "hub"), ("b", "hub")],
        );
        let ranks = calculate_pagerank(&g);
        assert!(ranks["hub"] > 0.0);
        let total: f64 = ranks.values().sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_pagerank_favors_cited_node() {
        let g = graph_of(
            &["a", "b", "c", "popular"],
            &[("a", "popular"), ("b", "popular"), ("c", "popular")],
        );
        let ranks = calculate_pagerank(&g);
        assert!(ranks["popular"] > ranks["a"]);
    }

    #[test]
    fn test_betweenness_middle_node() {
        // a -> m -> b: m carries the only path.
        let g = graph_of(&["a", "m", "b"], &[("a", "m"), ("m", "b")]);
        let centrality = calculate_betweenness_centrality(&g);
        assert!(centrality["m"] > 0.0);
        assert_eq!(centrality["a"], 0.0);
        assert_eq!(centrality["b"], 0.0);
    }

    #[test]
    fn test_empty_graph() {
        let g = AnalyticsGraph::default();
        assert!(calculate_pagerank(&g).is_empty());
        assert!(calculate_betweenness_centrality(&g).is_empty());
    }
}
