//! Minimum-weight spanning arborescence (Chu-Liu/Edmonds).
//!
//! `petgraph` offers spanning trees for undirected graphs only, so the
//! directed variant lives here. [`edmonds`] works on a dense edge list;
//! [`min_spanning_arborescence`] adapts it to a [`CallGraph`] rooted at the
//! entry vertex.

use crate::callgraph::CallGraph;
use petgraph::stable_graph::NodeIndex;
use std::collections::HashMap;

const NONE: usize = usize::MAX;

/// Leftist min-heap of candidate in-edges with a lazy weight offset per
/// subtree. Merging walks right spines only, so its depth is logarithmic.
struct EdgeHeap {
    nodes: Vec<HeapNode>,
}

struct HeapNode {
    edge: usize,
    key: i64,
    delta: i64,
    left: usize,
    right: usize,
    rank: u32,
}

impl EdgeHeap {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
        }
    }

    fn singleton(&mut self, edge: usize, key: i64) -> usize {
        self.nodes.push(HeapNode {
            edge,
            key,
            delta: 0,
            left: NONE,
            right: NONE,
            rank: 1,
        });
        self.nodes.len() - 1
    }

    fn rank(&self, node: usize) -> u32 {
        if node == NONE { 0 } else { self.nodes[node].rank }
    }

    fn push_down(&mut self, node: usize) {
        let delta = self.nodes[node].delta;
        if delta == 0 {
            return;
        }
        self.nodes[node].key += delta;
        self.nodes[node].delta = 0;
        for child in [self.nodes[node].left, self.nodes[node].right] {
            if child != NONE {
                self.nodes[child].delta += delta;
            }
        }
    }

    fn merge(&mut self, a: usize, b: usize) -> usize {
        if a == NONE {
            return b;
        }
        if b == NONE {
            return a;
        }
        self.push_down(a);
        self.push_down(b);
        let (na, nb) = (&self.nodes[a], &self.nodes[b]);
        let (top, other) = if (nb.key, nb.edge) < (na.key, na.edge) { (b, a) } else { (a, b) };
        let right = self.merge(self.nodes[top].right, other);
        let left = self.nodes[top].left;
        let (left, right) = if self.rank(left) < self.rank(right) { (right, left) } else { (left, right) };
        let rank = self.rank(right) + 1;
        let node = &mut self.nodes[top];
        node.left = left;
        node.right = right;
        node.rank = rank;
        top
    }

    /// `(edge, current weight)` at the top of a non-empty heap.
    fn top(&mut self, root: usize) -> (usize, i64) {
        self.push_down(root);
        (self.nodes[root].edge, self.nodes[root].key)
    }

    fn pop(&mut self, root: usize) -> usize {
        self.push_down(root);
        self.merge(self.nodes[root].left, self.nodes[root].right)
    }

    fn shift(&mut self, root: usize, delta: i64) {
        self.nodes[root].delta += delta;
    }
}

/// Union-find by size without path compression, so unions can be undone.
struct RollbackUnionFind {
    parent: Vec<usize>,
    size: Vec<usize>,
    history: Vec<(usize, usize)>,
}

impl RollbackUnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            size: vec![1; n],
            history: Vec::new(),
        }
    }

    fn find(&self, mut v: usize) -> usize {
        while self.parent[v] != v {
            v = self.parent[v];
        }
        v
    }

    fn union(&mut self, a: usize, b: usize) -> bool {
        let (mut a, mut b) = (self.find(a), self.find(b));
        if a == b {
            return false;
        }
        if self.size[a] < self.size[b] {
            std::mem::swap(&mut a, &mut b);
        }
        self.parent[b] = a;
        self.size[a] += self.size[b];
        self.history.push((a, b));
        true
    }

    fn time(&self) -> usize {
        self.history.len()
    }

    fn rollback(&mut self, time: usize) {
        while self.history.len() > time {
            let Some((a, b)) = self.history.pop() else {
                break;
            };
            self.parent[b] = b;
            self.size[a] -= self.size[b];
        }
    }
}

/// A contracted cycle: its representative at contraction time, the
/// union-find time before the contraction, and the cycle's chosen edges.
struct Contraction {
    rep: usize,
    time: usize,
    edges: Vec<usize>,
}

/// Picks, for every vertex except `root`, one incoming edge so that the chosen
/// edges form a spanning arborescence of minimum total weight.
///
/// `edges` holds `(source, target, weight)` over vertices `0..n`. Returns the
/// indices of the chosen edges ordered by target, or `None` if some vertex
/// cannot be reached from `root`. Among equally light candidate edges the
/// lowest index wins.
///
/// Cycles are contracted by merging the candidate heaps of their vertices
/// (Tarjan's formulation, `O(E log V)`), so neither the call stack nor
/// memory grows with the nesting depth of the contractions.
pub fn edmonds(n: usize, root: usize, edges: &[(usize, usize, i64)]) -> Option<Vec<usize>> {
    if root >= n {
        return None;
    }
    let mut heap = EdgeHeap::with_capacity(edges.len());
    let mut queue = vec![NONE; n];
    for (i, &(u, v, w)) in edges.iter().enumerate() {
        if u == v || v == root {
            continue;
        }
        let node = heap.singleton(i, w);
        queue[v] = heap.merge(queue[v], node);
    }

    let mut uf = RollbackUnionFind::new(n);
    let mut seen = vec![NONE; n];
    seen[root] = root;
    let mut incoming = vec![NONE; n];
    let mut contractions: Vec<Contraction> = Vec::new();
    let mut path: Vec<usize> = Vec::new();
    let mut picked: Vec<usize> = Vec::new();

    for start in 0..n {
        path.clear();
        picked.clear();
        let mut u = start;
        while seen[u] == NONE {
            let (edge, weight) = loop {
                if queue[u] == NONE {
                    return None;
                }
                let (edge, weight) = heap.top(queue[u]);
                if uf.find(edges[edge].0) == u {
                    // Internal to an already contracted cycle.
                    queue[u] = heap.pop(queue[u]);
                    continue;
                }
                break (edge, weight);
            };
            heap.shift(queue[u], -weight);
            queue[u] = heap.pop(queue[u]);
            path.push(u);
            picked.push(edge);
            seen[u] = start;
            u = uf.find(edges[edge].0);

            if seen[u] == start {
                let time = uf.time();
                let end = path.len();
                let mut merged = NONE;
                let mut k = end;
                loop {
                    k -= 1;
                    let w = path[k];
                    merged = heap.merge(merged, queue[w]);
                    if !uf.union(u, w) {
                        break;
                    }
                }
                let rep = uf.find(u);
                queue[rep] = merged;
                seen[rep] = NONE;
                contractions.push(Contraction {
                    rep,
                    time,
                    edges: picked[k..end].to_vec(),
                });
                path.truncate(k);
                picked.truncate(k);
                u = rep;
            }
        }
        for &edge in &picked {
            incoming[uf.find(edges[edge].1)] = edge;
        }
    }

    // Expand the contractions newest first: every cycle keeps its own edges
    // except the one into the vertex where the cycle is entered.
    for contraction in contractions.into_iter().rev() {
        uf.rollback(contraction.time);
        let entering = incoming[contraction.rep];
        for &edge in &contraction.edges {
            incoming[uf.find(edges[edge].1)] = edge;
        }
        if entering != NONE {
            incoming[uf.find(edges[entering].1)] = entering;
        }
    }

    let mut chosen = Vec::with_capacity(n.saturating_sub(1));
    for (v, &edge) in incoming.iter().enumerate() {
        if v == root {
            continue;
        }
        if edge == NONE {
            return None;
        }
        chosen.push(edge);
    }
    Some(chosen)
}

/// Spanning arborescence of a call graph, rooted at its entry vertex.
#[derive(Debug, Clone)]
pub struct Arborescence {
    root: NodeIndex,
    parent: HashMap<NodeIndex, NodeIndex>,
    children: HashMap<NodeIndex, Vec<NodeIndex>>,
    edges: Vec<(NodeIndex, NodeIndex)>,
}

impl Arborescence {
    pub fn root(&self) -> NodeIndex {
        self.root
    }

    pub fn parent(&self, node: NodeIndex) -> Option<NodeIndex> {
        self.parent.get(&node).copied()
    }

    pub fn children(&self, node: NodeIndex) -> &[NodeIndex] {
        self.children.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Tree edges as `(parent, child)`, ordered by child.
    pub fn edges(&self) -> &[(NodeIndex, NodeIndex)] {
        &self.edges
    }

    pub fn vertex_count(&self) -> usize {
        self.parent.len() + 1
    }

    /// Every vertex after all of its descendants; the root comes last.
    pub fn post_order(&self) -> Vec<NodeIndex> {
        let mut order = Vec::with_capacity(self.vertex_count());
        let mut stack = vec![(self.root, false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(node);
                continue;
            }
            stack.push((node, true));
            for &child in self.children(node).iter().rev() {
                stack.push((child, false));
            }
        }
        order
    }
}

/// Minimum-weight arborescence over the call graph's edge weights, or `None`
/// when some vertex is unreachable from the entry.
pub fn min_spanning_arborescence(graph: &CallGraph) -> Option<Arborescence> {
    let nodes = graph.nodes();
    let dense: HashMap<NodeIndex, usize> = nodes.iter().enumerate().map(|(i, &n)| (n, i)).collect();
    let edge_list = graph.edge_list();
    let edges: Vec<(usize, usize, i64)> = edge_list
        .iter()
        .map(|&(a, b, w)| (dense[&a], dense[&b], i64::from(w)))
        .collect();
    let root = graph.entry();
    let chosen = edmonds(nodes.len(), dense[&root], &edges)?;

    let mut tree_edges: Vec<(NodeIndex, NodeIndex)> = chosen
        .into_iter()
        .map(|i| (edge_list[i].0, edge_list[i].1))
        .collect();
    tree_edges.sort_by_key(|&(_, child)| dense[&child]);

    let mut parent = HashMap::new();
    let mut children: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
    for &(p, c) in &tree_edges {
        parent.insert(c, p);
        children.entry(p).or_default().push(c);
    }
    Some(Arborescence {
        root,
        parent,
        children,
        edges: tree_edges,
    })
}
