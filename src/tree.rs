//! Dependency graph of processes.
//!
//! Edges point from a dependency to its dependent, so `prev` of a node is the
//! set of its incoming neighbours and `next` the outgoing ones. The tree owns a
//! strong reference to every registered process, processes only hold weak
//! references to their dependencies.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

use petgraph::Direction;
use petgraph::graph::{Graph, NodeIndex};

use crate::Proc;
use crate::error::GraphError;

/// Per-process bookkeeping kept by the tree.
#[derive(Debug)]
pub struct ProcNode {
    proc: Arc<Proc>,
    ran: bool,
    start: bool,
}

impl ProcNode {
    fn new(proc: Arc<Proc>) -> Self {
        Self {
            proc,
            ran: false,
            start: false,
        }
    }

    pub fn proc(&self) -> &Arc<Proc> {
        &self.proc
    }

    pub fn ran(&self) -> bool {
        self.ran
    }

    pub fn is_start(&self) -> bool {
        self.start
    }
}

type Path = Vec<NodeIndex>;

/// Insertion-ordered registry of processes and their relations.
#[derive(Default)]
pub struct ProcTree {
    graph: Graph<ProcNode, ()>,
    nodes: HashMap<usize, NodeIndex>,
    starts: Option<Vec<NodeIndex>>,
    ends: Option<Vec<NodeIndex>>,
}

fn key(proc: &Arc<Proc>) -> usize {
    Arc::as_ptr(proc).addr()
}

impl ProcTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Registered processes in registration order.
    pub fn procs(&self) -> impl Iterator<Item = &Arc<Proc>> {
        self.graph.node_indices().map(|i| &self.graph[i].proc)
    }

    pub fn node(&self, proc: &Arc<Proc>) -> Option<&ProcNode> {
        self.nodes.get(&key(proc)).map(|&i| &self.graph[i])
    }

    /// Add a process to the tree. Registering the same process twice is a
    /// no-op.
    pub fn register(&mut self, proc: &Arc<Proc>) -> NodeIndex {
        if let Some(&index) = self.nodes.get(&key(proc)) {
            return index;
        }

        let index = self.graph.add_node(ProcNode::new(proc.clone()));
        self.nodes.insert(key(proc), index);
        index
    }

    fn index(&self, proc: &Arc<Proc>) -> Result<NodeIndex, GraphError> {
        self.nodes
            .get(&key(proc))
            .copied()
            .ok_or_else(|| GraphError::Unregistered(proc.name()))
    }

    /// Fail if another registered process has the same id and tag.
    pub fn check_duplicate(&self, proc: &Arc<Proc>) -> Result<(), GraphError> {
        let other = self
            .procs()
            .find(|other| !Arc::ptr_eq(other, proc) && other.same_id_tag(proc));

        match other {
            Some(other) => Err(GraphError::Duplicate {
                id: proc.id().to_string(),
                tag: proc.tag().to_string(),
                first: other.declared(),
                second: proc.declared(),
            }),
            None => Ok(()),
        }
    }

    /// Link every process to its declared dependencies. Dependencies which
    /// were never registered are registered on the way.
    pub fn build(&mut self) {
        let mut i = 0;
        while i < self.graph.node_count() {
            let index = NodeIndex::new(i);
            let depends = self.graph[index].proc.depends();

            for dep in &depends {
                let dep = self.register(dep);
                if self.graph.find_edge(dep, index).is_none() {
                    self.graph.add_edge(dep, index, ());
                }
            }

            i += 1;
        }
    }

    /// Forget relations, run marks and starts. Registered processes stay.
    pub fn reset(&mut self) {
        self.graph.clear_edges();
        for node in self.graph.node_weights_mut() {
            node.ran = false;
            node.start = false;
        }
        self.starts = None;
        self.ends = None;
    }

    /// Flag processes as entry points of the pipeline.
    pub fn set_starts(&mut self, procs: &[&Arc<Proc>]) {
        for proc in procs {
            let index = self.register(proc);
            self.graph[index].start = true;
        }
        self.starts = None;
        self.ends = None;
    }

    pub fn starts(&mut self) -> Vec<Arc<Proc>> {
        if self.starts.is_none() {
            let starts = self
                .graph
                .node_indices()
                .filter(|&i| self.graph[i].start)
                .collect();
            self.starts = Some(starts);
        }

        self.to_procs(self.starts.as_deref().unwrap_or_default())
    }

    /// Direct dependencies, in declaration order.
    fn prev_of(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut prev: Vec<_> = self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .collect();
        prev.reverse();
        prev
    }

    /// Direct dependents, in link order.
    fn next_of(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut next: Vec<_> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect();
        next.reverse();
        next
    }

    pub fn prev(&self, proc: &Arc<Proc>) -> Result<Vec<Arc<Proc>>, GraphError> {
        Ok(self.to_procs(&self.prev_of(self.index(proc)?)))
    }

    pub fn next(&self, proc: &Arc<Proc>) -> Result<Vec<Arc<Proc>>, GraphError> {
        Ok(self.to_procs(&self.next_of(self.index(proc)?)))
    }

    fn to_procs(&self, indices: &[NodeIndex]) -> Vec<Arc<Proc>> {
        indices.iter().map(|&i| self.graph[i].proc.clone()).collect()
    }

    fn names(&self, indices: &[NodeIndex]) -> Vec<String> {
        indices.iter().map(|&i| self.graph[i].proc.name()).collect()
    }

    /// All backward paths from `origin`, nearest ancestor first, each ending
    /// at a process without dependencies.
    fn paths_of(&self, origin: NodeIndex) -> Result<Vec<Path>, GraphError> {
        let mut paths = Vec::new();
        let mut stack: Vec<Path> = self
            .prev_of(origin)
            .into_iter()
            .rev()
            .map(|p| vec![p])
            .collect();

        while let Some(path) = stack.pop() {
            let (&last, before) = match path.split_last() {
                Some(split) => split,
                None => continue,
            };

            if last == origin || before.contains(&last) {
                let mut chain = vec![self.graph[origin].proc.name()];
                chain.extend(self.names(&path));
                return Err(GraphError::Cyclic {
                    process: self.graph[last].proc.name(),
                    chain,
                });
            }

            let prev = self.prev_of(last);
            if prev.is_empty() {
                paths.push(path);
                continue;
            }

            for p in prev.into_iter().rev() {
                let mut longer = path.clone();
                longer.push(p);
                stack.push(longer);
            }
        }

        Ok(paths)
    }

    /// Like [`paths_of`](Self::paths_of), keeping only paths through a start
    /// and cutting them after the farthest start.
    fn paths_to_starts_of(&self, origin: NodeIndex) -> Result<Vec<Path>, GraphError> {
        let paths = self
            .paths_of(origin)?
            .into_iter()
            .filter_map(|mut path| {
                let farthest = path.iter().rposition(|&i| self.graph[i].start)?;
                path.truncate(farthest + 1);
                Some(path)
            })
            .collect();

        Ok(paths)
    }

    fn check_path_of(&self, index: NodeIndex) -> Result<Option<Path>, GraphError> {
        if self.graph[index].start {
            return Ok(None);
        }

        let paths = self.paths_of(index)?;
        if paths.is_empty()
            || paths
                .iter()
                .any(|path| path.iter().any(|&i| self.graph[i].start))
        {
            return Ok(None);
        }

        Ok(paths.into_iter().next())
    }

    /// Backward paths of a process. See [`GraphError::Cyclic`] for loops.
    pub fn paths(&self, proc: &Arc<Proc>) -> Result<Vec<Vec<Arc<Proc>>>, GraphError> {
        let paths = self.paths_of(self.index(proc)?)?;
        Ok(paths.iter().map(|path| self.to_procs(path)).collect())
    }

    pub fn paths_to_starts(&self, proc: &Arc<Proc>) -> Result<Vec<Vec<Arc<Proc>>>, GraphError> {
        let paths = self.paths_to_starts_of(self.index(proc)?)?;
        Ok(paths.iter().map(|path| self.to_procs(path)).collect())
    }

    /// Whether a process can be reached from a start. Returns `None` when it
    /// can, otherwise the first path that never crosses a start.
    pub fn check_path(&self, proc: &Arc<Proc>) -> Result<Option<Vec<Arc<Proc>>>, GraphError> {
        let path = self.check_path_of(self.index(proc)?)?;
        Ok(path.map(|path| self.to_procs(&path)))
    }

    fn ends_of(&mut self) -> Result<Vec<NodeIndex>, GraphError> {
        if let Some(ends) = &self.ends {
            return Ok(ends.clone());
        }

        let mut ends = Vec::new();
        let mut failed: Vec<Path> = Vec::new();
        let mut level: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&i| self.graph[i].start)
            .collect();

        while !level.is_empty() {
            for &node in &level {
                self.paths_of(node)?;
            }

            let mut seen = HashSet::new();
            let mut upcoming = Vec::new();
            for &node in &level {
                let next = self.next_of(node);
                if !next.is_empty() {
                    upcoming.extend(next.into_iter().filter(|&n| seen.insert(n)));
                    continue;
                }

                match self.check_path_of(node)? {
                    None if !ends.contains(&node) => ends.push(node),
                    None => {}
                    Some(mut path) => {
                        path.insert(0, node);
                        failed.push(path);
                    }
                }
            }
            level = upcoming;
        }

        if ends.is_empty() {
            let path = failed.first().map(|path| self.names(path));
            return Err(GraphError::NoEnd { path });
        }

        self.ends = Some(ends.clone());
        Ok(ends)
    }

    /// Processes reached from the starts that nothing depends on.
    pub fn ends(&mut self) -> Result<Vec<Arc<Proc>>, GraphError> {
        let ends = self.ends_of()?;
        Ok(self.to_procs(&ends))
    }

    /// For every end, its name followed by the names along each path to it.
    pub fn all_paths(&mut self, with_starts: bool) -> Result<Vec<Vec<String>>, GraphError> {
        let mut all = Vec::new();

        for end in self.ends_of()? {
            let paths = if with_starts {
                self.paths_to_starts_of(end)?
            } else {
                self.paths_of(end)?
            };

            let name = self.graph[end].proc.name();
            if paths.is_empty() {
                all.push(vec![name]);
                continue;
            }

            for path in paths {
                let mut names = vec![name.clone()];
                names.extend(self.names(&path));
                all.push(names);
            }
        }

        Ok(all)
    }

    /// Take the next process whose dependencies all ran, marking it as ran.
    pub fn next_to_run(&mut self) -> Option<Arc<Proc>> {
        let index = self.graph.node_indices().find(|&i| {
            let node = &self.graph[i];
            if node.ran {
                return false;
            }

            let prev = self.prev_of(i);
            node.start || (!prev.is_empty() && prev.iter().all(|&p| self.graph[p].ran))
        })?;

        self.graph[index].ran = true;
        Some(self.graph[index].proc.clone())
    }

    pub fn mark_ran(&mut self, proc: &Arc<Proc>) -> Result<(), GraphError> {
        let index = self.index(proc)?;
        self.graph[index].ran = true;
        Ok(())
    }

    /// Processes reachable from a start that did not run, each with the
    /// names of its dependencies that did not run either.
    pub fn unrun_processes(&self) -> Result<Vec<(String, Vec<String>)>, GraphError> {
        let mut unrun = Vec::new();

        for index in self.graph.node_indices() {
            let node = &self.graph[index];
            let prev = self.prev_of(index);
            if node.ran || prev.is_empty() || self.paths_to_starts_of(index)?.is_empty() {
                continue;
            }

            let waiting = prev
                .into_iter()
                .filter(|&p| !self.graph[p].ran)
                .map(|p| self.graph[p].proc.name())
                .collect();
            unrun.push((node.proc.name(), waiting));
        }

        Ok(unrun)
    }

    pub fn prev_names(&self, proc: &Arc<Proc>) -> Result<String, GraphError> {
        let prev = self.prev_of(self.index(proc)?);
        Ok(bracket(&self.names(&prev), "START"))
    }

    pub fn next_names(&self, proc: &Arc<Proc>) -> Result<String, GraphError> {
        let next = self.next_of(self.index(proc)?);
        Ok(bracket(&self.names(&next), "END"))
    }
}

fn bracket(names: &[String], empty: &str) -> String {
    if names.is_empty() {
        empty.to_string()
    } else {
        format!("[{}]", names.join(", "))
    }
}

impl std::fmt::Display for ProcTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let node = &self.graph[index];
            let mut label = node.proc.name().replace('"', "#quot;");
            if !node.proc.desc().is_empty() {
                let _ = write!(label, "<br/>{}", node.proc.desc().replace('"', "#quot;"));
            }

            if node.start {
                writeln!(f, "    {}([\"{}\"])", index.index(), label)?;
            } else {
                writeln!(f, "    {}[\"{}\"]", index.index(), label)?;
            }
        }

        for edge in self.graph.raw_edges() {
            writeln!(
                f,
                "    {} --> {}",
                edge.source().index(),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(procs: &[Arc<Proc>]) -> Vec<String> {
        procs.iter().map(|p| p.name()).collect()
    }

    #[test]
    fn test_single_dependency() {
        let a = Proc::builder("pA").finish();
        let b = Proc::builder("pB").depends_on(&a).finish();

        let mut tree = ProcTree::new();
        tree.register(&a);
        tree.register(&b);
        tree.build();
        tree.set_starts(&[&a]);

        assert_eq!(names(&tree.starts()), ["pA"]);
        assert_eq!(names(&tree.ends().unwrap()), ["pB"]);
        assert_eq!(tree.all_paths(true).unwrap(), [["pB", "pA"]]);
        assert_eq!(tree.prev_names(&a).unwrap(), "START");
        assert_eq!(tree.prev_names(&b).unwrap(), "[pA]");
        assert_eq!(tree.next_names(&a).unwrap(), "[pB]");
        assert_eq!(tree.next_names(&b).unwrap(), "END");
    }

    #[test]
    fn test_paths() {
        // p1 -> p2 -> p3
        //       p4  _/
        let p1 = Proc::builder("p1").finish();
        let p2 = Proc::builder("p2").depends_on(&p1).finish();
        let p4 = Proc::builder("p4").finish();
        let p3 = Proc::builder("p3").depends_on(&p2).depends_on(&p4).finish();

        let mut tree = ProcTree::new();
        tree.register(&p3);
        tree.build();
        assert_eq!(tree.len(), 4);

        let paths: Vec<_> = tree.paths(&p3).unwrap().iter().map(|p| names(p)).collect();
        assert_eq!(paths, vec![vec!["p2", "p1"], vec!["p4"]]);

        tree.set_starts(&[&p2]);
        let paths = tree.paths_to_starts(&p3).unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(names(&paths[0]), ["p2"]);

        assert!(tree.check_path(&p3).unwrap().is_none());
        assert!(tree.check_path(&p1).unwrap().is_none());

        tree.reset();
        tree.build();
        tree.set_starts(&[&p4]);
        let failing = tree.check_path(&p2).unwrap().unwrap();
        assert_eq!(names(&failing), ["p1"]);
    }

    #[test]
    fn test_cycle_detected() {
        let a = Proc::builder("pA").finish();
        let b = Proc::builder("pB").depends_on(&a).finish();
        let c = Proc::builder("pC").depends_on(&b).finish();
        b.set_depends(&[&a, &c]);

        let mut tree = ProcTree::new();
        for proc in [&a, &b, &c] {
            tree.register(proc);
        }
        tree.build();
        tree.set_starts(&[&a]);

        assert!(matches!(tree.paths(&c), Err(GraphError::Cyclic { .. })));
        assert!(matches!(tree.ends(), Err(GraphError::Cyclic { .. })));
    }

    #[test]
    fn test_no_end() {
        let a = Proc::builder("pA").finish();
        let b = Proc::builder("pB").finish();
        let c = Proc::builder("pC").depends_on(&b).finish();

        let mut tree = ProcTree::new();
        for proc in [&a, &b, &c] {
            tree.register(proc);
        }
        tree.build();
        tree.set_starts(&[&b]);
        assert_eq!(names(&tree.ends().unwrap()), ["pC"]);

        tree.reset();
        tree.build();
        tree.set_starts(&[]);
        let err = tree.ends().unwrap_err();
        assert!(matches!(err, GraphError::NoEnd { path: None }));
    }

    #[test]
    fn test_reset_then_build() {
        let a = Proc::builder("pA").finish();
        let b = Proc::builder("pB").depends_on(&a).finish();
        let c = Proc::builder("pC").depends_on(&a).depends_on(&b).finish();

        let mut tree = ProcTree::new();
        tree.register(&c);
        tree.build();
        tree.build();
        let before = (tree.prev_names(&c).unwrap(), tree.next_names(&a).unwrap());
        assert_eq!(before.0, "[pA, pB]");
        assert_eq!(before.1, "[pC, pB]");

        tree.set_starts(&[&a]);
        tree.next_to_run();
        tree.reset();
        assert_eq!(tree.prev_names(&c).unwrap(), "START");
        assert!(!tree.node(&a).unwrap().ran());
        assert!(!tree.node(&a).unwrap().is_start());

        tree.build();
        let after = (tree.prev_names(&c).unwrap(), tree.next_names(&a).unwrap());
        assert_eq!(before, after);
    }

    #[test]
    fn test_next_to_run() {
        let a = Proc::builder("pA").finish();
        let b = Proc::builder("pB").depends_on(&a).finish();
        let c = Proc::builder("pC").depends_on(&b).finish();
        let lone = Proc::builder("pLone").finish();

        let mut tree = ProcTree::new();
        for proc in [&c, &lone, &b, &a] {
            tree.register(proc);
        }
        tree.build();
        tree.set_starts(&[&a]);

        let mut order = Vec::new();
        while let Some(proc) = tree.next_to_run() {
            order.push(proc.name());
        }
        assert_eq!(order, ["pA", "pB", "pC"]);
        assert!(tree.next_to_run().is_none());
    }

    #[test]
    fn test_unrun_processes() {
        let a = Proc::builder("pA").finish();
        let b = Proc::builder("pB").depends_on(&a).finish();
        let c = Proc::builder("pC").depends_on(&b).finish();

        let mut tree = ProcTree::new();
        for proc in [&a, &b, &c] {
            tree.register(proc);
        }
        tree.build();
        tree.set_starts(&[&a]);
        tree.next_to_run();

        let unrun = tree.unrun_processes().unwrap();
        assert_eq!(
            unrun,
            vec![
                ("pB".to_string(), vec![]),
                ("pC".to_string(), vec!["pB".to_string()]),
            ]
        );

        tree.mark_ran(&b).unwrap();
        tree.mark_ran(&c).unwrap();
        assert!(tree.unrun_processes().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate() {
        let first = Proc::builder("pA").finish();
        let second = Proc::builder("pA").finish();
        let tagged = Proc::builder("pA").tag("other").finish();

        let mut tree = ProcTree::new();
        tree.register(&first);
        tree.register(&tagged);
        assert!(tree.check_duplicate(&first).is_ok());

        tree.register(&second);
        let err = tree.check_duplicate(&second).unwrap_err();
        assert!(matches!(err, GraphError::Duplicate { .. }));
        assert!(err.to_string().contains("same id(pA) and tag(notag)"));
    }

    #[test]
    fn test_mermaid() {
        let a = Proc::builder("pA").finish();
        let b = Proc::builder("pB").depends_on(&a).finish();

        let mut tree = ProcTree::new();
        tree.register(&a);
        tree.register(&b);
        tree.build();
        tree.set_starts(&[&a]);

        let text = tree.to_string();
        assert!(text.starts_with("graph LR\n"));
        assert!(text.contains("    0([\"pA\"])"));
        assert!(text.contains("    1[\"pB\"]"));
        assert!(text.contains("    0 --> 1"));
    }
}
