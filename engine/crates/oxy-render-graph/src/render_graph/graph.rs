//! pass 之间的依赖
//!
//! 由每个 pass 的读写集合得到 DAG，排序时平局按注册顺序打破，
//! 跨队列的边在提交时变成 fence 等待。

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DependencyKind {
    /// 读取之前的写入
    ReadAfterWrite,
    /// 两次写入保持顺序
    WriteAfterWrite,
    /// 写入之前的读取必须完成
    WriteAfterRead,
    /// 通过 `add_dependency` 显式声明
    Explicit,
}

/// 依赖边：从 producer 到 consumer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DependencyEdge {
    /// 先执行的 Pass 索引
    pub producer: usize,
    /// 后执行的 Pass 索引
    pub consumer: usize,
    pub kind: DependencyKind,
}

/// pass 依赖的 DAG，边去重
#[derive(Clone, Debug)]
pub struct DependencyGraph {
    pass_count: usize,
    /// 邻接表（出边）
    adjacency: Vec<Vec<usize>>,
    in_degrees: Vec<usize>,
    edges: Vec<DependencyEdge>,
}

impl DependencyGraph {
    pub fn new(pass_count: usize) -> Self {
        Self {
            pass_count,
            adjacency: vec![Vec::new(); pass_count],
            in_degrees: vec![0; pass_count],
            edges: Vec::new(),
        }
    }

    /// 添加依赖边，重复的边只记录一次
    pub fn add_edge(&mut self, producer: usize, consumer: usize, kind: DependencyKind) {
        if producer == consumer {
            return;
        }
        if !self.adjacency[producer].contains(&consumer) {
            self.adjacency[producer].push(consumer);
            self.in_degrees[consumer] += 1;
        }
        self.edges.push(DependencyEdge {
            producer,
            consumer,
            kind,
        });
    }

    /// Kahn 排序，就绪的 pass 中注册序号最小的先出
    ///
    /// 有环时返回环上（以及依赖环）的 pass。
    pub fn topological_sort(&self) -> Result<Vec<usize>, Vec<usize>> {
        let mut in_degrees = self.in_degrees.clone();
        let mut ready: BinaryHeap<Reverse<usize>> =
            (0..self.pass_count).filter(|&i| in_degrees[i] == 0).map(Reverse).collect();
        let mut result = Vec::with_capacity(self.pass_count);

        while let Some(Reverse(node)) = ready.pop() {
            result.push(node);
            for &next in &self.adjacency[node] {
                in_degrees[next] -= 1;
                if in_degrees[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if result.len() != self.pass_count {
            let remaining: Vec<usize> = (0..self.pass_count).filter(|&i| in_degrees[i] > 0).collect();
            Err(remaining)
        } else {
            Ok(result)
        }
    }

    /// Pass 的直接前驱
    pub fn predecessors(&self, pass_index: usize) -> Vec<usize> {
        (0..self.pass_count).filter(|&i| self.adjacency[i].contains(&pass_index)).collect()
    }

    #[inline]
    pub fn successors(&self, pass_index: usize) -> &[usize] {
        &self.adjacency[pass_index]
    }

    #[inline]
    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    #[inline]
    pub fn pass_count(&self) -> usize {
        self.pass_count
    }
}

/// 从读写集合推导依赖边
pub struct DependencyAnalyzer;

impl DependencyAnalyzer {
    /// 规则：
    /// - RAW：reader 依赖之前最后一个 writer
    /// - WAW：writer 依赖之前最后一个 writer
    /// - WAR：writer 依赖上次写入之后的所有 reader
    pub fn analyze<K: Copy + Eq + Hash>(reads: &[Vec<K>], writes: &[Vec<K>]) -> DependencyGraph {
        let pass_count = reads.len().max(writes.len());
        let mut graph = DependencyGraph::new(pass_count);

        let mut last_writer: HashMap<K, usize> = HashMap::new();
        let mut readers_since_write: HashMap<K, Vec<usize>> = HashMap::new();

        for pass in 0..pass_count {
            for &resource in reads.get(pass).into_iter().flatten() {
                if let Some(&writer) = last_writer.get(&resource) {
                    graph.add_edge(writer, pass, DependencyKind::ReadAfterWrite);
                }
                let readers = readers_since_write.entry(resource).or_default();
                if !readers.contains(&pass) {
                    readers.push(pass);
                }
            }

            for &resource in writes.get(pass).into_iter().flatten() {
                if let Some(&writer) = last_writer.get(&resource) {
                    graph.add_edge(writer, pass, DependencyKind::WriteAfterWrite);
                }
                if let Some(readers) = readers_since_write.remove(&resource) {
                    for reader in readers {
                        graph.add_edge(reader, pass, DependencyKind::WriteAfterRead);
                    }
                }
                last_writer.insert(resource, pass);
            }
        }

        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_dependency() {
        // Pass 0 写入 0，Pass 1 读取 0
        let graph = DependencyAnalyzer::analyze(&[vec![], vec![0u32]], &[vec![0u32], vec![]]);
        assert_eq!(graph.topological_sort().unwrap(), vec![0, 1]);
        assert_eq!(graph.edges()[0].kind, DependencyKind::ReadAfterWrite);
    }

    #[test]
    fn test_write_after_read() {
        // Pass 0 写入，Pass 1 读取，Pass 2 再次写入：2 必须在 1 之后
        let reads = vec![vec![], vec![7u32], vec![]];
        let writes = vec![vec![7u32], vec![], vec![7u32]];
        let graph = DependencyAnalyzer::analyze(&reads, &writes);

        assert_eq!(graph.topological_sort().unwrap(), vec![0, 1, 2]);
        let kinds: Vec<_> = graph.edges().iter().map(|e| (e.producer, e.consumer, e.kind)).collect();
        assert!(kinds.contains(&(1, 2, DependencyKind::WriteAfterRead)));
        assert!(kinds.contains(&(0, 2, DependencyKind::WriteAfterWrite)));
        assert_eq!(graph.predecessors(2), vec![0, 1]);
    }

    #[test]
    fn test_ties_follow_registration_order() {
        // 0 和 1 互不依赖，2 读取两者
        let reads = vec![vec![], vec![], vec![0u32, 1]];
        let writes = vec![vec![0u32], vec![1], vec![]];
        let graph = DependencyAnalyzer::analyze(&reads, &writes);
        assert_eq!(graph.topological_sort().unwrap(), vec![0, 1, 2]);

        // 显式依赖让 1 先于 0
        let mut graph = graph;
        graph.add_edge(1, 0, DependencyKind::Explicit);
        assert_eq!(graph.topological_sort().unwrap(), vec![1, 0, 2]);
    }

    #[test]
    fn test_cycle() {
        let mut graph = DependencyGraph::new(3);
        graph.add_edge(0, 1, DependencyKind::Explicit);
        graph.add_edge(1, 2, DependencyKind::Explicit);
        graph.add_edge(2, 1, DependencyKind::Explicit);
        assert_eq!(graph.topological_sort(), Err(vec![1, 2]));
    }
}
