//! Connected-component search over a [`FaceGraph`].
//!
//! Islands are discovered depth-first with an explicit stack so that meshes
//! with many thousands of faces cannot exhaust the call stack.  Membership is
//! a pure function of adjacency; the order of islands, and of faces inside an
//! island, follows face enumeration and edge order and must not be relied on.

use crate::mesh::{FaceGraph, FaceId};

/// Maximal set of faces mutually reachable across internal edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Island {
    pub faces: Vec<FaceId>,
}

impl Island {
    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }
}

/// Partitions every face of `graph` into islands.
pub fn detect_islands(graph: &FaceGraph) -> Vec<Island> {
    let mut visited = vec![false; graph.face_count()];
    let mut islands = Vec::new();
    let mut stack = Vec::new();

    for seed in 0..graph.face_count() {
        if visited[seed] {
            continue;
        }
        visited[seed] = true;
        stack.push(seed);
        let mut faces = Vec::new();

        while let Some(face) = stack.pop() {
            faces.push(face);
            for neighbor in graph.neighbors(face) {
                if !visited[neighbor] {
                    visited[neighbor] = true;
                    stack.push(neighbor);
                }
            }
        }

        islands.push(Island { faces });
    }

    islands
}

/// Island index of every face, given islands from [`detect_islands`].
pub fn island_of_faces(islands: &[Island], face_count: usize) -> Vec<usize> {
    let mut assignment = vec![0; face_count];
    for (index, island) in islands.iter().enumerate() {
        for &face in &island.faces {
            if let Some(slot) = assignment.get_mut(face) {
                *slot = index;
            }
        }
    }
    assignment
}
