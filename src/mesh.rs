//! Mesh representations and the face-adjacency view built over them.
//!
//! A mesh exists in two forms: [`PolyMesh`], the compact object data that
//! stores polygons as vertex loops, and [`EditMesh`], the live editing form
//! that stores explicit edges with their linked faces.  Both produce the same
//! [`FaceGraph`] through [`FaceSource`], so island detection never has to care
//! which form the host currently has open.
//!
//! Two faces are neighbours when they share an edge bordered by exactly two
//! faces.  Boundary edges (one face) and non-manifold edges (three or more)
//! link nothing.

use std::collections::HashMap;

/// Index of a face within its mesh, in native enumeration order.
pub type FaceId = usize;
/// Index of an edge within its mesh, in order of first appearance.
pub type EdgeId = usize;

/// One face of a [`PolyMesh`].
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    /// Vertex loop, counter-clockwise.
    pub vertices: Vec<u32>,
    /// Per-corner UV coordinates; empty when the mesh is not unwrapped.
    pub uvs: Vec<[f32; 2]>,
    /// Index into the owning object's material slots.
    pub material_index: usize,
}

impl Polygon {
    /// Polygon over `vertices` with no UVs, bound to the first material slot.
    pub fn new(vertices: Vec<u32>) -> Self {
        Self {
            vertices,
            uvs: Vec::new(),
            material_index: 0,
        }
    }

    /// Sets the per-corner UVs.
    pub fn with_uvs(mut self, uvs: Vec<[f32; 2]>) -> Self {
        self.uvs = uvs;
        self
    }

    /// Binds the polygon to material slot `material_index`.
    pub fn with_material(mut self, material_index: usize) -> Self {
        self.material_index = material_index;
        self
    }

    /// Loop edges as unordered vertex pairs, in loop order.
    fn edge_keys(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let n = self.vertices.len();
        (0..n).filter_map(move |i| {
            let a = self.vertices[i];
            let b = self.vertices[(i + 1) % n];
            (a != b).then(|| if a < b { (a, b) } else { (b, a) })
        })
    }
}

/// Object-mode mesh data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolyMesh {
    pub name: String,
    pub positions: Vec<[f32; 3]>,
    pub polygons: Vec<Polygon>,
}

impl PolyMesh {
    /// Mesh over `positions` with no polygons yet.
    pub fn new(name: impl Into<String>, positions: Vec<[f32; 3]>) -> Self {
        Self {
            name: name.into(),
            positions,
            polygons: Vec::new(),
        }
    }

    /// Appends `polygon`.
    pub fn with_polygon(mut self, polygon: Polygon) -> Self {
        self.polygons.push(polygon);
        self
    }

    pub fn face_count(&self) -> usize {
        self.polygons.len()
    }

    /// Merges vertices lying within `threshold` of each other and returns how
    /// many were removed.
    ///
    /// Repeated corners left behind by the merge are collapsed, and polygons
    /// with fewer than three corners afterwards are dropped.
    pub fn weld_vertices(&mut self, threshold: f32) -> usize {
        let threshold = threshold.max(0.0);
        let cell = threshold.max(f32::EPSILON);
        let cell_of = |p: [f32; 3]| p.map(|c| (c / cell).floor() as i64);

        let mut buckets: HashMap<[i64; 3], Vec<u32>> = HashMap::new();
        let mut welded: Vec<[f32; 3]> = Vec::with_capacity(self.positions.len());
        let mut remap = Vec::with_capacity(self.positions.len());
        for &position in &self.positions {
            let [x, y, z] = cell_of(position);
            let existing = (-1..=1)
                .flat_map(|dx| {
                    (-1..=1).flat_map(move |dy| (-1..=1).map(move |dz| [x + dx, y + dy, z + dz]))
                })
                .filter_map(|key| buckets.get(&key))
                .flatten()
                .copied()
                .find(|&i| distance_sq(welded[i as usize], position) <= threshold * threshold);
            let index = match existing {
                Some(index) => index,
                None => {
                    let index = welded.len() as u32;
                    welded.push(position);
                    buckets.entry([x, y, z]).or_default().push(index);
                    index
                }
            };
            remap.push(index);
        }

        let removed = self.positions.len() - welded.len();
        if removed == 0 {
            return 0;
        }
        self.positions = welded;
        for polygon in &mut self.polygons {
            let mut vertices = Vec::with_capacity(polygon.vertices.len());
            let mut uvs = Vec::with_capacity(polygon.uvs.len());
            for (corner, &vertex) in polygon.vertices.iter().enumerate() {
                let vertex = remap.get(vertex as usize).copied().unwrap_or(vertex);
                if vertices.last() == Some(&vertex) {
                    continue;
                }
                vertices.push(vertex);
                uvs.extend(polygon.uvs.get(corner).copied());
            }
            if vertices.len() > 1 && vertices.first() == vertices.last() {
                vertices.pop();
                uvs.truncate(vertices.len());
            }
            polygon.vertices = vertices;
            polygon.uvs = uvs;
        }
        self.polygons.retain(|p| p.vertices.len() >= 3);
        removed
    }

    /// `true` when every polygon carries one UV per corner.
    pub fn has_uvs(&self) -> bool {
        !self.polygons.is_empty()
            && self
                .polygons
                .iter()
                .all(|p| !p.uvs.is_empty() && p.uvs.len() == p.vertices.len())
    }

    /// Bit pattern of the UV layout, used to spot objects sharing identical UVs.
    pub fn uv_signature(&self) -> Option<Vec<[u32; 2]>> {
        self.has_uvs().then(|| {
            self.polygons
                .iter()
                .flat_map(|p| p.uvs.iter().map(|uv| [uv[0].to_bits(), uv[1].to_bits()]))
                .collect()
        })
    }

    /// Material slot index of every face, in face order.
    pub fn material_indices(&self) -> Vec<usize> {
        self.polygons.iter().map(|p| p.material_index).collect()
    }

    /// Opens the mesh for editing.
    pub fn edit(&self) -> EditMesh {
        EditMesh::from_mesh(self)
    }

    /// Writes per-face edits back into the object data.
    pub fn apply_edit(&mut self, edit: &EditMesh) {
        for (polygon, face) in self.polygons.iter_mut().zip(&edit.faces) {
            polygon.material_index = face.material_index;
        }
    }
}

fn distance_sq(a: [f32; 3], b: [f32; 3]) -> f32 {
    (0..3).map(|i| (a[i] - b[i]).powi(2)).sum()
}

/// An edge of an [`EditMesh`] with the faces bordering it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditEdge {
    pub vertices: [u32; 2],
    pub link_faces: Vec<FaceId>,
}

/// A face of an [`EditMesh`] with its ordered bounding edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditFace {
    pub edges: Vec<EdgeId>,
    pub material_index: usize,
    /// Scratch marker owned by whichever operator is walking the mesh.
    pub tag: bool,
}

/// Edit-mode mesh: explicit edge table with face links.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditMesh {
    pub edges: Vec<EditEdge>,
    pub faces: Vec<EditFace>,
}

impl EditMesh {
    pub fn from_mesh(mesh: &PolyMesh) -> Self {
        let mut lookup: HashMap<(u32, u32), EdgeId> = HashMap::new();
        let mut edges: Vec<EditEdge> = Vec::new();
        let mut faces = Vec::with_capacity(mesh.polygons.len());

        for (face, polygon) in mesh.polygons.iter().enumerate() {
            let mut face_edges = Vec::with_capacity(polygon.vertices.len());
            for key in polygon.edge_keys() {
                let edge = *lookup.entry(key).or_insert_with(|| {
                    edges.push(EditEdge {
                        vertices: [key.0, key.1],
                        link_faces: Vec::new(),
                    });
                    edges.len() - 1
                });
                let links = &mut edges[edge].link_faces;
                if !links.contains(&face) {
                    links.push(face);
                }
                face_edges.push(edge);
            }
            faces.push(EditFace {
                edges: face_edges,
                material_index: polygon.material_index,
                tag: false,
            });
        }

        Self { edges, faces }
    }

    pub fn clear_tags(&mut self) {
        for face in &mut self.faces {
            face.tag = false;
        }
    }
}

/// Adjacency view over the faces and edges of a mesh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaceGraph {
    face_edges: Vec<Vec<EdgeId>>,
    edge_faces: Vec<Vec<FaceId>>,
}

impl FaceGraph {
    pub fn face_count(&self) -> usize {
        self.face_edges.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edge_faces.len()
    }

    /// Bounding edges of `face`, in loop order.
    pub fn face_edges(&self, face: FaceId) -> &[EdgeId] {
        self.face_edges.get(face).map_or(&[], Vec::as_slice)
    }

    /// Faces bordering `edge`.
    pub fn edge_faces(&self, edge: EdgeId) -> &[FaceId] {
        self.edge_faces.get(edge).map_or(&[], Vec::as_slice)
    }

    /// Whether `edge` joins exactly two faces.
    pub fn is_internal(&self, edge: EdgeId) -> bool {
        self.edge_faces(edge).len() == 2
    }

    /// Faces reachable from `face` across internal edges.
    pub fn neighbors(&self, face: FaceId) -> impl Iterator<Item = FaceId> + '_ {
        self.face_edges(face).iter().filter_map(move |&edge| {
            match self.edge_faces(edge) {
                [a, b] if *a == face => Some(*b),
                [a, b] if *b == face => Some(*a),
                _ => None,
            }
        })
    }
}

/// Anything that can present its faces as a [`FaceGraph`].
pub trait FaceSource {
    fn face_graph(&self) -> FaceGraph;
}

impl FaceSource for EditMesh {
    fn face_graph(&self) -> FaceGraph {
        FaceGraph {
            face_edges: self.faces.iter().map(|f| f.edges.clone()).collect(),
            edge_faces: self.edges.iter().map(|e| e.link_faces.clone()).collect(),
        }
    }
}

impl FaceSource for PolyMesh {
    fn face_graph(&self) -> FaceGraph {
        EditMesh::from_mesh(self).face_graph()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// `columns × rows` grid of quads sharing interior edges.
    pub fn grid(columns: u32, rows: u32) -> PolyMesh {
        let stride = columns + 1;
        let positions = (0..=rows)
            .flat_map(|y| (0..=columns).map(move |x| [x as f32, y as f32, 0.0]))
            .collect();
        let mut mesh = PolyMesh::new("Grid", positions);
        for y in 0..rows {
            for x in 0..columns {
                let a = y * stride + x;
                let u0 = x as f32 / columns as f32;
                let v0 = y as f32 / rows as f32;
                let u1 = (x + 1) as f32 / columns as f32;
                let v1 = (y + 1) as f32 / rows as f32;
                mesh.polygons.push(
                    Polygon::new(vec![a, a + 1, a + 1 + stride, a + stride])
                        .with_uvs(vec![[u0, v0], [u1, v0], [u1, v1], [u0, v1]]),
                );
            }
        }
        mesh
    }

    /// `count` triangles that share no vertices at all.
    pub fn scattered_triangles(count: u32) -> PolyMesh {
        let mut mesh = PolyMesh::new("Scatter", Vec::new());
        for i in 0..count {
            let base = mesh.positions.len() as u32;
            let x = i as f32 * 2.0;
            mesh.positions
                .extend([[x, 0.0, 0.0], [x + 1.0, 0.0, 0.0], [x, 1.0, 0.0]]);
            mesh.polygons
                .push(Polygon::new(vec![base, base + 1, base + 2]));
        }
        mesh
    }

    /// Closed cube: six quads, every edge shared by two faces.
    pub fn cube() -> PolyMesh {
        let positions = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [1.0, 1.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
            [1.0, 0.0, 1.0],
            [1.0, 1.0, 1.0],
            [0.0, 1.0, 1.0],
        ];
        let loops = [
            [0, 3, 2, 1],
            [4, 5, 6, 7],
            [0, 1, 5, 4],
            [2, 3, 7, 6],
            [1, 2, 6, 5],
            [0, 4, 7, 3],
        ];
        let mut mesh = PolyMesh::new("Cube", positions);
        for l in loops {
            mesh.polygons.push(Polygon::new(l.to_vec()));
        }
        mesh
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn grid_interior_edges_link_two_faces() {
        let graph = grid(2, 1).face_graph();
        assert_eq!(graph.face_count(), 2);
        // 2 quads share one edge: 4 + 4 - 1 edges.
        assert_eq!(graph.edge_count(), 7);
        let shared: Vec<_> = (0..graph.edge_count())
            .filter(|&e| graph.is_internal(e))
            .collect();
        assert_eq!(shared.len(), 1);
        assert_eq!(graph.neighbors(0).collect::<Vec<_>>(), vec![1]);
        assert_eq!(graph.neighbors(1).collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn non_manifold_edge_links_nothing() {
        // Three triangles fanned around the edge (0, 1).
        let mesh = PolyMesh::new("Fan", vec![[0.0; 3]; 5])
            .with_polygon(Polygon::new(vec![0, 1, 2]))
            .with_polygon(Polygon::new(vec![1, 0, 3]))
            .with_polygon(Polygon::new(vec![0, 1, 4]));
        let graph = mesh.face_graph();
        for face in 0..3 {
            assert_eq!(graph.neighbors(face).count(), 0, "face {face}");
        }
    }

    #[test]
    fn object_and_edit_forms_present_the_same_graph() {
        let mesh = cube();
        let edit = mesh.edit();
        assert_eq!(mesh.face_graph(), edit.face_graph());
        assert_eq!(edit.edges.len(), 12);
        assert!(edit.edges.iter().all(|e| e.link_faces.len() == 2));
    }

    #[test]
    fn face_edges_follow_loop_order() {
        let mesh = grid(1, 1);
        let edit = mesh.edit();
        let keys: Vec<[u32; 2]> = edit.faces[0]
            .edges
            .iter()
            .map(|&e| edit.edges[e].vertices)
            .collect();
        assert_eq!(keys, vec![[0, 1], [1, 3], [2, 3], [0, 2]]);
    }

    #[test]
    fn edit_material_indices_write_back() {
        let mut mesh = grid(2, 2);
        let mut edit = mesh.edit();
        edit.faces[3].material_index = 2;
        mesh.apply_edit(&edit);
        assert_eq!(mesh.material_indices(), vec![0, 0, 0, 2]);
    }

    /// Every quad of a `columns × rows` grid with its own copy of its corners.
    fn split_grid(columns: u32, rows: u32) -> PolyMesh {
        let joined = grid(columns, rows);
        let mut mesh = PolyMesh::new("Split", Vec::new());
        for polygon in &joined.polygons {
            let base = mesh.positions.len() as u32;
            mesh.positions
                .extend(polygon.vertices.iter().map(|&v| joined.positions[v as usize]));
            let corners = (base..base + polygon.vertices.len() as u32).collect();
            mesh.polygons.push(Polygon::new(corners));
        }
        mesh
    }

    #[test]
    fn welding_split_grid_joins_it_into_one_island() {
        let mut mesh = split_grid(3, 2);
        assert_eq!(crate::islands::detect_islands(&mesh.face_graph()).len(), 6);

        let removed = mesh.weld_vertices(0.0001);
        assert_eq!(removed, 24 - 12);
        assert_eq!(mesh.positions.len(), 12);
        assert_eq!(mesh.face_count(), 6);
        assert_eq!(crate::islands::detect_islands(&mesh.face_graph()).len(), 1);
    }

    #[test]
    fn welding_leaves_distant_vertices_apart() {
        let mut mesh = scattered_triangles(4);
        assert_eq!(mesh.weld_vertices(0.0001), 0);
        assert_eq!(mesh.positions.len(), 12);
        assert_eq!(crate::islands::detect_islands(&mesh.face_graph()).len(), 4);
    }

    #[test]
    fn welding_drops_collapsed_faces() {
        let mut mesh = PolyMesh::new(
            "Sliver",
            vec![[0.0; 3], [1.0, 0.0, 0.0], [1.0, 0.00005, 0.0], [0.0, 1.0, 0.0]],
        )
        .with_polygon(Polygon::new(vec![0, 1, 2]))
        .with_polygon(Polygon::new(vec![0, 1, 3]));
        assert_eq!(mesh.weld_vertices(0.0001), 1);
        assert_eq!(mesh.face_count(), 1);
        assert_eq!(mesh.polygons[0].vertices, vec![0, 1, 2]);
    }

    #[test]
    fn uv_signature_requires_full_unwrap() {
        assert!(grid(1, 1).uv_signature().is_some());
        assert!(cube().uv_signature().is_none());
        assert_eq!(grid(2, 1).uv_signature(), grid(2, 1).uv_signature());
    }
}
