//! Storage compaction.
//!
//! Collapse and swap tombstone entities in place; this pass reclaims the
//! storage, renumbers the survivors and remaps every index that refers to
//! them. The driver calls it between outer adaptation iterations to cap
//! peak memory.

use hashbrown::HashSet;

use crate::geometry::MetricTensor;
use crate::mesh::{Mesh2, NLOC};

impl Mesh2 {
    /// Compact tombstoned vertices and elements.
    ///
    /// On return `vertex_map[old] == new` for surviving vertices and `-1`
    /// for deleted ones. In single-process mode the global numbering is
    /// re-densified along with the local ids.
    pub fn defragment(&mut self, vertex_map: &mut Vec<i64>) {
        let n_nodes = self.n_nodes();
        let n_elements = self.n_elements();

        vertex_map.clear();
        vertex_map.resize(n_nodes, -1);
        let mut new_n_nodes = 0usize;
        for v in 0..n_nodes {
            if self.vertex_live(v) {
                vertex_map[v] = new_n_nodes as i64;
                new_n_nodes += 1;
            }
        }

        let mut element_map = vec![-1i64; n_elements];
        let mut new_n_elements = 0usize;
        for e in 0..n_elements {
            if self.element_live(e) {
                element_map[e] = new_n_elements as i64;
                new_n_elements += 1;
            }
        }

        let serial = self.send_halo.is_empty() && self.recv_halo.is_empty();

        let mut coords = vec![0.0; 2 * new_n_nodes];
        let mut metric = vec![MetricTensor::identity(); new_n_nodes];
        let mut node_owner = vec![0; new_n_nodes];
        let mut lnn2gnn = vec![-1i64; new_n_nodes];
        let mut nnlist = vec![Vec::new(); new_n_nodes];
        let mut nelist = vec![Vec::new(); new_n_nodes];
        for v in 0..n_nodes {
            let nv = vertex_map[v];
            if nv < 0 {
                continue;
            }
            let nv = nv as usize;
            coords[2 * nv] = self.coords[2 * v];
            coords[2 * nv + 1] = self.coords[2 * v + 1];
            metric[nv] = self.metric[v];
            node_owner[nv] = self.node_owner[v];
            lnn2gnn[nv] = if serial { nv as i64 } else { self.lnn2gnn[v] };
            nnlist[nv] = self.nnlist[v]
                .iter()
                .map(|&u| vertex_map[u as usize] as i32)
                .collect();
            nelist[nv] = self.nelist[v]
                .iter()
                .map(|&e| element_map[e as usize] as i32)
                .collect();
            // Remapping is monotone, so the rows stay sorted.
            debug_assert!(nnlist[nv].windows(2).all(|w| w[0] < w[1]));
        }

        let mut enlist = vec![-1i32; NLOC * new_n_elements];
        let mut boundary = vec![0i32; NLOC * new_n_elements];
        for e in 0..n_elements {
            let ne = element_map[e];
            if ne < 0 {
                continue;
            }
            let ne = ne as usize;
            for i in 0..NLOC {
                enlist[NLOC * ne + i] = vertex_map[self.enlist[NLOC * e + i] as usize] as i32;
                boundary[NLOC * ne + i] = self.boundary[NLOC * e + i];
            }
        }

        let remap_halo = |halo: &HashSet<i32>| -> HashSet<i32> {
            halo.iter()
                .filter_map(|&v| {
                    let nv = vertex_map[v as usize];
                    (nv >= 0).then_some(nv as i32)
                })
                .collect()
        };
        self.send_halo = remap_halo(&self.send_halo);
        self.recv_halo = remap_halo(&self.recv_halo);

        self.coords = coords;
        self.metric = metric;
        self.node_owner = node_owner;
        self.lnn2gnn = lnn2gnn;
        self.nnlist = nnlist;
        self.nelist = nelist;
        self.enlist = enlist;
        self.boundary = boundary;
        self.set_node_count(new_n_nodes);
        self.set_element_count(new_n_elements);
    }
}
