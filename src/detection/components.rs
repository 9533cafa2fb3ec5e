//! Connected components of dark pixels.

use super::threshold::DarkMask;
use nalgebra::Point2;

/// A disjoint-set (union-find) structure over pixel indices.
pub struct UnionFind {
    parent: Vec<u32>,
    size: Vec<u32>,
}

impl UnionFind {
    pub fn new(len: usize) -> Self {
        Self {
            parent: (0..len as u32).collect(),
            size: vec![1; len],
        }
    }

    /// Root of the set containing `id`, with path halving.
    pub fn find(&mut self, mut id: u32) -> u32 {
        while self.parent[id as usize] != id {
            let grand = self.parent[self.parent[id as usize] as usize];
            self.parent[id as usize] = grand;
            id = grand;
        }
        id
    }

    /// Merge the sets of `a` and `b`, returning the new root.
    pub fn union(&mut self, a: u32, b: u32) -> u32 {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return ra;
        }
        let (big, small) = if self.size[ra as usize] >= self.size[rb as usize] {
            (ra, rb)
        } else {
            (rb, ra)
        };
        self.parent[small as usize] = big;
        self.size[big as usize] += self.size[small as usize];
        big
    }
}

/// A 4-connected group of dark pixels.
#[derive(Debug, Clone)]
pub struct Component {
    /// Pixel centres of the component's boundary pixels.
    pub boundary: Vec<Point2<f64>>,
    /// Total pixel count.
    pub area: usize,
    pub min: (u32, u32),
    pub max: (u32, u32),
}

impl Component {
    pub fn bbox_width(&self) -> u32 {
        self.max.0 - self.min.0 + 1
    }

    pub fn bbox_height(&self) -> u32 {
        self.max.1 - self.min.1 + 1
    }
}

/// Label 4-connected dark regions and keep those with at least `min_area`
/// pixels.
pub fn find_components(mask: &DarkMask, min_area: usize) -> Vec<Component> {
    let (w, h) = (mask.width, mask.height);
    let mut uf = UnionFind::new((w * h) as usize);

    for y in 0..h {
        for x in 0..w {
            if !mask.get(x, y) {
                continue;
            }
            let id = y * w + x;
            if x > 0 && mask.get(x - 1, y) {
                uf.union(id, id - 1);
            }
            if y > 0 && mask.get(x, y - 1) {
                uf.union(id, id - w);
            }
        }
    }

    let mut by_root: std::collections::HashMap<u32, Component> = std::collections::HashMap::new();
    for y in 0..h {
        for x in 0..w {
            if !mask.get(x, y) {
                continue;
            }
            let root = uf.find(y * w + x);
            let entry = by_root.entry(root).or_insert_with(|| Component {
                boundary: Vec::new(),
                area: 0,
                min: (x, y),
                max: (x, y),
            });
            entry.area += 1;
            entry.min = (entry.min.0.min(x), entry.min.1.min(y));
            entry.max = (entry.max.0.max(x), entry.max.1.max(y));

            let on_edge = x == 0
                || y == 0
                || x == w - 1
                || y == h - 1
                || !mask.get(x - 1, y)
                || !mask.get(x + 1, y)
                || !mask.get(x, y - 1)
                || !mask.get(x, y + 1);
            if on_edge {
                entry.boundary.push(Point2::new(x as f64, y as f64));
            }
        }
    }

    let mut components: Vec<Component> = by_root
        .into_values()
        .filter(|c| c.area >= min_area)
        .collect();
    // Stable scan order for callers.
    components.sort_by_key(|c| (c.min.1, c.min.0));
    components
}
