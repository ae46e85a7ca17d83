//! GrabCut-style iterative graph-cut segmentation.
//!
//! Colour statistics of foreground and background are modelled with 5-component
//! full-covariance Gaussian mixtures. Each iteration re-assigns pixels to mixture
//! components, re-learns the mixtures, builds an 8-neighbourhood graph and solves
//! the min-cut with Dinic's max-flow. Only pixels labelled *probable* may change.

use image::RgbImage;
use nalgebra::{Matrix3, Vector3};

use super::mask::Mask;
use crate::errors::{Result, SpriteCutoutError};

const COMPONENTS: usize = 5;
const KMEANS_ITERATIONS: usize = 10;
const GAMMA: f64 = 50.0;
const LAMBDA: f64 = 9.0 * GAMMA;
const COVARIANCE_REGULARIZATION: f64 = 0.01;
const DETERMINANT_EPSILON: f64 = f64::EPSILON;

/// Four-level seed label, as used to initialise and read back a graph cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedLabel {
    Background,
    Foreground,
    ProbableBackground,
    ProbableForeground,
}

impl SeedLabel {
    pub const fn is_foreground(self) -> bool {
        matches!(self, Self::Foreground | Self::ProbableForeground)
    }

    const fn is_probable(self) -> bool {
        matches!(self, Self::ProbableBackground | Self::ProbableForeground)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedMap {
    width: u32,
    height: u32,
    labels: Vec<SeedLabel>,
}

impl SeedMap {
    pub fn filled(width: u32, height: u32, label: SeedLabel) -> Self {
        Self {
            width,
            height,
            labels: vec![label; width as usize * height as usize],
        }
    }

    pub const fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn get(&self, x: u32, y: u32) -> SeedLabel {
        self.labels[self.index(x, y)]
    }

    pub fn set(&mut self, x: u32, y: u32, label: SeedLabel) {
        let i = self.index(x, y);
        self.labels[i] = label;
    }

    pub fn count(&self, label: SeedLabel) -> usize {
        self.labels.iter().filter(|&&l| l == label).count()
    }

    /// Foreground and probable foreground become 1.
    pub fn foreground_mask(&self) -> Mask {
        Mask::from_fn(self.width, self.height, |x, y| self.get(x, y).is_foreground())
    }

    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }
}

/// Runs `iterations` rounds of graph-cut segmentation, updating the probable labels in `seeds`.
///
/// Fails when the seed map has no foreground or no background samples, when its
/// size differs from the image, or when a colour model degenerates.
pub fn grab_cut(image: &RgbImage, seeds: &mut SeedMap, iterations: usize) -> Result<()> {
    if image.dimensions() != seeds.dimensions() {
        return Err(SpriteCutoutError::Solver {
            reason: format!(
                "seed map is {:?} but image is {:?}",
                seeds.dimensions(),
                image.dimensions()
            ),
        });
    }

    let colors: Vec<Vector3<f64>> = image
        .pixels()
        .map(|p| Vector3::new(f64::from(p[0]), f64::from(p[1]), f64::from(p[2])))
        .collect();

    let (mut background, mut foreground) = init_models(&colors, seeds)?;
    let links = NeighbourLinks::new(image);

    for round in 0..iterations {
        let mut bg_samples = Vec::new();
        let mut bg_assignment = Vec::new();
        let mut fg_samples = Vec::new();
        let mut fg_assignment = Vec::new();
        for (color, label) in colors.iter().zip(&seeds.labels) {
            if label.is_foreground() {
                fg_assignment.push(foreground.most_likely_component(color));
                fg_samples.push(*color);
            } else {
                bg_assignment.push(background.most_likely_component(color));
                bg_samples.push(*color);
            }
        }
        background = Gmm::learn(&bg_samples, &bg_assignment, "background")?;
        foreground = Gmm::learn(&fg_samples, &fg_assignment, "foreground")?;

        let mut graph = build_graph(&colors, seeds, &links, &background, &foreground);
        let flow = graph.max_flow();
        let source_side = graph.source_side();

        let mut changed = 0usize;
        for (i, label) in seeds.labels.iter_mut().enumerate() {
            if label.is_probable() {
                let next = if source_side[i] {
                    SeedLabel::ProbableForeground
                } else {
                    SeedLabel::ProbableBackground
                };
                changed += usize::from(next != *label);
                *label = next;
            }
        }
        tracing::debug!(round, flow, changed, "graph cut iteration");
    }

    Ok(())
}

fn init_models(colors: &[Vector3<f64>], seeds: &SeedMap) -> Result<(Gmm, Gmm)> {
    let (fg, bg): (Vec<_>, Vec<_>) = colors
        .iter()
        .zip(&seeds.labels)
        .partition(|(_, label)| label.is_foreground());
    let fg: Vec<Vector3<f64>> = fg.into_iter().map(|(c, _)| *c).collect();
    let bg: Vec<Vector3<f64>> = bg.into_iter().map(|(c, _)| *c).collect();

    if bg.is_empty() || fg.is_empty() {
        return Err(SpriteCutoutError::Solver {
            reason: format!(
                "cannot initialise colour models ({} foreground, {} background samples)",
                fg.len(),
                bg.len()
            ),
        });
    }

    let background = Gmm::learn(&bg, &kmeans(&bg), "background")?;
    let foreground = Gmm::learn(&fg, &kmeans(&fg), "foreground")?;
    Ok((background, foreground))
}

/// Deterministic k-means: farthest-point seeding followed by Lloyd iterations.
fn kmeans(samples: &[Vector3<f64>]) -> Vec<usize> {
    let mut centers = vec![samples[0]];
    let mut nearest: Vec<f64> = samples
        .iter()
        .map(|s| (s - samples[0]).norm_squared())
        .collect();
    while centers.len() < COMPONENTS {
        let (far, distance) = nearest
            .iter()
            .enumerate()
            .fold((0, 0.0), |best, (i, &d)| if d > best.1 { (i, d) } else { best });
        if distance <= 0.0 {
            break;
        }
        let center = samples[far];
        for (d, s) in nearest.iter_mut().zip(samples) {
            *d = d.min((s - center).norm_squared());
        }
        centers.push(center);
    }

    let closest = |s: &Vector3<f64>, centers: &[Vector3<f64>]| {
        centers
            .iter()
            .enumerate()
            .map(|(k, c)| (k, (s - c).norm_squared()))
            .fold((0, f64::INFINITY), |best, (k, d)| if d < best.1 { (k, d) } else { best })
            .0
    };

    let mut assignment = vec![0; samples.len()];
    for _ in 0..KMEANS_ITERATIONS {
        for (a, s) in assignment.iter_mut().zip(samples) {
            *a = closest(s, &centers);
        }
        let mut sums = vec![Vector3::zeros(); centers.len()];
        let mut counts = vec![0usize; centers.len()];
        for (&a, s) in assignment.iter().zip(samples) {
            sums[a] += s;
            counts[a] += 1;
        }
        for ((center, sum), count) in centers.iter_mut().zip(sums).zip(counts) {
            if count > 0 {
                *center = sum / count as f64;
            }
        }
    }
    assignment
}

/// Gaussian mixture colour model.
#[derive(Debug, Clone)]
struct Gmm {
    weights: [f64; COMPONENTS],
    means: [Vector3<f64>; COMPONENTS],
    inverses: [Matrix3<f64>; COMPONENTS],
    determinants: [f64; COMPONENTS],
}

impl Gmm {
    fn learn(samples: &[Vector3<f64>], assignment: &[usize], which: &str) -> Result<Self> {
        if samples.is_empty() {
            return Err(SpriteCutoutError::Solver {
                reason: format!("no {which} samples left"),
            });
        }

        let mut sums = [Vector3::<f64>::zeros(); COMPONENTS];
        let mut products = [Matrix3::<f64>::zeros(); COMPONENTS];
        let mut counts = [0usize; COMPONENTS];
        for (s, &k) in samples.iter().zip(assignment) {
            sums[k] += s;
            products[k] += s * s.transpose();
            counts[k] += 1;
        }

        let mut model = Self {
            weights: [0.0; COMPONENTS],
            means: [Vector3::zeros(); COMPONENTS],
            inverses: [Matrix3::zeros(); COMPONENTS],
            determinants: [0.0; COMPONENTS],
        };
        for k in 0..COMPONENTS {
            if counts[k] == 0 {
                continue;
            }
            let n = counts[k] as f64;
            let mean = sums[k] / n;
            let mut covariance = products[k] / n - mean * mean.transpose();
            let mut determinant = covariance.determinant();
            if determinant <= DETERMINANT_EPSILON {
                covariance += Matrix3::identity() * COVARIANCE_REGULARIZATION;
                determinant = covariance.determinant();
            }
            let inverse = covariance
                .try_inverse()
                .filter(|_| determinant > 0.0)
                .ok_or_else(|| SpriteCutoutError::Solver {
                    reason: format!("singular {which} covariance in component {k}"),
                })?;

            model.weights[k] = n / samples.len() as f64;
            model.means[k] = mean;
            model.inverses[k] = inverse;
            model.determinants[k] = determinant;
        }
        Ok(model)
    }

    fn component_density(&self, k: usize, color: &Vector3<f64>) -> f64 {
        if self.weights[k] <= 0.0 {
            return 0.0;
        }
        let d = color - self.means[k];
        let mahalanobis = (d.transpose() * self.inverses[k] * d)[(0, 0)];
        (-0.5 * mahalanobis).exp() / self.determinants[k].sqrt()
    }

    fn density(&self, color: &Vector3<f64>) -> f64 {
        (0..COMPONENTS)
            .map(|k| self.weights[k] * self.component_density(k, color))
            .sum()
    }

    fn most_likely_component(&self, color: &Vector3<f64>) -> usize {
        (0..COMPONENTS)
            .map(|k| (k, self.weights[k] * self.component_density(k, color)))
            .fold((0, f64::NEG_INFINITY), |best, (k, p)| if p > best.1 { (k, p) } else { best })
            .0
    }

    fn data_cost(&self, color: &Vector3<f64>) -> f64 {
        -self.density(color).max(f64::MIN_POSITIVE).ln()
    }
}

/// Smoothness weights to the left, up-left, up and up-right neighbours.
struct NeighbourLinks {
    width: usize,
    left: Vec<f64>,
    up_left: Vec<f64>,
    up: Vec<f64>,
    up_right: Vec<f64>,
}

impl NeighbourLinks {
    fn new(image: &RgbImage) -> Self {
        let (width, height) = (image.width() as usize, image.height() as usize);
        let color = |x: usize, y: usize| {
            let p = image.get_pixel(x as u32, y as u32);
            Vector3::new(f64::from(p[0]), f64::from(p[1]), f64::from(p[2]))
        };
        let offsets: [(isize, isize); 4] = [(-1, 0), (-1, -1), (0, -1), (1, -1)];

        let mut total = 0.0;
        let mut pairs = 0usize;
        for y in 0..height {
            for x in 0..width {
                for (dx, dy) in offsets {
                    if let Some((nx, ny)) = neighbour(x, y, dx, dy, width) {
                        total += (color(x, y) - color(nx, ny)).norm_squared();
                        pairs += 1;
                    }
                }
            }
        }
        let beta = if total <= f64::EPSILON || pairs == 0 {
            0.0
        } else {
            1.0 / (2.0 * total / pairs as f64)
        };

        let mut links: [Vec<f64>; 4] = std::array::from_fn(|_| vec![0.0; width * height]);
        for y in 0..height {
            for x in 0..width {
                for (slot, (dx, dy)) in offsets.into_iter().enumerate() {
                    if let Some((nx, ny)) = neighbour(x, y, dx, dy, width) {
                        let diff = (color(x, y) - color(nx, ny)).norm_squared();
                        let distance = if dx != 0 && dy != 0 {
                            std::f64::consts::SQRT_2
                        } else {
                            1.0
                        };
                        links[slot][y * width + x] = GAMMA / distance * (-beta * diff).exp();
                    }
                }
            }
        }
        let [left, up_left, up, up_right] = links;
        Self {
            width,
            left,
            up_left,
            up,
            up_right,
        }
    }
}

fn neighbour(x: usize, y: usize, dx: isize, dy: isize, width: usize) -> Option<(usize, usize)> {
    let nx = x.checked_add_signed(dx)?;
    let ny = y.checked_add_signed(dy)?;
    (nx < width).then_some((nx, ny))
}

fn build_graph(
    colors: &[Vector3<f64>],
    seeds: &SeedMap,
    links: &NeighbourLinks,
    background: &Gmm,
    foreground: &Gmm,
) -> FlowGraph {
    let width = links.width;
    let pixels = colors.len();
    let mut graph = FlowGraph::new(pixels, pixels * 5);

    for (i, (color, label)) in colors.iter().zip(&seeds.labels).enumerate() {
        let (from_source, to_sink) = match label {
            SeedLabel::Background => (0.0, LAMBDA),
            SeedLabel::Foreground => (LAMBDA, 0.0),
            _ => (background.data_cost(color), foreground.data_cost(color)),
        };
        graph.add_terminal(i, from_source, to_sink);

        let (x, y) = (i % width, i / width);
        if x > 0 {
            graph.add_edge(i, i - 1, links.left[i]);
        }
        if y > 0 {
            if x > 0 {
                graph.add_edge(i, i - width - 1, links.up_left[i]);
            }
            graph.add_edge(i, i - width, links.up[i]);
            if x + 1 < width {
                graph.add_edge(i, i - width + 1, links.up_right[i]);
            }
        }
    }
    graph
}

const NIL: u32 = u32::MAX;
const FLOW_EPSILON: f64 = 1e-9;

/// Residual graph for Dinic's max-flow. Arcs are stored in pairs so `a ^ 1` is the reverse arc.
struct FlowGraph {
    head: Vec<u32>,
    next: Vec<u32>,
    to: Vec<u32>,
    capacity: Vec<f64>,
    source: usize,
    sink: usize,
}

impl FlowGraph {
    fn new(pixels: usize, pair_hint: usize) -> Self {
        Self {
            head: vec![NIL; pixels + 2],
            next: Vec::with_capacity(pair_hint * 2),
            to: Vec::with_capacity(pair_hint * 2),
            capacity: Vec::with_capacity(pair_hint * 2),
            source: pixels,
            sink: pixels + 1,
        }
    }

    fn push_arc(&mut self, from: usize, to: usize, capacity: f64) {
        let id = self.to.len() as u32;
        self.to.push(to as u32);
        self.capacity.push(capacity);
        self.next.push(self.head[from]);
        self.head[from] = id;
    }

    /// Undirected smoothness edge.
    fn add_edge(&mut self, a: usize, b: usize, weight: f64) {
        self.push_arc(a, b, weight);
        self.push_arc(b, a, weight);
    }

    /// Only the difference between the two terminal weights affects the cut.
    fn add_terminal(&mut self, node: usize, from_source: f64, to_sink: f64) {
        let net = from_source - to_sink;
        if net > 0.0 {
            self.push_arc(self.source, node, net);
            self.push_arc(node, self.source, 0.0);
        } else if net < 0.0 {
            self.push_arc(node, self.sink, -net);
            self.push_arc(self.sink, node, 0.0);
        }
    }

    fn max_flow(&mut self) -> f64 {
        let nodes = self.head.len();
        let mut level = vec![NIL; nodes];
        let mut iter = vec![NIL; nodes];
        let mut total = 0.0;
        while self.build_levels(&mut level) {
            iter.copy_from_slice(&self.head);
            total += self.blocking_flow(&mut level, &mut iter);
        }
        total
    }

    fn build_levels(&self, level: &mut [u32]) -> bool {
        level.fill(NIL);
        level[self.source] = 0;
        let mut queue = std::collections::VecDeque::from([self.source]);
        while let Some(u) = queue.pop_front() {
            let mut a = self.head[u];
            while a != NIL {
                let v = self.to[a as usize] as usize;
                if self.capacity[a as usize] > FLOW_EPSILON && level[v] == NIL {
                    level[v] = level[u] + 1;
                    queue.push_back(v);
                }
                a = self.next[a as usize];
            }
        }
        level[self.sink] != NIL
    }

    fn blocking_flow(&mut self, level: &mut [u32], iter: &mut [u32]) -> f64 {
        let mut total = 0.0;
        let mut path: Vec<u32> = Vec::new();
        let mut u = self.source;
        loop {
            if u == self.sink {
                let bottleneck = path
                    .iter()
                    .map(|&a| self.capacity[a as usize])
                    .fold(f64::INFINITY, f64::min);
                for &a in &path {
                    self.capacity[a as usize] -= bottleneck;
                    self.capacity[(a ^ 1) as usize] += bottleneck;
                }
                total += bottleneck;
                let saturated = path
                    .iter()
                    .position(|&a| self.capacity[a as usize] <= FLOW_EPSILON)
                    .unwrap_or(0);
                path.truncate(saturated);
                u = path
                    .last()
                    .map_or(self.source, |&a| self.to[a as usize] as usize);
                continue;
            }

            let mut advanced = false;
            while iter[u] != NIL {
                let a = iter[u] as usize;
                let v = self.to[a] as usize;
                if self.capacity[a] > FLOW_EPSILON && level[v] != NIL && level[v] == level[u] + 1 {
                    path.push(a as u32);
                    u = v;
                    advanced = true;
                    break;
                }
                iter[u] = self.next[a];
            }

            if !advanced {
                let Some(a) = path.pop() else {
                    return total;
                };
                level[u] = NIL;
                u = self.to[(a ^ 1) as usize] as usize;
                iter[u] = self.next[iter[u] as usize];
            }
        }
    }

    /// Nodes reachable from the source in the residual graph.
    fn source_side(&self) -> Vec<bool> {
        let mut seen = vec![false; self.head.len()];
        seen[self.source] = true;
        let mut stack = vec![self.source];
        while let Some(u) = stack.pop() {
            let mut a = self.head[u];
            while a != NIL {
                let v = self.to[a as usize] as usize;
                if self.capacity[a as usize] > FLOW_EPSILON && !seen[v] {
                    seen[v] = true;
                    stack.push(v);
                }
                a = self.next[a as usize];
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_max_flow_small_network() {
        // s -> 0 (3), s -> 1 (2), 0 <-> 1 (1), 0 -> t (2), 1 -> t (3)
        let mut graph = FlowGraph::new(2, 8);
        graph.add_terminal(0, 3.0, 0.0);
        graph.add_terminal(1, 2.0, 0.0);
        graph.add_edge(0, 1, 1.0);
        graph.push_arc(0, graph.sink, 2.0);
        graph.push_arc(graph.sink, 0, 0.0);
        graph.push_arc(1, graph.sink, 3.0);
        graph.push_arc(graph.sink, 1, 0.0);

        let flow = graph.max_flow();
        assert!((flow - 5.0).abs() < 1e-9);
        let side = graph.source_side();
        assert!(side[graph.source]);
        assert!(!side[graph.sink]);
    }

    #[test]
    fn test_cut_separates_terminals() {
        let mut graph = FlowGraph::new(3, 8);
        graph.add_terminal(0, 10.0, 0.0);
        graph.add_terminal(2, 0.0, 10.0);
        graph.add_edge(0, 1, 5.0);
        graph.add_edge(1, 2, 1.0);

        let flow = graph.max_flow();
        assert!((flow - 1.0).abs() < 1e-9);
        let side = graph.source_side();
        assert_eq!(&side[..3], &[true, true, false]);
    }

    #[test]
    fn test_requires_both_sample_sets() {
        let image = RgbImage::from_pixel(10, 10, Rgb([10, 20, 30]));
        let mut seeds = SeedMap::filled(10, 10, SeedLabel::ProbableBackground);
        assert!(matches!(
            grab_cut(&image, &mut seeds, 1),
            Err(SpriteCutoutError::Solver { .. })
        ));
    }

    #[test]
    fn test_rejects_mismatched_seed_map() {
        let image = RgbImage::new(10, 10);
        let mut seeds = SeedMap::filled(5, 5, SeedLabel::Foreground);
        assert!(grab_cut(&image, &mut seeds, 1).is_err());
    }

    #[test]
    fn test_separates_two_colour_regions() -> Result<()> {
        let image = RgbImage::from_fn(40, 40, |x, _| {
            if x < 20 {
                Rgb([30, 40, 200])
            } else {
                Rgb([230, 225, 220])
            }
        });
        let mut seeds = SeedMap::filled(40, 40, SeedLabel::ProbableBackground);
        for y in 0..40 {
            for x in 0..40 {
                let label = match x {
                    0..=4 => SeedLabel::Foreground,
                    35.. => SeedLabel::Background,
                    5..=24 => SeedLabel::ProbableForeground,
                    _ => SeedLabel::ProbableBackground,
                };
                seeds.set(x, y, label);
            }
        }

        grab_cut(&image, &mut seeds, 3)?;

        let mask = seeds.foreground_mask();
        assert_eq!(mask.count(), 20 * 40);
        assert!(mask.get(19, 20));
        assert!(!mask.get(20, 20));
        Ok(())
    }

    #[test]
    fn test_component_choice_uses_mixing_weights() {
        let mut weights = [0.0; COMPONENTS];
        weights[0] = 0.1;
        weights[1] = 0.9;
        let model = Gmm {
            weights,
            means: [Vector3::zeros(); COMPONENTS],
            inverses: [Matrix3::identity(); COMPONENTS],
            determinants: [1.0; COMPONENTS],
        };
        // Identical densities, so the heavier component wins.
        assert_eq!(model.most_likely_component(&Vector3::new(1.0, 2.0, 3.0)), 1);
    }

    #[test]
    fn test_kmeans_splits_clusters() {
        let mut samples = vec![Vector3::new(0.0, 0.0, 0.0); 10];
        samples.extend(vec![Vector3::new(255.0, 255.0, 255.0); 10]);
        let assignment = kmeans(&samples);
        assert!(assignment[..10].iter().all(|&a| a == assignment[0]));
        assert!(assignment[10..].iter().all(|&a| a == assignment[10]));
        assert_ne!(assignment[0], assignment[10]);
    }
}
