//! Gradient-boosted decision tree ensemble for binary (target vs. decoy)
//! classification, trained with logistic loss.
//!
//! Trees are grown depth-first with exact greedy split finding. Every
//! split maximizes the regularized second-order gain
//! `G_l²/(H_l+λ) + G_r²/(H_r+λ) - G²/(H+λ)`, and leaves predict
//! `-G/(H+λ)` scaled by the learning rate. Training is deterministic given a
//! seed and independent of the thread count.

use super::matrix::Matrix;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Fraction of training rows held out to monitor early stopping
const VALIDATION_FRACTION: f64 = 0.2;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostParams {
    pub n_estimators: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    pub min_child_weight: f64,
    /// L2 regularization on leaf weights
    pub lambda: f64,
    /// Fraction of rows sampled (without replacement) for every tree
    pub subsample: f64,
    /// Stop adding trees once the validation loss has not improved for this
    /// many rounds. Zero disables early stopping.
    pub early_stopping_rounds: usize,
}

impl Default for BoostParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            learning_rate: 0.1,
            max_depth: 3,
            min_child_weight: 1.0,
            lambda: 1.0,
            subsample: 1.0,
            early_stopping_rounds: 10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "lowercase")]
pub enum Node {
    Leaf {
        value: f64,
    },
    /// Rows with `x[feature] < threshold` go left, all others (including NaN)
    /// go right
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    pub fn predict(&self, x: &[f64]) -> f64 {
        let mut ix = 0;
        loop {
            match self.nodes[ix] {
                Node::Leaf { value } => return value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    ix = if x[feature] < threshold { left } else { right };
                }
            }
        }
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], ix: usize) -> usize {
            match nodes[ix] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, left).max(walk(nodes, right)),
            }
        }
        walk(&self.nodes, 0)
    }
}

/// A trained additive model: `score(x) = base_score + Σ tree(x)`, in log-odds
/// of belonging to the target class
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ensemble {
    pub base_score: f64,
    pub trees: Vec<Tree>,
}

impl Ensemble {
    fn margin(&self, x: &[f64]) -> f64 {
        self.trees
            .iter()
            .fold(self.base_score, |acc, tree| acc + tree.predict(x))
    }

    /// Raw (log-odds) scores, higher is more target-like
    pub fn score(&self, features: &Matrix) -> Vec<f64> {
        (0..features.rows)
            .into_par_iter()
            .map(|row| self.margin(features.row(row)))
            .collect()
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Mean negative log-likelihood
fn log_loss(margins: &[f64], labels: &[f64], rows: &[usize]) -> f64 {
    let sum = rows.iter().fold(0.0, |acc, &row| {
        let p = sigmoid(margins[row]).clamp(1E-15, 1.0 - 1E-15);
        let y = labels[row];
        acc - (y * p.ln() + (1.0 - y) * (1.0 - p).ln())
    });
    sum / rows.len().max(1) as f64
}

struct Grower<'a> {
    features: &'a Matrix,
    grad: &'a [f64],
    hess: &'a [f64],
    params: &'a BoostParams,
    nodes: Vec<Node>,
}

struct Candidate {
    gain: f64,
    feature: usize,
    threshold: f64,
}

impl<'a> Grower<'a> {
    fn leaf_value(&self, g: f64, h: f64) -> f64 {
        -g / (h + self.params.lambda) * self.params.learning_rate
    }

    fn best_split(&self, rows: &[usize], g: f64, h: f64) -> Option<Candidate> {
        let lambda = self.params.lambda;
        let parent = g * g / (h + lambda);
        let min_child = self.params.min_child_weight;

        let candidates = (0..self.features.cols)
            .into_par_iter()
            .map(|feature| {
                let mut sorted = rows
                    .iter()
                    .map(|&row| (self.features[(row, feature)], row))
                    .filter(|(x, _)| !x.is_nan())
                    .collect::<Vec<_>>();
                sorted.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

                let mut best: Option<Candidate> = None;
                let (mut gl, mut hl) = (0.0, 0.0);
                for pair in sorted.windows(2) {
                    let (x, row) = pair[0];
                    gl += self.grad[row];
                    hl += self.hess[row];
                    if x == pair[1].0 {
                        continue;
                    }
                    let (gr, hr) = (g - gl, h - hl);
                    if hl < min_child || hr < min_child {
                        continue;
                    }
                    let gain = gl * gl / (hl + lambda) + gr * gr / (hr + lambda) - parent;
                    if best.as_ref().map_or(true, |b| gain > b.gain) {
                        best = Some(Candidate {
                            gain,
                            feature,
                            threshold: 0.5 * (x + pair[1].0),
                        });
                    }
                }
                best
            })
            .collect::<Vec<_>>();

        // Sequential reduction keeps the choice independent of scheduling:
        // ties go to the lowest feature index
        candidates
            .into_iter()
            .flatten()
            .fold(None, |acc: Option<Candidate>, c| match acc {
                Some(a) if a.gain >= c.gain => Some(a),
                _ => Some(c),
            })
            .filter(|c| c.gain > 1E-12)
    }

    fn grow(&mut self, rows: Vec<usize>, depth: usize) -> usize {
        let (g, h) = rows
            .iter()
            .fold((0.0, 0.0), |(g, h), &row| (g + self.grad[row], h + self.hess[row]));

        let ix = self.nodes.len();
        self.nodes.push(Node::Leaf {
            value: self.leaf_value(g, h),
        });

        if depth >= self.params.max_depth || rows.len() < 2 {
            return ix;
        }
        let Some(split) = self.best_split(&rows, g, h) else {
            return ix;
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .into_iter()
            .partition(|&row| self.features[(row, split.feature)] < split.threshold);

        let left = self.grow(left_rows, depth + 1);
        let right = self.grow(right_rows, depth + 1);
        self.nodes[ix] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        ix
    }
}

/// Train an ensemble separating targets (`decoy[i] == false`, positive
/// class) from decoys.
///
/// Returns the ensemble and its loss on the held-out validation rows (or on
/// the training rows, when early stopping is disabled). Returns `None` if
/// either class is missing.
pub fn train(
    features: &Matrix,
    decoy: &[bool],
    params: &BoostParams,
    seed: u64,
) -> Option<(Ensemble, f64)> {
    assert_eq!(features.rows, decoy.len());
    let labels = decoy
        .iter()
        .map(|&d| if d { 0.0 } else { 1.0 })
        .collect::<Vec<_>>();

    let mut rng = SmallRng::seed_from_u64(seed);
    let mut rows = (0..features.rows).collect::<Vec<_>>();

    let (train_rows, valid_rows) =
        if params.early_stopping_rounds > 0 && features.rows >= 10 {
            rows.shuffle(&mut rng);
            let n_valid = ((features.rows as f64 * VALIDATION_FRACTION).round() as usize).max(1);
            let valid = rows.split_off(features.rows - n_valid);
            (rows, valid)
        } else {
            (rows.clone(), rows)
        };

    let positives = train_rows.iter().filter(|&&row| labels[row] == 1.0).count();
    if positives == 0 || positives == train_rows.len() {
        return None;
    }
    let prior = positives as f64 / train_rows.len() as f64;
    let base_score = (prior / (1.0 - prior)).ln();

    let mut margins = vec![base_score; features.rows];
    let mut grad = vec![0.0; features.rows];
    let mut hess = vec![0.0; features.rows];

    let mut trees: Vec<Tree> = Vec::with_capacity(params.n_estimators);
    let mut best = (log_loss(&margins, &labels, &valid_rows), 0);
    let n_sample = ((train_rows.len() as f64 * params.subsample.clamp(0.0, 1.0)).ceil() as usize)
        .clamp(1, train_rows.len());

    for round in 0..params.n_estimators {
        for &row in &train_rows {
            let p = sigmoid(margins[row]);
            grad[row] = p - labels[row];
            hess[row] = (p * (1.0 - p)).max(1E-16);
        }

        let mut sample = train_rows.clone();
        if n_sample < sample.len() {
            sample.shuffle(&mut rng);
            sample.truncate(n_sample);
            sample.sort_unstable();
        }

        let mut grower = Grower {
            features,
            grad: &grad,
            hess: &hess,
            params,
            nodes: Vec::new(),
        };
        grower.grow(sample, 0);
        let tree = Tree {
            nodes: grower.nodes,
        };

        margins
            .par_iter_mut()
            .enumerate()
            .for_each(|(row, m)| *m += tree.predict(features.row(row)));
        trees.push(tree);

        let loss = log_loss(&margins, &labels, &valid_rows);
        if loss < best.0 {
            best = (loss, round + 1);
        } else if params.early_stopping_rounds > 0
            && round + 1 - best.1 >= params.early_stopping_rounds
        {
            log::trace!("- early stopping after {} trees", best.1);
            break;
        }
    }

    if params.early_stopping_rounds > 0 {
        trees.truncate(best.1);
    }
    let loss = if params.early_stopping_rounds > 0 {
        best.0
    } else {
        log_loss(&margins, &labels, &valid_rows)
    };
    if !loss.is_finite() {
        return None;
    }

    Some((Ensemble { base_score, trees }, loss))
}

#[cfg(test)]
mod test {
    use super::*;

    fn separable(n: usize) -> (Matrix, Vec<bool>) {
        let mut data = Vec::new();
        let mut decoy = Vec::new();
        for i in 0..n {
            let is_decoy = i % 2 == 0;
            let x = if is_decoy { i as f64 * 0.01 } else { 5.0 + i as f64 * 0.01 };
            data.extend([x, (i % 7) as f64]);
            decoy.push(is_decoy);
        }
        (Matrix::new(data, n, 2), decoy)
    }

    #[test]
    fn separates_classes() {
        let (features, decoy) = separable(100);
        let (model, loss) = train(&features, &decoy, &BoostParams::default(), 1).unwrap();
        assert!(loss < 0.3, "loss {}", loss);
        let scores = model.score(&features);
        for (score, d) in scores.iter().zip(&decoy) {
            match d {
                true => assert!(*score < 0.0),
                false => assert!(*score > 0.0),
            }
        }
        assert!(model.trees.iter().all(|t| t.depth() <= 3));
    }

    #[test]
    fn deterministic_given_seed() {
        let (features, decoy) = separable(60);
        let params = BoostParams {
            subsample: 0.7,
            ..Default::default()
        };
        let a = train(&features, &decoy, &params, 9).unwrap();
        let b = train(&features, &decoy, &params, 9).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn single_class() {
        let (features, _) = separable(20);
        assert!(train(&features, &[false; 20], &BoostParams::default(), 0).is_none());
    }

    #[test]
    fn serde_roundtrip() {
        let (features, decoy) = separable(40);
        let (model, _) = train(&features, &decoy, &BoostParams::default(), 3).unwrap();
        let json = serde_json::to_string(&model).unwrap();
        let back: Ensemble = serde_json::from_str(&json).unwrap();
        for (a, b) in model.score(&features).iter().zip(back.score(&features)) {
            assert!((a - b).abs() < 1E-9);
        }
    }
}
