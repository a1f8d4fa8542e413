//! In-memory record model: scorable entities and the tables produced from them

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Ordered mapping of sub-score name to value. Insertion order is preserved,
/// and is the order in which features are presented to the learner.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Features(Vec<(String, f64)>);

impl Features {
    pub fn insert<S: Into<String>>(&mut self, name: S, value: f64) {
        let name = name.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some((_, v)) => *v = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(n, v)| (n.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, f64)> for Features {
    fn from_iter<I: IntoIterator<Item = (S, f64)>>(iter: I) -> Self {
        let mut features = Features::default();
        for (name, value) in iter {
            features.insert(name, value);
        }
        features
    }
}

/// One scorable unit: a peak group, transition, peptide, protein, ...
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    /// `None` when the entity is not tied to a single run
    pub run_id: Option<String>,
    /// Block key: entities sharing a group are never split across folds,
    /// and are ranked against each other
    pub group_id: String,
    pub is_decoy: bool,
    pub features: Features,
    /// Discriminant score, NaN until the entity has been scored
    pub d_score: f64,
}

impl Entity {
    pub fn new<S: Into<String>, G: Into<String>>(id: S, group_id: G, is_decoy: bool) -> Self {
        Entity {
            id: id.into(),
            run_id: None,
            group_id: group_id.into(),
            is_decoy,
            features: Features::default(),
            d_score: f64::NAN,
        }
    }

    pub fn with_run<S: Into<String>>(mut self, run_id: S) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_feature<S: Into<String>>(mut self, name: S, value: f64) -> Self {
        self.features.insert(name, value);
        self
    }

    pub fn with_d_score(mut self, d_score: f64) -> Self {
        self.d_score = d_score;
        self
    }
}

/// Descending by score (NaN sorts last), ties broken by ascending id
pub(crate) fn by_score_desc(a: (f64, &str), b: (f64, &str)) -> Ordering {
    let key = |s: f64| if s.is_nan() { f64::NEG_INFINITY } else { s };
    key(b.0).total_cmp(&key(a.0)).then_with(|| a.1.cmp(b.1))
}

/// Rank entities within their `(run_id, group_id)` block by `scores`,
/// descending. The best entity of each block receives rank 1.
///
/// # Invariants
/// * `scores` must have the same length as `entities`
pub fn rank(entities: &[&Entity], scores: &[f64]) -> Vec<usize> {
    assert_eq!(entities.len(), scores.len());
    let mut order = (0..entities.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| {
        let (ea, eb) = (entities[a], entities[b]);
        ea.run_id
            .cmp(&eb.run_id)
            .then_with(|| ea.group_id.cmp(&eb.group_id))
            .then_with(|| by_score_desc((scores[a], &ea.id), (scores[b], &eb.id)))
    });

    let mut ranks = vec![0; entities.len()];
    let mut current = 0;
    for (pos, &ix) in order.iter().enumerate() {
        let same_block = pos > 0 && {
            let prev = entities[order[pos - 1]];
            prev.run_id == entities[ix].run_id && prev.group_id == entities[ix].group_id
        };
        current = if same_block { current + 1 } else { 1 };
        ranks[ix] = current;
    }
    ranks
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoreRow {
    pub id: String,
    pub run_id: Option<String>,
    pub group_id: String,
    pub is_decoy: bool,
    pub rank: usize,
    pub d_score: f64,
    pub p_value: f64,
    pub q_value: f64,
    pub s_value: f64,
    pub local_fdr: f64,
}

/// Final per-entity error rates for one level/context invocation
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreTable {
    rows: Vec<ScoreRow>,
}

impl ScoreTable {
    pub fn new(rows: Vec<ScoreRow>) -> Self {
        ScoreTable { rows }
    }

    pub fn rows(&self) -> &[ScoreRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of top-ranked targets at or below a q-value threshold
    pub fn passing(&self, q_value: f64) -> usize {
        self.rows
            .iter()
            .filter(|row| !row.is_decoy && row.rank == 1 && row.q_value <= q_value)
            .count()
    }
}

impl IntoIterator for ScoreTable {
    type Item = ScoreRow;
    type IntoIter = std::vec::IntoIter<ScoreRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn features_keep_insertion_order() {
        let features = [("var_b", 1.0), ("main_var_a", 2.0), ("var_b", 3.0)]
            .into_iter()
            .collect::<Features>();
        assert_eq!(features.names().collect::<Vec<_>>(), vec!["var_b", "main_var_a"]);
        assert_eq!(features.get("var_b"), Some(3.0));
        assert_eq!(features.get("var_c"), None);
    }

    #[test]
    fn rank_within_blocks() {
        let entities = vec![
            Entity::new("a", "g1", false).with_run("r1"),
            Entity::new("b", "g1", false).with_run("r1"),
            Entity::new("c", "g1", false).with_run("r2"),
            Entity::new("d", "g2", true).with_run("r1"),
            Entity::new("e", "g1", false).with_run("r1"),
        ];
        let refs = entities.iter().collect::<Vec<_>>();
        let ranks = rank(&refs, &[1.0, 3.0, 0.5, f64::NAN, 3.0]);
        // "b" and "e" tie on score, "b" wins by id
        assert_eq!(ranks, vec![3, 1, 1, 1, 2]);
    }
}
