//! Cross-validation harness: block partitioning of entities into folds.
//!
//! Folds are assigned per `group_id`, so correlated rows (e.g. all candidate
//! peak groups of one precursor) always land in the same partition. Decoy
//! and target groups are shuffled and dealt out separately, so that every
//! partition receives decoys to model the null distribution.

use crate::record::Entity;
use crate::Error;
use fnv::FnvHashMap;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;

/// Minimum number of decoy groups required in every partition
pub const MIN_FOLD_DECOYS: usize = 2;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Split {
    /// Two folds: fold 0 holds (approximately) this fraction of groups and is
    /// used for training, fold 1 is held out
    Fraction(f64),
    /// `k` folds of (approximately) equal size
    KFold(usize),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FoldAssignment {
    folds: FnvHashMap<String, usize>,
    num_folds: usize,
}

impl FoldAssignment {
    pub fn num_folds(&self) -> usize {
        self.num_folds
    }

    pub fn fold(&self, group_id: &str) -> Option<usize> {
        self.folds.get(group_id).copied()
    }

    /// Indices of entities assigned to `fold`
    pub fn members(&self, entities: &[Entity], fold: usize) -> Vec<usize> {
        entities
            .iter()
            .enumerate()
            .filter(|(_, e)| self.fold(&e.group_id) == Some(fold))
            .map(|(ix, _)| ix)
            .collect()
    }
}

fn deal(groups: &[&str], split: Split, folds: &mut FnvHashMap<String, usize>) -> Vec<usize> {
    let mut counts = match split {
        Split::Fraction(_) => vec![0; 2],
        Split::KFold(k) => vec![0; k],
    };
    let n = groups.len();
    let n_train = match split {
        Split::Fraction(f) => {
            let n_train = (n as f64 * f).floor() as usize + 1;
            if n > 1 {
                n_train.min(n - 1)
            } else {
                n_train.min(n)
            }
        }
        Split::KFold(_) => 0,
    };

    for (ix, group) in groups.iter().enumerate() {
        let fold = match split {
            Split::Fraction(_) => usize::from(ix >= n_train),
            Split::KFold(k) => ix % k,
        };
        counts[fold] += 1;
        folds.insert(group.to_string(), fold);
    }
    counts
}

/// Assign every `group_id` present in `entities` to a fold.
///
/// Deterministic given `seed`: group ids are sorted before shuffling, so the
/// assignment does not depend on the order of `entities`.
pub fn assign_folds(entities: &[Entity], split: Split, seed: u64) -> Result<FoldAssignment, Error> {
    let num_folds = match split {
        Split::Fraction(f) if f > 0.0 && f < 1.0 => 2,
        Split::Fraction(f) => {
            return Err(Error::Configuration(format!(
                "cross-validation fraction must lie in (0, 1), got {f}"
            )))
        }
        Split::KFold(k) if k >= 2 => k,
        Split::KFold(k) => {
            return Err(Error::Configuration(format!(
                "cross-validation requires at least 2 folds, got {k}"
            )))
        }
    };

    // A group is a decoy group if it contains any decoy entity
    let mut groups: BTreeMap<&str, bool> = BTreeMap::new();
    for entity in entities {
        *groups.entry(entity.group_id.as_str()).or_default() |= entity.is_decoy;
    }

    let (mut decoys, mut targets): (Vec<&str>, Vec<&str>) = (Vec::new(), Vec::new());
    for (group, decoy) in groups {
        match decoy {
            true => decoys.push(group),
            false => targets.push(group),
        }
    }

    let mut rng = SmallRng::seed_from_u64(seed);
    decoys.shuffle(&mut rng);
    targets.shuffle(&mut rng);

    let mut folds = FnvHashMap::default();
    let decoy_counts = deal(&decoys, split, &mut folds);
    deal(&targets, split, &mut folds);

    if let Some((fold, count)) = decoy_counts
        .iter()
        .enumerate()
        .find(|(_, &count)| count < MIN_FOLD_DECOYS)
    {
        return Err(Error::Configuration(format!(
            "cross-validation split leaves {count} decoy group(s) in fold {fold} (of {} decoy groups); at least {MIN_FOLD_DECOYS} are required",
            decoys.len()
        )));
    }

    log::trace!(
        "- assigned {} groups to {} folds (decoy groups per fold: {:?})",
        folds.len(),
        num_folds,
        decoy_counts
    );

    Ok(FoldAssignment { folds, num_folds })
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn entities(groups: usize, per_group: usize) -> Vec<Entity> {
        (0..groups)
            .flat_map(|g| {
                (0..per_group).map(move |i| {
                    Entity::new(format!("{g}_{i}"), format!("group_{g}"), g % 3 == 0)
                        .with_run(format!("run_{}", i % 2))
                })
            })
            .collect()
    }

    #[quickcheck]
    fn groups_never_straddle_folds(seed: u64, groups: u8, k: u8) -> bool {
        let entities = entities(groups as usize + 30, 4);
        let split = match k % 4 {
            0 => Split::Fraction(0.5),
            x => Split::KFold(x as usize + 1),
        };
        let folds = match assign_folds(&entities, split, seed) {
            Ok(folds) => folds,
            Err(_) => return true,
        };
        entities.chunks(4).all(|block| {
            let fold = folds.fold(&block[0].group_id);
            fold.is_some() && block.iter().all(|e| folds.fold(&e.group_id) == fold)
        })
    }

    #[test]
    fn deterministic_given_seed() {
        let entities = entities(60, 3);
        let a = assign_folds(&entities, Split::Fraction(0.5), 42).unwrap();
        let b = assign_folds(&entities, Split::Fraction(0.5), 42).unwrap();
        assert_eq!(a, b);

        let mut reversed = entities.clone();
        reversed.reverse();
        let c = assign_folds(&reversed, Split::Fraction(0.5), 42).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn fraction_split_sizes() {
        // 20 decoy groups (g % 3 == 0) and 40 target groups
        let entities = entities(60, 1);
        let folds = assign_folds(&entities, Split::Fraction(0.5), 7).unwrap();
        let train = folds.members(&entities, 0);
        let test = folds.members(&entities, 1);
        assert_eq!(train.len() + test.len(), 60);
        assert_eq!(train.iter().filter(|&&ix| entities[ix].is_decoy).count(), 11);
        assert_eq!(train.iter().filter(|&&ix| !entities[ix].is_decoy).count(), 21);
    }

    #[test]
    fn too_few_decoys() {
        let entities = entities(4, 2);
        let err = assign_folds(&entities, Split::Fraction(0.5), 1).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(assign_folds(&entities, Split::Fraction(1.5), 1).is_err());
        assert!(assign_folds(&entities, Split::KFold(1), 1).is_err());
    }
}
