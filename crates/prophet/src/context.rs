//! Error-rate estimation at coarser inference levels, and in the run-specific,
//! experiment-wide and global contexts.
//!
//! Every level and context runs the identical calculator from [`crate::fdr`];
//! only the set of representative entities it is fit on changes.

use crate::fdr::ErrorStatistics;
use crate::record::{by_score_desc, rank, Entity, ScoreRow, ScoreTable};
use crate::settings::{Context, ErrorSettings};
use crate::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceLevel {
    PeakGroup,
    Transition,
    Peptide,
    Protein,
    Gene,
    Glycopeptide,
}

impl InferenceLevel {
    pub fn name(&self) -> &'static str {
        match self {
            InferenceLevel::PeakGroup => "peakgroup",
            InferenceLevel::Transition => "transition",
            InferenceLevel::Peptide => "peptide",
            InferenceLevel::Protein => "protein",
            InferenceLevel::Gene => "gene",
            InferenceLevel::Glycopeptide => "glycopeptide",
        }
    }
}

/// Error model fit on one partition of the representatives: a single run
/// for run-specific inference, all runs otherwise (`run_id == None`)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub run_id: Option<String>,
    pub statistics: ErrorStatistics,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Inference {
    pub level: InferenceLevel,
    pub context: Context,
    pub table: ScoreTable,
    pub partitions: Vec<Partition>,
}

impl Inference {
    pub fn statistics(&self, run_id: Option<&str>) -> Option<&ErrorStatistics> {
        self.partitions
            .iter()
            .find(|p| p.run_id.as_deref() == run_id)
            .or_else(|| self.partitions.iter().find(|p| p.run_id.is_none()))
            .map(|p| &p.statistics)
    }
}

/// Representative entity of a rolled-up key
struct Representative<'a> {
    key: &'a str,
    run_id: Option<&'a str>,
    entity: &'a Entity,
}

pub struct Aggregator<'a> {
    settings: &'a ErrorSettings,
}

impl<'a> Aggregator<'a> {
    pub fn new(settings: &'a ErrorSettings) -> Self {
        Self { settings }
    }

    /// Fit one error model per partition. Partitions are keyed by run for
    /// run-specific inference, and collapse to `None` otherwise.
    fn fit_partitions<'e, I>(&self, context: Context, entities: I) -> Result<Vec<Partition>, Error>
    where
        I: IntoIterator<Item = (Option<&'e str>, &'e Entity)>,
    {
        let mut scores: BTreeMap<Option<&str>, (Vec<f64>, Vec<f64>)> = BTreeMap::new();
        for (run_id, entity) in entities {
            let key = match context {
                Context::RunSpecific => run_id,
                Context::ExperimentWide | Context::Global => None,
            };
            let (targets, decoys) = scores.entry(key).or_default();
            match entity.is_decoy {
                true => decoys.push(entity.d_score),
                false => targets.push(entity.d_score),
            }
        }

        if scores.is_empty() {
            return Err(Error::NoTargets);
        }

        scores
            .into_iter()
            .map(|(run_id, (targets, decoys))| {
                let statistics = ErrorStatistics::fit(&targets, &decoys, self.settings)?;
                log::debug!(
                    "- {:?} partition {}: {} targets, {} decoys, pi0 = {:.4}",
                    context,
                    run_id.unwrap_or("(all runs)"),
                    targets.len(),
                    decoys.len(),
                    statistics.pi0()
                );
                Ok(Partition {
                    run_id: run_id.map(String::from),
                    statistics,
                })
            })
            .collect()
    }

    fn row(partitions: &[Partition], context: Context, entity: &Entity, rank: usize) -> Result<ScoreRow, Error> {
        let partition = match context {
            Context::RunSpecific => partitions
                .iter()
                .find(|p| p.run_id.as_deref() == entity.run_id.as_deref()),
            Context::ExperimentWide | Context::Global => partitions.first(),
        }
        .ok_or(Error::NoTargets)?;
        let stats = partition.statistics.lookup(entity.d_score);
        Ok(ScoreRow {
            id: entity.id.clone(),
            run_id: entity.run_id.clone(),
            group_id: entity.group_id.clone(),
            is_decoy: entity.is_decoy,
            rank,
            d_score: entity.d_score,
            p_value: stats.p_value,
            q_value: stats.q_value,
            s_value: stats.s_value,
            local_fdr: stats.local_fdr,
        })
    }

    /// Peak-group level: the error model is fit on the best candidate of
    /// every `(run, group_id)` block. Every candidate, whatever its rank,
    /// receives statistics by nearest-score lookup. Rows keep input order.
    pub fn peak_groups(&self, context: Context, entities: &[Entity]) -> Result<Inference, Error> {
        check_scored(entities)?;
        let refs = entities.iter().collect::<Vec<_>>();
        let scores = entities.iter().map(|e| e.d_score).collect::<Vec<_>>();
        let ranks = rank(&refs, &scores);

        let top = entities
            .iter()
            .zip(&ranks)
            .filter(|(_, &r)| r == 1)
            .map(|(e, _)| e);

        let partitions = match context {
            Context::Global => {
                // Best candidate per group across all runs
                let mut best: BTreeMap<&str, &Entity> = BTreeMap::new();
                for entity in top {
                    best.entry(entity.group_id.as_str())
                        .and_modify(|e| {
                            if by_score_desc((entity.d_score, &entity.id), (e.d_score, &e.id)).is_lt() {
                                *e = entity;
                            }
                        })
                        .or_insert(entity);
                }
                self.fit_partitions(context, best.into_values().map(|e| (None, e)))?
            }
            _ => self.fit_partitions(context, top.map(|e| (e.run_id.as_deref(), e)))?,
        };

        let rows = entities
            .iter()
            .zip(&ranks)
            .map(|(entity, &rank)| Self::row(&partitions, context, entity, rank))
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(Inference {
            level: InferenceLevel::PeakGroup,
            context,
            table: ScoreTable::new(rows),
            partitions,
        })
    }

    /// Roll scored entities up to a coarser level and estimate error rates
    /// there. `key` maps an entity to its identifier at the target level
    /// (e.g. peptide or protein id); entities without a key are ignored. The
    /// representative of each key is the entity with the highest d-score
    /// (ties: lowest id).
    ///
    /// * run-specific: one representative and one error model per run
    /// * experiment-wide: one representative per run, pooled into a single
    ///   error model
    /// * global: one representative across all runs (`run_id == None`)
    pub fn infer<'e, K>(
        &self,
        level: InferenceLevel,
        context: Context,
        entities: &'e [Entity],
        key: K,
    ) -> Result<Inference, Error>
    where
        K: Fn(&'e Entity) -> Option<&'e str>,
    {
        check_scored(entities)?;
        let mut best: BTreeMap<(Option<&str>, &str), Representative> = BTreeMap::new();
        for entity in entities {
            let Some(k) = key(entity) else {
                continue;
            };
            let run_id = match context {
                Context::Global => None,
                _ => entity.run_id.as_deref(),
            };
            best.entry((run_id, k))
                .and_modify(|r| {
                    if by_score_desc((entity.d_score, &entity.id), (r.entity.d_score, &r.entity.id)).is_lt() {
                        r.entity = entity;
                    }
                })
                .or_insert(Representative {
                    key: k,
                    run_id,
                    entity,
                });
        }

        let rolled = best
            .into_values()
            .map(|r| Entity {
                id: r.key.to_string(),
                run_id: r.run_id.map(String::from),
                group_id: r.key.to_string(),
                is_decoy: r.entity.is_decoy,
                features: Default::default(),
                d_score: r.entity.d_score,
            })
            .collect::<Vec<_>>();

        let partitions =
            self.fit_partitions(context, rolled.iter().map(|e| (e.run_id.as_deref(), e)))?;
        let rows = rolled
            .iter()
            .map(|entity| Self::row(&partitions, context, entity, 1))
            .collect::<Result<Vec<_>, Error>>()?;

        log::info!(
            "{} level, {:?}: {} of {} entries pass 1% FDR",
            level.name(),
            context,
            rows.iter().filter(|r| !r.is_decoy && r.q_value <= 0.01).count(),
            rows.len()
        );

        Ok(Inference {
            level,
            context,
            table: ScoreTable::new(rows),
            partitions,
        })
    }
}

fn check_scored(entities: &[Entity]) -> Result<(), Error> {
    match entities.iter().find(|e| e.d_score.is_nan()) {
        Some(e) => Err(Error::Configuration(format!(
            "entity `{}` has not been scored",
            e.id
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Two runs, each with `n` targets (strong and weak) and `n` decoys
    fn scored(n: usize) -> Vec<Entity> {
        let mut entities = Vec::new();
        for run in ["r1", "r2"] {
            for i in 0..n {
                let t = match i % 2 {
                    0 => 3.0 + (i as f64 / n as f64),
                    _ => (i as f64 / n as f64) * 2.0 - 1.0,
                };
                let d = (i as f64 / n as f64) * 2.0 - 1.0;
                entities.push(
                    Entity::new(format!("{run}_t{i}"), format!("pg_t{i}"), false)
                        .with_run(run)
                        .with_d_score(t),
                );
                entities.push(
                    Entity::new(format!("{run}_d{i}"), format!("pg_d{i}"), true)
                        .with_run(run)
                        .with_d_score(d),
                );
            }
        }
        entities
    }

    #[test]
    fn experiment_wide_identical_runs() {
        let settings = ErrorSettings::default();
        let entities = scored(200);
        let inference = Aggregator::new(&settings)
            .peak_groups(Context::ExperimentWide, &entities)
            .unwrap();
        assert_eq!(inference.partitions.len(), 1);
        let rows = inference.table.rows();
        assert_eq!(rows.len(), entities.len());
        for (a, b) in rows[..400].iter().zip(&rows[400..]) {
            assert_eq!(a.group_id, b.group_id);
            assert_eq!(a.q_value, b.q_value);
            assert_eq!(a.local_fdr, b.local_fdr);
        }
    }

    #[test]
    fn run_specific_partitions() {
        let settings = ErrorSettings::default();
        let entities = scored(100);
        let inference = Aggregator::new(&settings)
            .peak_groups(Context::RunSpecific, &entities)
            .unwrap();
        assert_eq!(inference.partitions.len(), 2);
        assert!(inference.statistics(Some("r2")).is_some());
    }

    #[test]
    fn rollup_by_key() {
        let settings = ErrorSettings::default();
        let entities = scored(100);
        // Pairs of peak groups map onto one peptide
        let peptides = entities
            .iter()
            .map(|e| {
                let ix: usize = e.group_id[4..].parse().unwrap();
                format!("{}_pep{}", &e.group_id[..4], ix / 2)
            })
            .collect::<Vec<_>>();
        let lookup = entities
            .iter()
            .zip(&peptides)
            .map(|(e, p)| (e.id.clone(), p.clone()))
            .collect::<std::collections::HashMap<_, _>>();

        let aggregator = Aggregator::new(&settings);
        let key = |e: &Entity| lookup.get(&e.id).map(|s| s.as_str());

        let global = aggregator
            .infer(InferenceLevel::Peptide, Context::Global, &entities, key)
            .unwrap();
        // 50 target and 50 decoy peptides, runs collapsed
        assert_eq!(global.table.len(), 100);
        assert!(global.table.rows().iter().all(|r| r.run_id.is_none()));
        let best = global
            .table
            .rows()
            .iter()
            .find(|r| r.id == "pg_tpep0")
            .unwrap();
        // max of peak group 0 (3.0) and 1 (-0.98)
        assert_eq!(best.d_score, 3.0);

        let wide = aggregator
            .infer(InferenceLevel::Peptide, Context::ExperimentWide, &entities, key)
            .unwrap();
        assert_eq!(wide.table.len(), 200);
        assert_eq!(wide.partitions.len(), 1);

        let run = aggregator
            .infer(InferenceLevel::Peptide, Context::RunSpecific, &entities, key)
            .unwrap();
        assert_eq!(run.table.len(), 200);
        assert_eq!(run.partitions.len(), 2);
    }

    #[test]
    fn unscored_entities_are_rejected() {
        let settings = ErrorSettings::default();
        let entities = vec![Entity::new("a", "g", false).with_run("r1")];
        assert!(matches!(
            Aggregator::new(&settings).peak_groups(Context::Global, &entities),
            Err(Error::Configuration(_))
        ));
    }
}
