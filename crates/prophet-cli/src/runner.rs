use super::input::Search;
use anyhow::{ensure, Context};
use fnv::{FnvHashMap, FnvHashSet};
use log::info;
use prophet_core::context::{Aggregator, Inference, InferenceLevel};
use prophet_core::record::Entity;
use prophet_core::scoring::{apply_weights, score, Scored};
use prophet_core::weights::WeightVector;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Levels above the peak group that can be inferred from id columns
pub const ROLLUP_LEVELS: [(InferenceLevel, &str); 3] = [
    (InferenceLevel::Peptide, "peptide_id"),
    (InferenceLevel::Protein, "protein_id"),
    (InferenceLevel::Gene, "gene_id"),
];

/// Peak groups read from one or more tab-separated tables
#[derive(Default)]
pub struct PeakGroups {
    pub entities: Vec<Entity>,
    /// Entity id -> identifier at a coarser level, for every level whose id
    /// column was present
    pub keys: FnvHashMap<InferenceLevel, FnvHashMap<String, String>>,
}

fn parse_decoy(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "-1" | "true" | "True" | "TRUE" => Some(true),
        "0" | "false" | "False" | "FALSE" => Some(false),
        _ => None,
    }
}

fn parse_feature(value: &str) -> Option<f64> {
    match value.trim() {
        "" | "NA" | "nan" | "NaN" => None,
        v => v.parse::<f64>().ok(),
    }
}

impl PeakGroups {
    /// Read a table of scored peak groups. Required columns are `group_id`,
    /// `id` and `decoy`; `run_id` defaults to the file stem. Columns named
    /// `main_var_*` or `var_*` are features.
    pub fn read<P: AsRef<Path>>(&mut self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .from_path(path)
            .with_context(|| format!("Failed to open `{}`", path.display()))?;
        let headers = rdr.headers()?.clone();

        let column = |name: &str| headers.iter().position(|h| h == name);
        let group_ix = column("group_id").context("missing `group_id` column")?;
        let id_ix = column("id").context("missing `id` column")?;
        let decoy_ix = column("decoy").context("missing `decoy` column")?;
        let run_ix = column("run_id");
        let features = headers
            .iter()
            .enumerate()
            .filter(|(_, h)| h.starts_with("main_var_") || h.starts_with("var_"))
            .map(|(ix, h)| (ix, h.to_string()))
            .collect::<Vec<_>>();
        let levels = ROLLUP_LEVELS
            .iter()
            .filter_map(|(level, name)| column(name).map(|ix| (*level, ix)))
            .collect::<Vec<_>>();

        let default_run = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        let mut seen = self
            .entities
            .iter()
            .map(|e| e.id.clone())
            .collect::<FnvHashSet<_>>();

        for (line, record) in rdr.records().enumerate() {
            let record = record?;
            let field = |ix: usize| record.get(ix).unwrap_or_default();
            let id = field(id_ix).to_string();
            ensure!(
                seen.insert(id.clone()),
                "duplicate id `{}` in `{}`",
                id,
                path.display()
            );
            let is_decoy = parse_decoy(field(decoy_ix)).with_context(|| {
                format!(
                    "invalid `decoy` value `{}` on line {} of `{}`",
                    field(decoy_ix),
                    line + 2,
                    path.display()
                )
            })?;

            let mut entity = Entity::new(id.clone(), field(group_ix), is_decoy).with_run(
                run_ix
                    .map(|ix| field(ix).to_string())
                    .unwrap_or_else(|| default_run.clone()),
            );
            for (ix, name) in &features {
                if let Some(value) = parse_feature(field(*ix)) {
                    entity.features.insert(name.as_str(), value);
                }
            }
            for (level, ix) in &levels {
                let key = field(*ix);
                if !key.is_empty() {
                    self.keys
                        .entry(*level)
                        .or_default()
                        .insert(id.clone(), key.to_string());
                }
            }
            self.entities.push(entity);
        }

        log::trace!(
            "- read {} peak groups with {} features from {}",
            self.entities.len(),
            features.len(),
            path.display()
        );
        Ok(())
    }
}

pub struct Runner {
    pub parameters: Search,
    start: Instant,
}

impl Runner {
    pub fn new(parameters: Search) -> anyhow::Result<Self> {
        ensure!(
            !parameters.input_paths.is_empty(),
            "no input files to process"
        );
        Ok(Self {
            parameters,
            start: Instant::now(),
        })
    }

    pub(crate) fn make_path<S: AsRef<str>>(&self, file_name: S) -> PathBuf {
        self.parameters.output_directory.join(file_name.as_ref())
    }

    fn read_inputs(&self) -> anyhow::Result<PeakGroups> {
        let mut groups = PeakGroups::default();
        for path in &self.parameters.input_paths {
            groups.read(path)?;
        }
        info!(
            "read {} peak groups from {} files",
            groups.entities.len(),
            self.parameters.input_paths.len()
        );
        Ok(groups)
    }

    fn score(&self, entities: &mut [Entity]) -> anyhow::Result<Scored> {
        let settings = &self.parameters.settings;
        let scored = match &self.parameters.apply_weights {
            Some(path) => {
                let weights = WeightVector::load(path)
                    .with_context(|| format!("Failed to load weights from `{path}`"))?;
                info!("applying weights from {}", path);
                apply_weights(entities, weights, settings)?
            }
            None => score(entities, settings)?,
        };
        Ok(scored)
    }

    /// Error rates at every coarser level with an id column, in every
    /// configured context
    fn infer(&self, groups: &PeakGroups) -> anyhow::Result<Vec<Inference>> {
        let settings = &self.parameters.settings;
        let aggregator = Aggregator::new(&settings.error);
        let pool = settings.thread_pool()?;

        let mut inferences = Vec::new();
        for (level, _) in ROLLUP_LEVELS {
            let Some(keys) = groups.keys.get(&level) else {
                continue;
            };
            for &context in &self.parameters.inference_contexts {
                let inference = pool.install(|| {
                    aggregator.infer(level, context, &groups.entities, |e| {
                        keys.get(&e.id).map(String::as_str)
                    })
                })?;
                info!(
                    "discovered {} target {}s at 1% FDR ({:?})",
                    inference.table.passing(0.01),
                    level.name(),
                    context
                );
                inferences.push(inference);
            }
        }
        Ok(inferences)
    }

    pub fn run(mut self) -> anyhow::Result<Search> {
        let mut groups = self.read_inputs()?;
        let scored = self.score(&mut groups.entities)?;
        info!(
            "discovered {} target peak groups at 1% FDR",
            scored.table.passing(0.01)
        );

        let inferences = self.infer(&groups)?;

        log::trace!("writing outputs");
        let path = self.write_table(&scored.table, "results.prophet.tsv")?;
        self.parameters.output_paths.push(path);
        for (level, _) in ROLLUP_LEVELS {
            let tables = inferences
                .iter()
                .filter(|i| i.level == level)
                .collect::<Vec<_>>();
            if !tables.is_empty() {
                let path = self.write_inferences(level, &tables)?;
                self.parameters.output_paths.push(path);
            }
        }
        let path = self.write_weights(&scored.weights)?;
        self.parameters.output_paths.push(path);
        let path = self.write_diagnostics(&scored, &inferences)?;
        self.parameters.output_paths.push(path);

        let path = self.make_path("results.json");
        self.parameters
            .output_paths
            .push(path.display().to_string());
        println!("{}", serde_json::to_string_pretty(&self.parameters)?);

        let bytes = serde_json::to_vec_pretty(&self.parameters)?;
        std::fs::write(&path, bytes)?;

        let run_time = (Instant::now() - self.start).as_secs();
        info!("finished in {}s", run_time);
        Ok(self.parameters)
    }
}
