use crate::runner::Runner;
use prophet_core::context::{Inference, InferenceLevel, Partition};
use prophet_core::fdr::ErrorRow;
use prophet_core::record::{ScoreRow, ScoreTable};
use prophet_core::scoring::{Diagnostics, Scored};
use prophet_core::settings::Context;
use prophet_core::weights::WeightVector;
use rayon::prelude::*;
use serde::Serialize;

const SCORE_HEADERS: [&str; 10] = [
    "run_id",
    "group_id",
    "id",
    "decoy",
    "rank",
    "d_score",
    "p_value",
    "q_value",
    "s_value",
    "pep",
];

/// Error-rate summary of one partition of an error model
#[derive(Serialize)]
struct PartitionSummary<'a> {
    level: InferenceLevel,
    context: Context,
    run_id: Option<&'a str>,
    pi0: f64,
    num_targets: usize,
    num_decoys: usize,
    summary: Vec<SummaryRow>,
}

#[derive(Serialize)]
struct SummaryRow {
    qvalue_cutoff: f64,
    #[serde(flatten)]
    statistics: ErrorRow,
}

#[derive(Serialize)]
struct Report<'a> {
    diagnostics: &'a Diagnostics,
    error_models: Vec<PartitionSummary<'a>>,
}

fn summarize(
    level: InferenceLevel,
    context: Context,
    partitions: &[Partition],
) -> impl Iterator<Item = PartitionSummary<'_>> {
    partitions.iter().map(move |p| PartitionSummary {
        level,
        context,
        run_id: p.run_id.as_deref(),
        pi0: p.statistics.pi0(),
        num_targets: p.statistics.null_model.num_targets,
        num_decoys: p.statistics.null_model.num_decoys,
        summary: p
            .statistics
            .summary()
            .into_iter()
            .map(|(qvalue_cutoff, statistics)| SummaryRow {
                qvalue_cutoff,
                statistics,
            })
            .collect(),
    })
}

impl Runner {
    pub fn serialize_row(&self, row: &ScoreRow) -> csv::ByteRecord {
        let mut record = csv::ByteRecord::new();
        record.push_field(row.run_id.as_deref().unwrap_or_default().as_bytes());
        record.push_field(row.group_id.as_bytes());
        record.push_field(row.id.as_bytes());
        record.push_field(itoa::Buffer::new().format(row.is_decoy as u8).as_bytes());
        record.push_field(itoa::Buffer::new().format(row.rank).as_bytes());
        record.push_field(ryu::Buffer::new().format(row.d_score).as_bytes());
        record.push_field(ryu::Buffer::new().format(row.p_value).as_bytes());
        record.push_field(ryu::Buffer::new().format(row.q_value).as_bytes());
        record.push_field(ryu::Buffer::new().format(row.s_value).as_bytes());
        record.push_field(ryu::Buffer::new().format(row.local_fdr).as_bytes());
        record
    }

    pub fn write_table(&self, table: &ScoreTable, file_name: &str) -> anyhow::Result<String> {
        let path = self.make_path(file_name);

        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(vec![]);
        wtr.write_byte_record(&csv::ByteRecord::from(SCORE_HEADERS.to_vec()))?;

        for record in table
            .rows()
            .par_iter()
            .map(|row| self.serialize_row(row))
            .collect::<Vec<_>>()
        {
            wtr.write_byte_record(&record)?;
        }

        wtr.flush()?;
        let bytes = wtr.into_inner()?;
        std::fs::write(&path, bytes)?;
        Ok(path.display().to_string())
    }

    /// One table per level, holding the rows of every context it was
    /// inferred in
    pub fn write_inferences(
        &self,
        level: InferenceLevel,
        inferences: &[&Inference],
    ) -> anyhow::Result<String> {
        let path = self.make_path(format!("{}.prophet.tsv", level.name()));

        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(vec![]);
        let mut headers = csv::ByteRecord::from(vec!["context"]);
        headers.extend(SCORE_HEADERS);
        wtr.write_byte_record(&headers)?;

        for inference in inferences {
            let context = match inference.context {
                Context::RunSpecific => "run-specific",
                Context::ExperimentWide => "experiment-wide",
                Context::Global => "global",
            };
            let records = inference
                .table
                .rows()
                .par_iter()
                .map(|row| {
                    let mut record = csv::ByteRecord::from(vec![context]);
                    record.extend(self.serialize_row(row).iter());
                    record
                })
                .collect::<Vec<_>>();
            for record in records {
                wtr.write_byte_record(&record)?;
            }
        }

        wtr.flush()?;
        let bytes = wtr.into_inner()?;
        std::fs::write(&path, bytes)?;
        Ok(path.display().to_string())
    }

    pub fn write_weights(&self, weights: &WeightVector) -> anyhow::Result<String> {
        let path = self.make_path("weights.json");
        std::fs::write(&path, weights.to_json()?)?;
        Ok(path.display().to_string())
    }

    pub fn write_diagnostics(
        &self,
        scored: &Scored,
        inferences: &[Inference],
    ) -> anyhow::Result<String> {
        let path = self.make_path("diagnostics.json");

        let mut error_models = summarize(
            InferenceLevel::PeakGroup,
            self.parameters.settings.context,
            &scored.partitions,
        )
        .collect::<Vec<_>>();
        for inference in inferences {
            error_models.extend(summarize(
                inference.level,
                inference.context,
                &inference.partitions,
            ));
        }

        let report = Report {
            diagnostics: &scored.diagnostics,
            error_models,
        };
        std::fs::write(&path, serde_json::to_vec_pretty(&report)?)?;
        Ok(path.display().to_string())
    }
}
