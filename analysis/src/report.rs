use crate::stats::{Aggregator, SeriesKey, Summary};
use itertools::Itertools;
use std::{
    io::{self, Write},
    time::Duration,
};
use thiserror::Error;

/// marker for cells without a full series
pub const NOT_RUN: &str = "NOT RUN";

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write report")]
    Io(#[from] io::Error),
    #[error("Failed to write csv report")]
    Csv(#[from] csv::Error),
}

/// Run parameters printed ahead of the result grid
#[derive(Debug, Clone)]
pub struct ReportMeta {
    /// prefix for console lines, e.g. `NVthread-eval`
    pub tag: String,
    pub input: String,
    pub cores: usize,
    pub runs: usize,
    /// emulated NVM write delay in ns, 0 if none
    pub delay_ns: u64,
    /// render incomplete series as `<mean> (k/n)` instead of `NOT RUN`
    pub partial_means: bool,
    /// prepended to the csv file name, e.g. `disk_` for runs logging to disk
    pub file_prefix: String,
}

/// Benchmark x backend grid over an [`Aggregator`]
pub struct Report<'a> {
    meta: &'a ReportMeta,
    aggregator: &'a Aggregator,
    backends: &'a [String],
}

impl<'a> Report<'a> {
    pub fn new(meta: &'a ReportMeta, aggregator: &'a Aggregator, backends: &'a [String]) -> Self {
        Self {
            meta,
            aggregator,
            backends,
        }
    }

    fn cell(&self, label: &str, backend: &str) -> String {
        match self.aggregator.summarize(&SeriesKey::new(label, backend)) {
            Summary::TrimmedMean(mean) => mean.to_string(),
            Summary::Incomplete { samples, partial } if self.meta.partial_means => {
                format!("{partial} ({samples}/{})", self.aggregator.runs())
            }
            Summary::Incomplete { .. } | Summary::NotRun => NOT_RUN.to_owned(),
        }
    }

    fn grid(&self) -> Vec<Vec<String>> {
        self.aggregator
            .rows()
            .iter()
            .map(|label| {
                std::iter::once(label.clone())
                    .chain(self.backends.iter().map(|backend| self.cell(label, backend)))
                    .collect_vec()
            })
            .collect_vec()
    }

    /// Print the preamble and an aligned table, every line prefixed with the tag
    pub fn render_table<W: Write>(&self, out: &mut W) -> Result<(), ReportError> {
        let tag = format!("[{}]", self.meta.tag);

        writeln!(out, "{tag} Input: {}", self.meta.input)?;
        writeln!(out, "{tag} #cores used: {}", self.meta.cores)?;
        writeln!(out, "{tag} #runs per setup: {}", self.meta.runs)?;
        if self.meta.delay_ns != 0 {
            writeln!(out, "{tag} write delay: {} ns", self.meta.delay_ns)?;
        }
        writeln!(out, "{tag} {:-^64}", "Stats")?;

        let header = std::iter::once("benchmark".to_owned())
            .chain(self.backends.iter().cloned())
            .collect_vec();
        let grid = self.grid();

        let widths = (0..header.len())
            .map(|column| {
                std::iter::once(&header)
                    .chain(grid.iter())
                    .map(|row| row[column].len())
                    .max()
                    .unwrap_or(0)
            })
            .collect_vec();

        for row in std::iter::once(&header).chain(grid.iter()) {
            let line = row
                .iter()
                .zip(widths.iter())
                .map(|(cell, width)| format!("{cell:<width$}"))
                .join("  ");

            writeln!(out, "{tag} {}", line.trim_end())?;
        }

        writeln!(out, "{tag} {}", "-".repeat(64))?;

        Ok(())
    }

    /// File name for the csv variant, `<prefix><input>_<cores>cores_<runs>runs_<delay>ns.csv`
    pub fn csv_file_name(&self) -> String {
        format!(
            "{}{}_{}cores_{}runs_{}ns.csv",
            self.meta.file_prefix,
            self.meta.input,
            self.meta.cores,
            self.meta.runs,
            self.meta.delay_ns
        )
    }

    /// Write metadata rows, the grid and the total duration of the matrix
    pub fn write_csv<W: Write>(&self, out: W, elapsed: Duration) -> Result<(), ReportError> {
        let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(out);

        let preamble = [
            ("Input", self.meta.input.clone()),
            ("#cores used", self.meta.cores.to_string()),
            ("#runs per setup", self.meta.runs.to_string()),
            ("write delay", format!("{} ns", self.meta.delay_ns)),
        ];
        for (name, value) in preamble {
            writer.write_record([name, value.as_str()])?;
        }
        blank_line(&mut writer)?;

        writer.write_record(
            std::iter::once("benchmark").chain(self.backends.iter().map(String::as_str)),
        )?;
        for row in self.grid() {
            writer.write_record(&row)?;
        }

        blank_line(&mut writer)?;
        writer.write_record([format!(
            "Finished in : {} seconds",
            elapsed.as_secs_f64()
        )])?;
        writer.flush()?;

        Ok(())
    }
}

/// An empty csv record is written as `""`, separators have to bypass the record writer
fn blank_line<W: Write>(writer: &mut csv::Writer<W>) -> Result<(), ReportError> {
    writer.flush()?;
    writer.get_mut().write_all(b"\n")?;

    Ok(())
}
