use std::path::Path;

use anyhow::{Context, Result};

use crate::GatewayRow;
use crate::atomic::atomic_rewrite;

pub fn read_delimited(path: &str, delimiter: u8, header: bool) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(header)
        .from_path(path)
        .with_context(|| format!("open delimited source: {path}"))?;

    let columns = if header {
        reader
            .headers()
            .context("read header row")?
            .iter()
            .map(str::to_string)
            .collect()
    } else {
        let width = reader.headers().map(|h| h.len()).unwrap_or(0);
        (0..width).map(|i| format!("column_{i}")).collect()
    };

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.context("read delimited record")?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok((columns, rows))
}

pub fn write_delimited_atomic(path: &str, delimiter: u8, columns: &[String], rows: &[GatewayRow]) -> Result<()> {
    atomic_rewrite(Path::new(path), |temp_path| {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .from_path(temp_path)
            .with_context(|| format!("create temp delimited file: {}", temp_path.display()))?;

        writer.write_record(columns).context("write header row")?;
        for row in rows {
            let record: Vec<&str> = columns
                .iter()
                .map(|c| row.fields.get(c).map(String::as_str).unwrap_or(""))
                .collect();
            writer.write_record(&record).context("write data row")?;
        }
        writer.flush().context("flush delimited writer")?;
        Ok(())
    })
}
