use std::path::Path;

use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use rust_xlsxwriter::Workbook;

use crate::atomic::atomic_rewrite;
use crate::GatewayRow;

pub fn read_spreadsheet(path: &str, sheet: &str) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let mut workbook = open_workbook_auto(path).with_context(|| format!("open spreadsheet: {path}"))?;
    let range = workbook
        .worksheet_range(sheet)
        .with_context(|| format!("read sheet {sheet:?} from {path}"))?;

    let mut rows_iter = range.rows();
    let header = rows_iter.next().context("spreadsheet has no header row")?;
    let columns: Vec<String> = header.iter().map(cell_to_string).collect();

    let rows: Vec<Vec<String>> = rows_iter
        .map(|row| row.iter().map(cell_to_string).collect())
        .collect();

    Ok((columns, rows))
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

pub fn write_spreadsheet_atomic(path: &str, sheet: &str, columns: &[String], rows: &[GatewayRow]) -> Result<()> {
    atomic_rewrite(Path::new(path), |temp_path| {
        let mut workbook = Workbook::new();
        let worksheet = workbook.add_worksheet().set_name(sheet)?;

        for (col_idx, column) in columns.iter().enumerate() {
            worksheet.write_string(0, col_idx as u16, column)?;
        }
        for (row_idx, row) in rows.iter().enumerate() {
            for (col_idx, column) in columns.iter().enumerate() {
                let value = row.fields.get(column).map(String::as_str).unwrap_or("");
                worksheet.write_string(row_idx as u32 + 1, col_idx as u16, value)?;
            }
        }

        workbook
            .save(temp_path)
            .with_context(|| format!("save temp spreadsheet: {}", temp_path.display()))?;
        Ok(())
    })
}
