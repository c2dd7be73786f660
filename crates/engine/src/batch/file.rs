//! Delimited text files as row sources and sinks.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use batchflow_types::{FileFormatDefinition, Message, Row, Value};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use tracing::debug;

use super::sink::RowSink;
use super::source::{RowError, RowSource, validate_row};
use crate::context::ExecutionContext;
use crate::db::DbHandle;

/// The csv reader and writer take single-byte delimiters.
fn delimiter_byte(format: &FileFormatDefinition) -> Result<u8> {
    let delimiter = format.delimiter;
    if !delimiter.is_ascii() {
        return Err(anyhow!("delimiter '{delimiter}' of '{}' is not an ASCII character", format.file_name));
    }
    Ok(delimiter as u8)
}

/// Reads one row per record. Quoted cells may hold the delimiter or line
/// breaks; blank lines are skipped.
#[derive(Debug)]
pub struct DelimitedFileSource {
    path: PathBuf,
    format: FileFormatDefinition,
    reader: Option<csv::Reader<File>>,
    record: StringRecord,
}

impl DelimitedFileSource {
    pub fn new(path: impl Into<PathBuf>, format: FileFormatDefinition) -> Self {
        Self {
            path: path.into(),
            format,
            reader: None,
            record: StringRecord::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RowSource for DelimitedFileSource {
    fn open_shop(&mut self, _context: &mut ExecutionContext, _db: Option<&mut DbHandle>) -> Result<()> {
        let reader = ReaderBuilder::new()
            .delimiter(delimiter_byte(&self.format)?)
            .has_headers(self.format.header)
            .flexible(true)
            .from_path(&self.path)
            .with_context(|| format!("failed to open input file {}", self.path.display()))?;
        debug!(file = %self.path.display(), "opened input file");
        self.reader = Some(reader);
        Ok(())
    }

    fn input_row(&mut self, _context: &ExecutionContext) -> Result<Option<Row>, RowError> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(anyhow!("input file {} is not open", self.path.display()).into());
        };
        loop {
            let more = reader
                .read_record(&mut self.record)
                .with_context(|| format!("failed to read {}", self.path.display()))?;
            if !more {
                return Ok(None);
            }
            if self.record.len() <= 1 && self.record.iter().all(|cell| cell.trim().is_empty()) {
                continue;
            }

            let record = &self.record;
            let row: Row = self
                .format
                .columns
                .iter()
                .zip(record.iter())
                .map(|(column, cell)| (column.name.clone(), Value::Text(cell.to_string())))
                .collect();
            if record.len() != self.format.columns.len() {
                let line = record.position().map(|position| position.line()).unwrap_or_default();
                let text = format!(
                    "line {line} of {} has {} values, expected {}",
                    self.path.display(),
                    record.len(),
                    self.format.columns.len()
                );
                return Err(RowError::Invalid {
                    row,
                    messages: vec![Message::error("column_count", text)],
                });
            }
            return validate_row(&self.format.columns, row).map(Some);
        }
    }

    fn close_shop(&mut self, _context: &mut ExecutionContext) -> Result<()> {
        self.reader = None;
        Ok(())
    }
}

/// Writes the configured columns of each row as one delimited record,
/// quoting cells that need it.
#[derive(Debug)]
pub struct DelimitedFileSink {
    path: PathBuf,
    format: FileFormatDefinition,
    writer: Option<csv::Writer<File>>,
}

impl DelimitedFileSink {
    pub fn new(path: impl Into<PathBuf>, format: FileFormatDefinition) -> Self {
        Self {
            path: path.into(),
            format,
            writer: None,
        }
    }
}

impl RowSink for DelimitedFileSink {
    fn open_shop(&mut self, _context: &mut ExecutionContext) -> Result<()> {
        if let Some(folder) = self.path.parent()
            && !folder.as_os_str().is_empty()
        {
            fs::create_dir_all(folder).with_context(|| format!("failed to create {}", folder.display()))?;
        }
        let file =
            File::create(&self.path).with_context(|| format!("failed to create output file {}", self.path.display()))?;
        let mut writer = WriterBuilder::new()
            .delimiter(delimiter_byte(&self.format)?)
            .from_writer(file);
        if self.format.header {
            writer
                .write_record(self.format.columns.iter().map(|column| column.name.as_str()))
                .with_context(|| format!("failed to write header of {}", self.path.display()))?;
        }
        debug!(file = %self.path.display(), "opened output file");
        self.writer = Some(writer);
        Ok(())
    }

    fn output_row(&mut self, context: &mut ExecutionContext) -> Result<bool> {
        let cells: Vec<String> = self
            .format
            .columns
            .iter()
            .map(|column| context.value_or_null(&column.name).to_string())
            .collect();
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("output file {} is not open", self.path.display()))?;
        writer
            .write_record(&cells)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(true)
    }

    fn close_shop(&mut self, _context: &mut ExecutionContext) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .with_context(|| format!("failed to flush {}", self.path.display()))?;
        }
        Ok(())
    }
}
