/// Scalar time-series sinks
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::Result;

/// Receives `<phase>/<metric>` scalars indexed by epoch
pub trait ScalarSink: Send {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()>;
}

#[derive(Serialize)]
struct ScalarEvent<'a> {
    tag: &'a str,
    value: f64,
    step: usize,
}

/// Appends one JSON object per scalar to `<dir>/logs/scalars.jsonl`
pub struct JsonlScalarWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlScalarWriter {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let logs = dir.as_ref().join("logs");
        std::fs::create_dir_all(&logs)?;
        let path = logs.join("scalars.jsonl");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        log::info!("Writing scalars to {:?}", path);
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScalarSink for JsonlScalarWriter {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        serde_json::to_writer(&mut self.writer, &ScalarEvent { tag, value, step })?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Emits scalars as debug log lines
#[derive(Debug, Default)]
pub struct LogSink;

impl ScalarSink for LogSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        log::debug!("[{}] {} = {:.6}", step, tag, value);
        Ok(())
    }
}

/// Discards everything
#[derive(Debug, Default)]
pub struct NullSink;

impl ScalarSink for NullSink {
    fn add_scalar(&mut self, _tag: &str, _value: f64, _step: usize) -> Result<()> {
        Ok(())
    }
}
