/// Per-epoch training history
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::utils::write_atomically;
use crate::{DepthError, Result};

/// One completed epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// 1-based epoch index
    pub epoch: usize,
    /// Learning rate in effect during the epoch
    pub lr: f64,
    /// `train/...` then `val/...` values, in report order
    pub values: Vec<(String, f64)>,
}

impl EpochRecord {
    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
    }

    /// `epoch: 3 - lr: 0.0001 - train/loss: 0.1234 - ...`
    pub fn summary(&self) -> String {
        let mut parts = vec![format!("epoch: {}", self.epoch), format!("lr: {}", self.lr)];
        parts.extend(self.values.iter().map(|(k, v)| format!("{}: {:.4}", k, v)));
        parts.join(" - ")
    }
}

/// Append-only sequence of epoch records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct History {
    records: Vec<EpochRecord>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from records, checking epochs run 1..N
    pub fn from_records(records: Vec<EpochRecord>) -> Result<Self> {
        let mut history = Self::new();
        for record in records {
            history.push(record)?;
        }
        Ok(history)
    }

    /// Append the next epoch; its index must be `len() + 1`
    pub fn push(&mut self, record: EpochRecord) -> Result<()> {
        let expected = self.records.len() + 1;
        if record.epoch != expected {
            return Err(DepthError::Training(format!(
                "history expects epoch {}, got {}",
                expected, record.epoch
            )));
        }
        self.records.push(record);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[EpochRecord] {
        &self.records
    }

    pub fn last(&self) -> Option<&EpochRecord> {
        self.records.last()
    }

    /// `epoch`, `lr`, then every value key in first-seen order
    pub fn columns(&self) -> Vec<String> {
        let mut columns = vec!["epoch".to_string(), "lr".to_string()];
        for record in &self.records {
            for (key, _) in &record.values {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }
        columns
    }

    /// Rewrite the whole table as CSV; missing values are left empty
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let columns = self.columns();
        write_atomically(path, |file| {
            let mut writer = csv::Writer::from_writer(file);
            writer.write_record(&columns)?;
            for record in &self.records {
                let mut row = vec![record.epoch.to_string(), record.lr.to_string()];
                row.extend(
                    columns[2..]
                        .iter()
                        .map(|c| record.get(c).map(|v| v.to_string()).unwrap_or_default()),
                );
                writer.write_record(&row)?;
            }
            writer.flush()?;
            Ok(())
        })
    }
}
