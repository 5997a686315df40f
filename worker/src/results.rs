use crate::data::JobId;
use serde::Serialize;
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::fs::File;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Serialize_repr, Deserialize_repr, PartialEq, Debug, Clone, Copy)]
#[repr(i8)]
pub enum Satisfiability {
    Unsatisfiable = -1,
    Unknown = 0,
    Satisfiable = 1,
}

impl Satisfiability {
    pub fn from_result_code(code: i32) -> Self {
        match code {
            10 => Self::Satisfiable,
            20 => Self::Unsatisfiable,
            _ => Self::Unknown,
        }
    }
}

/// One scheduled job's final outcome, as reported to the submitter.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub name: String,
    pub job_id: JobId,
    pub satisfiable: Satisfiability,
    pub revision: i32,
    /// Seconds from submission to result delivery.
    pub response_time: f32,
    pub solution_literals: usize,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to write the result report")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize the result report")]
    Format(#[from] serde_yaml::Error),
}

/// Where finished-job records end up.
#[derive(Debug)]
pub enum ResultSink {
    Yaml {
        path: PathBuf,
        records: Vec<JobRecord>,
    },
    Log,
}

impl ResultSink {
    pub fn load(report: Option<PathBuf>) -> Self {
        match report {
            Some(path) => Self::Yaml {
                path,
                records: Vec::new(),
            },
            None => Self::Log,
        }
    }

    pub fn record(&mut self, record: JobRecord) {
        info!(
            job = record.job_id,
            name = %record.name,
            outcome = ?record.satisfiable,
            response_time = record.response_time,
            "job finished"
        );
        if let Self::Yaml { records, .. } = self {
            records.push(record);
        }
    }

    pub fn num_records(&self) -> usize {
        match self {
            Self::Yaml { records, .. } => records.len(),
            Self::Log => 0,
        }
    }

    /// Flush and close the sink; ensures the report hits the disk.
    pub fn close(self) -> Result<(), SinkError> {
        match self {
            Self::Yaml { path, records } => {
                let file = File::create(path)?;
                serde_yaml::to_writer(file, &records)?;
                Ok(())
            }
            Self::Log => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_codes_map_to_satisfiability() {
        assert_eq!(Satisfiability::from_result_code(10), Satisfiability::Satisfiable);
        assert_eq!(
            Satisfiability::from_result_code(20),
            Satisfiability::Unsatisfiable
        );
        assert_eq!(Satisfiability::from_result_code(0), Satisfiability::Unknown);
        assert_eq!(Satisfiability::from_result_code(42), Satisfiability::Unknown);
    }

    #[test]
    fn yaml_sink_writes_records() {
        let path = std::env::temp_dir().join("hivesat-sink-test.yml");
        let mut sink = ResultSink::load(Some(path.clone()));
        sink.record(JobRecord {
            name: "probe".into(),
            job_id: 1,
            satisfiable: Satisfiability::Satisfiable,
            revision: 0,
            response_time: 0.25,
            solution_literals: 3,
        });
        assert_eq!(sink.num_records(), 1);
        sink.close().unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("satisfiable: 1"));
        std::fs::remove_file(path).ok();
    }
}
