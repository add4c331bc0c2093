use crate::error::{FailureKind, SubjectFailure};
use crate::simulation::engine::{DoseRecord, StateAnomaly};
use crate::simulation::individual::{IndividualParameters, SimulationRecord, Subject};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
pub struct SubjectResult {
    pub subject_id: usize,
    pub parameters: IndividualParameters,
    pub doses: Vec<DoseRecord>,
    pub records: Vec<SimulationRecord>,
    pub anomalies: Vec<StateAnomaly>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub requested: usize,
    pub succeeded: usize,
    /// Failures other than cancellation.
    pub failed: usize,
    pub cancelled: usize,
    pub timed_out: bool,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub population_seed: u64,
    pub residual_seed: u64,
    /// Subject ids with complete results, ascending.
    pub completed: Vec<usize>,
    pub failures: Vec<String>,
}

/// Everything a run produced. Results and failures are sorted by subject id;
/// records within a result by time.
#[derive(Debug, Clone, Serialize)]
pub struct Cohort {
    pub subjects: Vec<Subject>,
    pub results: Vec<SubjectResult>,
    pub failures: Vec<SubjectFailure>,
    pub summary: RunSummary,
}

impl Cohort {
    /// All records ordered by (subject id, time).
    pub fn records(&self) -> impl Iterator<Item = &SimulationRecord> {
        self.results.iter().flat_map(|r| r.records.iter())
    }

    pub fn records_by_subject(&self) -> BTreeMap<usize, &[SimulationRecord]> {
        self.results
            .iter()
            .map(|r| (r.subject_id, r.records.as_slice()))
            .collect()
    }

    pub fn result(&self, subject_id: usize) -> Option<&SubjectResult> {
        self.results
            .binary_search_by_key(&subject_id, |r| r.subject_id)
            .ok()
            .map(|i| &self.results[i])
    }

    pub fn failure(&self, subject_id: usize) -> Option<&SubjectFailure> {
        self.failures.iter().find(|f| f.subject_id == subject_id)
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Append-only per-worker accumulator; workers never share one.
#[derive(Debug, Default)]
pub(crate) struct CohortBuffer {
    pub(crate) results: Vec<SubjectResult>,
    pub(crate) failures: Vec<SubjectFailure>,
}

impl CohortBuffer {
    pub(crate) fn push(mut self, outcome: Result<SubjectResult, SubjectFailure>) -> Self {
        match outcome {
            Ok(result) => self.results.push(result),
            Err(failure) => self.failures.push(failure),
        }
        self
    }

    pub(crate) fn merge(mut self, mut other: Self) -> Self {
        self.results.append(&mut other.results);
        self.failures.append(&mut other.failures);
        self
    }

    /// Order merged output independently of worker scheduling.
    pub(crate) fn finish(mut self) -> Self {
        self.results.sort_by_key(|r| r.subject_id);
        for r in &mut self.results {
            r.records.sort_by(|a, b| a.time.total_cmp(&b.time));
        }
        self.failures.sort_by_key(|f| f.subject_id);
        self
    }

    pub(crate) fn count(&self, kind: FailureKind) -> usize {
        self.failures.iter().filter(|f| f.kind == kind).count()
    }
}
