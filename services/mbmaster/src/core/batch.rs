//! Batch read planning
//!
//! Turns the points of one device into the read requests of a poll cycle.
//! Points are partitioned by register kind and sorted by address, then
//! coalesced into runs. A run grows while its span stays within the
//! connection's max read count for that kind; with `contiguous_only` the next
//! point must also start no later than one past the current run end. Without
//! it, gaps are bridged by reading the unused addresses in between.

use std::collections::BTreeMap;

use crate::core::config::{PointConfig, RegisterKind, TuningParams};
use crate::error::{MasterError, Result};

/// Per-kind read size limits of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadLimits {
    pub max_bits: u16,
    pub max_registers: u16,
}

impl ReadLimits {
    pub fn for_kind(&self, kind: RegisterKind) -> u16 {
        if kind.is_bit() {
            self.max_bits
        } else {
            self.max_registers
        }
    }

    /// Reject a point that no single read request could cover
    pub fn check_point(&self, point: &PointConfig) -> Result<()> {
        let limit = self.for_kind(point.kind);
        if point.width() > limit {
            return Err(MasterError::config(format!(
                "Point '{}': {} is {} wide, {} read limit is {}",
                point.name,
                point.data_type,
                point.width(),
                point.kind,
                limit
            )));
        }
        Ok(())
    }
}

impl From<&TuningParams> for ReadLimits {
    fn from(tuning: &TuningParams) -> Self {
        Self {
            max_bits: tuning.max_read_bit_count,
            max_registers: tuning.max_read_register_count,
        }
    }
}

/// One transport read covering one or more points
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub kind: RegisterKind,
    pub start: u16,
    pub count: u16,
    /// Indices into the planned point slice
    pub points: Vec<usize>,
}

impl ReadRequest {
    pub fn end(&self) -> u16 {
        self.start + (self.count - 1)
    }
}

/// Plan the read requests for one poll cycle
pub fn plan(
    points: &[PointConfig],
    limits: ReadLimits,
    use_batch: bool,
    contiguous_only: bool,
) -> Vec<ReadRequest> {
    if !use_batch {
        return points
            .iter()
            .enumerate()
            .map(|(idx, p)| ReadRequest {
                kind: p.kind,
                start: p.address,
                count: p.width(),
                points: vec![idx],
            })
            .collect();
    }

    let mut by_kind: BTreeMap<RegisterKind, Vec<usize>> = BTreeMap::new();
    for (idx, point) in points.iter().enumerate() {
        by_kind.entry(point.kind).or_default().push(idx);
    }

    let mut requests = Vec::new();
    for (kind, mut indices) in by_kind {
        indices.sort_by_key(|&i| (points[i].address, points[i].width()));
        let max = u32::from(limits.for_kind(kind));

        let mut run: Option<Run> = None;
        for idx in indices {
            let point = &points[idx];
            let start = u32::from(point.address);
            let end = u32::from(point.end_address());

            if let Some(current) = run.as_mut() {
                let span = end.max(current.end) - current.start + 1;
                let adjacent = start <= current.end + 1;
                if span <= max && (adjacent || !contiguous_only) {
                    current.end = current.end.max(end);
                    current.points.push(idx);
                    continue;
                }
            }

            if let Some(done) = run.take() {
                requests.push(done.into_request(kind));
            }
            run = Some(Run {
                start,
                end,
                points: vec![idx],
            });
        }
        if let Some(done) = run {
            requests.push(done.into_request(kind));
        }
    }
    requests
}

struct Run {
    start: u32,
    end: u32,
    points: Vec<usize>,
}

impl Run {
    fn into_request(self, kind: RegisterKind) -> ReadRequest {
        ReadRequest {
            kind,
            start: self.start as u16,
            count: (self.end - self.start + 1) as u16,
            points: self.points,
        }
    }
}
