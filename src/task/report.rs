use serde::Serialize;

use crate::utils::RunStats;

/// Result of one initiator connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionReport {
    /// Iterations acknowledged.
    pub iterations: u64,
    pub stats: RunStats,
}

/// Result of a responder's whole serving run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServeReport {
    /// Sessions that ran to completion, in order.
    pub sessions: Vec<SessionReport>,

    /// Sessions aborted by an error and recovered from.
    pub failures: usize,
}

impl ServeReport {
    pub fn iterations(&self) -> u64 {
        self.sessions.iter().map(|s| s.iterations).sum()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json() {
        let report = ServeReport {
            sessions: vec![SessionReport {
                iterations: 3,
                stats: RunStats::default(),
            }],
            failures: 1,
        };
        assert_eq!(report.iterations(), 3);

        let value: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(value["failures"], 1);
        assert_eq!(value["sessions"][0]["iterations"], 3);
        assert_eq!(value["sessions"][0]["stats"]["bytes_per_iter"], 0);
    }
}
