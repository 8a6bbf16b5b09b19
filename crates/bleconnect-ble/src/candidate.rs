//! Advertisement bookkeeping for the current scan

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Instant;

/// What the central has seen of one advertising peripheral
#[derive(Debug, Clone)]
pub struct Candidate {
    pub last_rssi: i16,
    pub sightings: u32,
    pub first_seen: Instant,
}

/// Per-scan table of advertising peripherals.
///
/// Without duplicate reporting only the first sighting of each peripheral is
/// forwarded to the session.
#[derive(Debug)]
pub struct CandidateTable<K> {
    allow_duplicates: bool,
    candidates: HashMap<K, Candidate>,
}

impl<K: Eq + Hash> Default for CandidateTable<K> {
    fn default() -> Self {
        Self::new(true)
    }
}

impl<K: Eq + Hash> CandidateTable<K> {
    pub fn new(allow_duplicates: bool) -> Self {
        Self {
            allow_duplicates,
            candidates: HashMap::new(),
        }
    }

    /// Start a new scan, forgetting earlier sightings
    pub fn restart(&mut self, allow_duplicates: bool) {
        self.allow_duplicates = allow_duplicates;
        self.candidates.clear();
    }

    /// Record an advertisement; returns whether it should be reported
    pub fn record(&mut self, id: K, rssi: i16) -> bool {
        let allow_duplicates = self.allow_duplicates;
        match self.candidates.get_mut(&id) {
            Some(candidate) => {
                candidate.last_rssi = rssi;
                candidate.sightings += 1;
                allow_duplicates
            }
            None => {
                self.candidates.insert(
                    id,
                    Candidate {
                        last_rssi: rssi,
                        sightings: 1,
                        first_seen: Instant::now(),
                    },
                );
                true
            }
        }
    }

    pub fn get(&self, id: &K) -> Option<&Candidate> {
        self.candidates.get(id)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}
