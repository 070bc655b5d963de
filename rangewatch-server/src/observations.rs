//! Observation batches read from disk

use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use rangewatch_core::{MemoryObservationStore, Observation};

use crate::error::ServerError;

/// Read a JSON array of observations
pub fn load_batch(path: &Path) -> Result<Vec<Observation>, ServerError> {
    let file = File::open(path).map_err(|e| ServerError::file(path, e))?;
    let observations: Vec<Observation> = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| ServerError::parse_json(path, e))?;
    log::info!("Read {} observation(s) from {}", observations.len(), path.display());
    Ok(observations)
}

/// Add observations to the store. Returns the subjects that received new
/// fixes, in id order.
pub fn ingest(store: &MemoryObservationStore, observations: Vec<Observation>) -> Vec<String> {
    let total = observations.len();
    let mut touched = BTreeSet::new();
    let mut added = 0;
    for observation in observations {
        let subject_id = observation.subject_id.clone();
        if store.add(observation) {
            added += 1;
            touched.insert(subject_id);
        }
    }
    if added < total {
        log::debug!("Ignored {} duplicate observation(s)", total - added);
    }
    touched.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const BATCH: &str = r#"[
        {"subject_id": "dumbo", "source_id": "c1", "recorded_at": "2021-10-09T23:00:13Z", "longitude": 3.538229, "latitude": 10.005134},
        {"subject_id": "dumbo", "source_id": "c1", "recorded_at": "2021-10-09T23:30:13Z", "longitude": 3.535698, "latitude": 10.025114},
        {"subject_id": "dumbo", "source_id": "c1", "recorded_at": "2021-10-09T23:30:13Z", "longitude": 3.535698, "latitude": 10.025114},
        {"subject_id": "jolie", "source_id": "c2", "recorded_at": "2021-10-09T23:30:13Z", "longitude": 10.5, "latitude": -2.4}
    ]"#;

    #[test]
    fn test_load_and_ingest() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("batch.json");
        std::fs::write(&path, BATCH).unwrap();

        let observations = load_batch(&path).unwrap();
        assert_eq!(observations.len(), 4);

        let store = MemoryObservationStore::new();
        let touched = ingest(&store, observations);
        assert_eq!(touched, vec!["dumbo".to_string(), "jolie".to_string()]);
        assert_eq!(store.subject_ids().len(), 2);

        // Nothing new the second time round
        assert!(ingest(&store, load_batch(&path).unwrap()).is_empty());
    }

    #[test]
    fn test_bad_batch() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("batch.json");
        std::fs::write(&path, r#"[{"subject_id": "dumbo"}]"#).unwrap();
        assert!(matches!(load_batch(&path), Err(ServerError::ParseJson { .. })));
    }
}
