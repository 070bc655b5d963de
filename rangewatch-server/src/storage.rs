//! File-backed result store and event sink.
//!
//! Results: `<data-dir>/results/{subject}/{result-id}.json`, one pretty
//! printed document per finding, loaded per subject on first use.
//!
//! Events: `<data-dir>/events.jsonl`, one event per line, append only.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use rangewatch_core::events::Event;
use rangewatch_core::{AnalyzerError, AnalyzerResult, EventRef, EventRequest, EventSink, ResultStore};

use crate::error::ServerError;

pub const RESULTS_DIR: &str = "results";
pub const EVENTS_FILE: &str = "events.jsonl";

/// Sanitize an id for use as a path component
fn safe_name(id: &str) -> String {
    id.replace(['/', '\\'], "__")
}

/// Result store writing one JSON file per finding
pub struct FileResultStore {
    base_dir: PathBuf,
    /// Subjects already read from disk
    cache: RwLock<HashMap<String, Vec<AnalyzerResult>>>,
}

impl FileResultStore {
    pub fn new(data_dir: &Path) -> Result<Self, ServerError> {
        let base_dir = data_dir.join(RESULTS_DIR);
        fs::create_dir_all(&base_dir).map_err(|e| ServerError::file(&base_dir, e))?;
        debug!("Results directory: {}", base_dir.display());
        Ok(FileResultStore {
            base_dir,
            cache: RwLock::new(HashMap::new()),
        })
    }

    fn subject_dir(&self, subject_id: &str) -> PathBuf {
        self.base_dir.join(safe_name(subject_id))
    }

    fn load_subject(&self, subject_id: &str) -> Result<Vec<AnalyzerResult>, ServerError> {
        let dir = self.subject_dir(subject_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| ServerError::file(&dir, e))?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match File::open(&path) {
                Ok(file) => match serde_json::from_reader::<_, AnalyzerResult>(BufReader::new(file)) {
                    Ok(result) => results.push(result),
                    Err(e) => warn!("Failed to parse result {}: {}", path.display(), e),
                },
                Err(e) => warn!("Failed to open result {}: {}", path.display(), e),
            }
        }
        results.sort_by_key(|r| r.estimated_time);
        debug!("Loaded {} result(s) for {}", results.len(), subject_id);
        Ok(results)
    }

    /// Run `f` over a subject's results, reading them from disk once
    fn with_subject<R>(
        &self,
        subject_id: &str,
        f: impl FnOnce(&Vec<AnalyzerResult>) -> R,
    ) -> Result<R, ServerError> {
        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(results) = cache.get(subject_id) {
                return Ok(f(results));
            }
        }
        let loaded = self.load_subject(subject_id)?;
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let results = cache.entry(subject_id.to_string()).or_insert(loaded);
        Ok(f(results))
    }

    fn write_result(&self, result: &AnalyzerResult) -> Result<PathBuf, ServerError> {
        let dir = self.subject_dir(&result.subject_id);
        fs::create_dir_all(&dir).map_err(|e| ServerError::file(&dir, e))?;
        let path = dir.join(format!("{}.json", result.id));

        let file = File::create(&path).map_err(|e| ServerError::file(&path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, result)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(path)
    }
}

impl ResultStore for FileResultStore {
    fn record(&self, result: AnalyzerResult) -> Result<AnalyzerResult, AnalyzerError> {
        // Make sure earlier results are cached before appending the new one
        self.with_subject(&result.subject_id, |_| ())?;
        let path = self.write_result(&result)?;
        info!("Stored result {} -> {}", result.id, path.display());

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache
            .entry(result.subject_id.clone())
            .or_default()
            .push(result.clone());
        Ok(result)
    }

    fn already_recorded(
        &self,
        subject_id: &str,
        config_id: &str,
        fence_id: &str,
        estimated_time: DateTime<Utc>,
    ) -> Result<bool, AnalyzerError> {
        Ok(self.with_subject(subject_id, |results| {
            results.iter().any(|r| {
                r.config_id == config_id
                    && r.fence_id == fence_id
                    && r.estimated_time == estimated_time
            })
        })?)
    }

    fn latest(
        &self,
        subject_id: &str,
        config_id: &str,
    ) -> Result<Option<AnalyzerResult>, AnalyzerError> {
        Ok(self.with_subject(subject_id, |results| {
            results
                .iter()
                .filter(|r| r.config_id == config_id)
                .max_by_key(|r| r.estimated_time)
                .cloned()
        })?)
    }

    fn results_for(&self, subject_id: &str) -> Result<Vec<AnalyzerResult>, AnalyzerError> {
        Ok(self.with_subject(subject_id, |results| {
            let mut list = results.clone();
            list.sort_by_key(|r| r.estimated_time);
            list
        })?)
    }
}

/// Event sink appending JSON lines to a single file
pub struct JsonlEventSink {
    path: PathBuf,
    events: Mutex<Vec<Event>>,
}

impl JsonlEventSink {
    /// Open the sink, reading back events written by earlier runs
    pub fn open(data_dir: &Path) -> Result<Self, ServerError> {
        let path = data_dir.join(EVENTS_FILE);
        let mut events = Vec::new();
        if path.exists() {
            let file = File::open(&path).map_err(|e| ServerError::file(&path, e))?;
            for (number, line) in BufReader::new(file).lines().enumerate() {
                let line = line.map_err(|e| ServerError::file(&path, e))?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Event>(&line) {
                    Ok(event) => events.push(event),
                    Err(e) => warn!("Skipping line {} of {}: {}", number + 1, path.display(), e),
                }
            }
            debug!("Read {} event(s) from {}", events.len(), path.display());
        }
        Ok(JsonlEventSink {
            path,
            events: Mutex::new(events),
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn append(&self, event: &Event) -> Result<(), ServerError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| ServerError::file(&self.path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, event)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

impl EventSink for JsonlEventSink {
    fn emit_event(&self, request: EventRequest) -> Result<Option<EventRef>, AnalyzerError> {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if events.iter().any(|e| e.request.same_event(&request)) {
            debug!(
                "Event '{}' for {} at {} already exists",
                request.title, request.subject_id, request.time
            );
            return Ok(None);
        }

        let event = Event::new(request, Utc::now());
        self.append(&event)
            .map_err(|e| AnalyzerError::EventSink(e.to_string()))?;
        info!("Created event {}: {}", event.id, event.request.title);
        let event_ref = event.event_ref();
        events.push(event);
        Ok(Some(event_ref))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rangewatch_core::results::{Level, ResultGeometry, ResultValues};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn result(subject_id: &str, minute: u32) -> AnalyzerResult {
        let t = Utc.with_ymd_and_hms(2021, 10, 9, 23, minute, 0).unwrap();
        AnalyzerResult {
            id: Uuid::new_v4(),
            subject_id: subject_id.into(),
            config_id: "gf-1".into(),
            fence_id: "road".into(),
            title: "Dumbo crossed Boundary Road.".into(),
            message: "Dumbo crossed Boundary Road. Subject now in: Unknown region".into(),
            level: Level::Critical,
            estimated_time: t,
            geometry: vec![
                ResultGeometry::Point([35.305, -1.205]),
                ResultGeometry::LineString(vec![[35.301, -1.205], [35.309, -1.205]]),
            ],
            values: ResultValues {
                geofence_name: "Boundary Road".into(),
                contain_regions: "Unknown region".into(),
                total_fix_count: 2,
                subject_speed_kmhr: 0.89,
                subject_heading: 90.0,
            },
            created_at: t,
        }
    }

    #[test]
    fn test_record_and_reload() {
        let temp = TempDir::new().unwrap();
        let store = FileResultStore::new(temp.path()).unwrap();
        let first = store.record(result("dumbo", 10)).unwrap();
        let second = store.record(result("dumbo", 40)).unwrap();

        let path = temp
            .path()
            .join(RESULTS_DIR)
            .join("dumbo")
            .join(format!("{}.json", first.id));
        assert!(path.exists());

        // A fresh store reads the files back
        let reopened = FileResultStore::new(temp.path()).unwrap();
        assert!(reopened
            .already_recorded("dumbo", "gf-1", "road", first.estimated_time)
            .unwrap());
        assert!(!reopened
            .already_recorded("dumbo", "gf-1", "other-fence", first.estimated_time)
            .unwrap());
        assert_eq!(reopened.latest("dumbo", "gf-1").unwrap(), Some(second));
        assert_eq!(reopened.results_for("dumbo").unwrap().len(), 2);
        assert!(reopened.results_for("tumbo").unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_result_file_skipped() {
        let temp = TempDir::new().unwrap();
        let store = FileResultStore::new(temp.path()).unwrap();
        store.record(result("dumbo", 10)).unwrap();
        fs::write(
            temp.path().join(RESULTS_DIR).join("dumbo").join("broken.json"),
            "{",
        )
        .unwrap();

        let reopened = FileResultStore::new(temp.path()).unwrap();
        assert_eq!(reopened.results_for("dumbo").unwrap().len(), 1);
    }

    #[test]
    fn test_subject_id_with_slashes() {
        let temp = TempDir::new().unwrap();
        let store = FileResultStore::new(temp.path()).unwrap();
        store.record(result("collars/7", 10)).unwrap();
        assert!(temp.path().join(RESULTS_DIR).join("collars__7").is_dir());
        assert_eq!(store.results_for("collars/7").unwrap().len(), 1);
    }

    #[test]
    fn test_event_sink_appends_and_dedups() {
        let temp = TempDir::new().unwrap();
        let sink = JsonlEventSink::open(temp.path()).unwrap();
        let request = EventRequest::for_result(&result("dumbo", 10), "Dumbo").unwrap();

        assert!(sink.emit_event(request.clone()).unwrap().is_some());
        assert!(sink.emit_event(request.clone()).unwrap().is_none());
        let other = EventRequest::for_result(&result("dumbo", 40), "Dumbo").unwrap();
        assert!(sink.emit_event(other).unwrap().is_some());

        let content = fs::read_to_string(temp.path().join(EVENTS_FILE)).unwrap();
        assert_eq!(content.lines().count(), 2);

        // Dedup survives a restart
        let reopened = JsonlEventSink::open(temp.path()).unwrap();
        assert_eq!(reopened.events().len(), 2);
        assert!(reopened.emit_event(request).unwrap().is_none());
        assert_eq!(reopened.events()[0].request.details["name"], "Dumbo");
    }
}
