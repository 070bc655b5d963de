//! Locations on disk and the deployment file

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rangewatch_core::Deployment;

use crate::error::ServerError;

/// Name of the deployment file looked up in the config directory
pub const DEPLOYMENT_FILE: &str = "deployment.json";

pub fn get_project_dirs() -> Result<ProjectDirs, ServerError> {
    ProjectDirs::from("org", "rangewatch", "rangewatch").ok_or(ServerError::NoProjectDirs)
}

/// Data directory: the override when given, the platform default otherwise
pub fn data_dir(explicit: Option<&Path>) -> Result<PathBuf, ServerError> {
    let dir = match explicit {
        Some(dir) => dir.to_path_buf(),
        None => get_project_dirs()?.data_dir().to_owned(),
    };
    std::fs::create_dir_all(&dir).map_err(|e| ServerError::file(&dir, e))?;
    log::debug!("Data directory: {}", dir.display());
    Ok(dir)
}

/// Deployment file: the override when given, the platform default otherwise
pub fn deployment_path(explicit: Option<&Path>) -> Result<PathBuf, ServerError> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(get_project_dirs()?.config_dir().join(DEPLOYMENT_FILE)),
    }
}

/// Read and check a deployment file. Dangling references are logged.
pub fn load_deployment(path: &Path) -> Result<Deployment, ServerError> {
    let file = File::open(path).map_err(|e| ServerError::file(path, e))?;
    let deployment: Deployment = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| ServerError::parse_json(path, e))?;

    let problems = deployment.validate();
    log::info!(
        "Loaded {} with {} feature(s), {} subject(s), {} geofence analyzer(s){}",
        path.display(),
        deployment.features.len(),
        deployment.subjects.len(),
        deployment.geofence_analyzers.len(),
        if problems > 0 {
            format!(", {} problem(s)", problems)
        } else {
            String::new()
        }
    );
    Ok(deployment)
}
