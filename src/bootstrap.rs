//! Filesystem bootstrapping.
//!
//! Creates the host directory tree the fleet mounts from and writes the
//! per-worker job configuration blobs. The blob is consumed by the in-guest
//! automation through a read-only mount; the core only produces it and never
//! interprets it.

use std::collections::BTreeMap;

use crate::config::{JobTemplate, PathsConfig};
use crate::error::FleetError;
use crate::fleet::{FleetSpec, worker_name};

/// Per-worker configuration blob, serialized camelCase to match what the
/// in-guest automation expects.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerJobBlob {
    pub target_site_url: String,
    pub credentials: Credentials,
    pub field_selectors: String,
    pub tracker_url: String,
    pub tracker_credentials: Credentials,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl WorkerJobBlob {
    /// Instantiate the blob for one worker from the shared template.
    pub fn from_template(template: &JobTemplate) -> Self {
        Self {
            target_site_url: template.target_site_url.clone(),
            credentials: Credentials {
                username: template.username.clone(),
                password: template.password.clone(),
            },
            field_selectors: template.field_selectors.clone(),
            tracker_url: template.tracker_url.clone(),
            tracker_credentials: Credentials {
                username: template.tracker_username.clone(),
                password: template.tracker_password.clone(),
            },
        }
    }
}

/// Build the index → blob map for the whole fleet.
pub fn job_configs(spec: &FleetSpec, template: &JobTemplate) -> BTreeMap<u32, WorkerJobBlob> {
    (1..=spec.size)
        .map(|i| (i, WorkerJobBlob::from_template(template)))
        .collect()
}

/// Create the directory tree and write one config blob per worker.
///
/// Idempotent: existing directories are left alone and blobs are rewritten
/// in place so a re-run converges to the same tree.
pub fn prepare_tree(
    spec: &FleetSpec,
    paths: &PathsConfig,
    job_configs: &BTreeMap<u32, WorkerJobBlob>,
) -> Result<(), FleetError> {
    for dir in [
        paths.data_dir(),
        paths.scripts_dir(),
        paths.config_dir(),
        paths.backups_dir(),
    ] {
        std::fs::create_dir_all(&dir)
            .map_err(|e| FleetError::io(format!("creating {}", dir.display()), e))?;
    }

    for index in 1..=spec.size {
        let name = worker_name(index);
        let data_dir = paths.worker_data_dir(&name);
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| FleetError::io(format!("creating {}", data_dir.display()), e))?;

        if let Some(blob) = job_configs.get(&index) {
            let file = paths.worker_config_file(&name);
            let json = serde_json::to_vec_pretty(blob)
                .map_err(|e| FleetError::io("serializing job config".to_string(), e.into()))?;
            std::fs::write(&file, json)
                .map_err(|e| FleetError::io(format!("writing {}", file.display()), e))?;
        }
    }

    tracing::debug!(root = %paths.root.display(), workers = spec.size, "Prepared host tree");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn spec(size: u32) -> FleetSpec {
        FleetSpec {
            size,
            desktop_base_port: 54040,
            shell_base_port: 52520,
            reserved_ports: BTreeSet::new(),
            domain: "fleet.example.com".to_string(),
        }
    }

    #[test]
    fn blob_serializes_camel_case() {
        let blob = WorkerJobBlob {
            target_site_url: "https://example.com".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_string(&blob).unwrap();
        assert!(json.contains("\"targetSiteUrl\""));
        assert!(json.contains("\"fieldSelectors\""));
        assert!(json.contains("\"trackerCredentials\""));
    }

    #[test]
    fn prepare_tree_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = PathsConfig {
            root: tmp.path().to_path_buf(),
        };
        let s = spec(2);
        let cfgs = job_configs(&s, &JobTemplate::default());

        prepare_tree(&s, &paths, &cfgs).unwrap();
        prepare_tree(&s, &paths, &cfgs).unwrap();

        assert!(paths.worker_data_dir("deskfleet-worker-1").is_dir());
        assert!(paths.worker_data_dir("deskfleet-worker-2").is_dir());
        assert!(paths.worker_config_file("deskfleet-worker-2").is_file());

        let raw = std::fs::read(paths.worker_config_file("deskfleet-worker-1")).unwrap();
        let parsed: WorkerJobBlob = serde_json::from_slice(&raw).unwrap();
        assert_eq!(parsed, WorkerJobBlob::default());
    }
}
