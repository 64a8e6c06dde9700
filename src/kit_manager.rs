use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::errors::{AgentError, AgentResult};
use crate::topology::{Distribution, InstanceId, License};

/// Source of kit installations. The install registry only talks to this
/// trait, so tests can count acquisitions and deletions.
#[async_trait]
pub trait KitProvider: Send + Sync {
    /// Makes the kit for `instance_id` available on local disk and returns
    /// the installation directory.
    async fn acquire_kit(
        &self,
        instance_id: &InstanceId,
        distribution: &Distribution,
        kit_path: Option<&Path>,
        license: Option<&License>,
        offline: bool,
    ) -> AgentResult<PathBuf>;

    /// Removes an installation directory previously returned by
    /// `acquire_kit`.
    async fn delete_install(&self, location: &Path) -> AgentResult<()>;
}

pub struct KitManager {
    kits_dir: PathBuf,
    cache_dir: PathBuf,
    client: reqwest::Client,
}

impl KitManager {
    pub fn new(storage: &StorageConfig) -> Self {
        KitManager {
            kits_dir: storage.kits_dir(),
            cache_dir: storage.kit_cache_dir(),
            client: reqwest::Client::new(),
        }
    }

    /// Downloads the kit archive into the cache, cleaning up the partial
    /// file if the transfer breaks.
    async fn download_archive(&self, url: &str, archive_path: &Path) -> AgentResult<()> {
        info!("Downloading kit archive from {}", url);

        if let Some(parent) = archive_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AgentError::NetworkError(format!("Kit download failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AgentError::KitError(format!(
                "Kit download from {} returned HTTP {}",
                url,
                response.status()
            )));
        }

        let mut file = fs::File::create(archive_path).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    let _ = fs::remove_file(archive_path).await;
                    return Err(AgentError::NetworkError(format!(
                        "Kit download from {} broke after {} bytes: {}",
                        url, written, e
                    )));
                }
            };
            if let Err(e) = file.write_all(&chunk).await {
                drop(file);
                let _ = fs::remove_file(archive_path).await;
                return Err(AgentError::FileSystemError(format!(
                    "Failed to write kit archive {}: {}",
                    archive_path.display(),
                    e
                )));
            }
            written += chunk.len() as u64;
        }

        file.flush().await?;
        info!("Downloaded kit archive to {} ({} bytes)", archive_path.display(), written);
        Ok(())
    }

    async fn extract_archive(&self, archive_path: &Path, kit_dir: &Path) -> AgentResult<()> {
        fs::create_dir_all(kit_dir).await?;

        let output = Command::new("tar")
            .arg("-xzf")
            .arg(archive_path)
            .arg("-C")
            .arg(kit_dir)
            .output()
            .await
            .map_err(|e| AgentError::InstallationError(format!("Failed to run tar: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AgentError::InstallationError(format!(
                "Failed to extract kit archive {}: {}",
                archive_path.display(),
                stderr.trim()
            )));
        }

        debug!("Extracted {} into {}", archive_path.display(), kit_dir.display());
        Ok(())
    }

    /// Ensures the distribution archive sits in the local cache and returns
    /// its path. In offline mode a cache miss is an error.
    async fn cached_archive(&self, distribution: &Distribution, offline: bool) -> AgentResult<PathBuf> {
        let archive_path = self.cache_dir.join(&distribution.archive);

        if fs::try_exists(&archive_path).await? {
            debug!("Kit archive {} already cached", archive_path.display());
            return Ok(archive_path);
        }

        if offline {
            return Err(AgentError::InstallationError(format!(
                "Offline mode and kit archive {} is not in the cache",
                archive_path.display()
            )));
        }

        let url = distribution.url.as_deref().ok_or_else(|| {
            AgentError::InstallationError(format!(
                "No download URL for kit version {} and archive {} is not cached",
                distribution.version, distribution.archive
            ))
        })?;

        self.download_archive(url, &archive_path).await?;
        Ok(archive_path)
    }

    async fn write_license(&self, kit_dir: &Path, license: &License) -> AgentResult<()> {
        let license_dir = kit_dir.join("license");
        fs::create_dir_all(&license_dir).await?;
        let license_path = license_dir.join(&license.name);
        fs::write(&license_path, &license.content).await.map_err(|e| {
            AgentError::InstallationError(format!(
                "Failed to write license {}: {}",
                license_path.display(),
                e
            ))
        })?;
        info!("License installed at {}", license_path.display());
        Ok(())
    }
}

#[async_trait]
impl KitProvider for KitManager {
    async fn acquire_kit(
        &self,
        instance_id: &InstanceId,
        distribution: &Distribution,
        kit_path: Option<&Path>,
        license: Option<&License>,
        offline: bool,
    ) -> AgentResult<PathBuf> {
        let kit_dir = self.kits_dir.join(instance_id.as_str());

        if dir_is_populated(&kit_dir).await? {
            info!("Reusing kit installation at {}", kit_dir.display());
            return Ok(kit_dir);
        }

        if let Some(source) = kit_path {
            info!(
                "Installing kit for instance {} from local build {}",
                instance_id,
                source.display()
            );
            copy_tree(source.to_path_buf(), kit_dir.clone()).await?;
        } else {
            info!(
                "Installing kit version {} for instance {}",
                distribution.version, instance_id
            );
            let archive_path = self.cached_archive(distribution, offline).await?;
            self.extract_archive(&archive_path, &kit_dir).await?;
        }

        if let Some(license) = license {
            self.write_license(&kit_dir, license).await?;
        }

        Ok(kit_dir)
    }

    async fn delete_install(&self, location: &Path) -> AgentResult<()> {
        match fs::remove_dir_all(location).await {
            Ok(()) => {
                debug!("Deleted kit installation at {}", location.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Kit installation {} was already gone", location.display());
                Ok(())
            }
            Err(e) => Err(AgentError::InstallationError(format!(
                "Unable to delete kit installation at {}: {}",
                location.display(),
                e
            ))),
        }
    }
}

async fn dir_is_populated(dir: &Path) -> AgentResult<bool> {
    if !fs::try_exists(dir).await? {
        return Ok(false);
    }
    let mut entries = fs::read_dir(dir).await?;
    Ok(entries.next_entry().await?.is_some())
}

/// Recursive directory copy, run on the blocking pool.
async fn copy_tree(source: PathBuf, target: PathBuf) -> AgentResult<()> {
    tokio::task::spawn_blocking(move || -> AgentResult<()> {
        copy_tree_sync(&source, &target).map_err(|e| {
            AgentError::InstallationError(format!(
                "Failed to copy kit from {} to {}: {}",
                source.display(),
                target.display(),
                e
            ))
        })
    })
    .await
    .map_err(|e| AgentError::InternalError(format!("Copy task failed: {}", e)))?
}

fn copy_tree_sync(source: &Path, target: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(target)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let entry_target = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree_sync(&entry.path(), &entry_target)?;
        } else {
            std::fs::copy(entry.path(), &entry_target)?;
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    fn distribution(archive: &str) -> Distribution {
        Distribution {
            version: "10.7.0".to_string(),
            archive: archive.to_string(),
            url: None,
        }
    }

    fn manager(root: &Path) -> KitManager {
        KitManager::new(&StorageConfig {
            root_dir: root.to_path_buf(),
        })
    }

    #[tokio::test]
    async fn offline_cache_miss_is_an_installation_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let err = manager
            .acquire_kit(
                &InstanceId::new("T1"),
                &distribution("kit-10.7.0.tar.gz"),
                None,
                None,
                true,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::InstallationError(_)));
        assert!(err.to_string().contains("kit-10.7.0.tar.gz"));
    }

    #[tokio::test]
    async fn installs_from_local_kit_path_and_reuses_populated_dir() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let source = dir.path().join("build");
        std::fs::create_dir_all(source.join("server/bin")).unwrap();
        std::fs::write(source.join("server/bin/start-server"), "#!/bin/sh\n").unwrap();

        let instance_id = InstanceId::new("T1");
        let kit_dir = manager
            .acquire_kit(&instance_id, &distribution("unused.tar.gz"), Some(&source), None, false)
            .await
            .unwrap();
        assert!(kit_dir.join("server/bin/start-server").exists());

        // A populated directory short-circuits, even without the local build.
        let again = manager
            .acquire_kit(&instance_id, &distribution("unused.tar.gz"), None, None, true)
            .await
            .unwrap();
        assert_eq!(again, kit_dir);
    }

    #[tokio::test]
    async fn writes_license_into_fresh_install() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let source = dir.path().join("build");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("readme.txt"), "kit").unwrap();

        let license = License {
            name: "cluster.key".to_string(),
            content: "licensed".to_string(),
        };
        let kit_dir = manager
            .acquire_kit(
                &InstanceId::new("T1"),
                &distribution("unused.tar.gz"),
                Some(&source),
                Some(&license),
                false,
            )
            .await
            .unwrap();

        let installed = std::fs::read_to_string(kit_dir.join("license/cluster.key")).unwrap();
        assert_eq!(installed, "licensed");
    }

    #[tokio::test]
    async fn delete_install_tolerates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager
            .delete_install(&dir.path().join("kits/never-created"))
            .await
            .unwrap();
    }
}
