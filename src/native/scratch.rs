use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::SystemTime,
};

use itertools::Itertools;
use tokio::fs;

use crate::{
    constants::{HARNESS_FILE_NAME, HOME_DIR_NAME, SCRIPT_FILE_NAME, WORK_DIR_NAME},
    core::domain::RunId,
    native::harness::harness_source,
};

/// Per-run directory tree. `work` is the script's cwd and the only place
/// whose files are published as artifacts.
#[derive(Debug, Clone)]
pub struct ScratchLayout {
    pub root: PathBuf,
    pub work: PathBuf,
    pub home: PathBuf,
    pub harness: PathBuf,
    pub script: PathBuf,
}

impl ScratchLayout {
    pub fn new(scratch_root: &Path, run_id: RunId) -> Self {
        let root = scratch_root.join(run_id.to_string());
        Self {
            work: root.join(WORK_DIR_NAME),
            home: root.join(HOME_DIR_NAME),
            harness: root.join(HARNESS_FILE_NAME),
            script: root.join(SCRIPT_FILE_NAME),
            root,
        }
    }

    pub async fn create(&self, code: &str) -> io::Result<()> {
        fs::create_dir_all(&self.work).await?;
        fs::create_dir_all(&self.home).await?;
        fs::write(&self.harness, harness_source()).await?;
        fs::write(&self.script, code).await?;
        Ok(())
    }

    pub async fn remove(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScratchFile {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub modified: SystemTime,
}

/// Total size of regular files under `dir`. Symlinks are not followed and
/// files vanishing mid-walk are skipped.
pub async fn dir_size(dir: &Path) -> io::Result<u64> {
    Ok(walk(dir).await?.iter().map(|file| file.size).sum())
}

/// Regular files under `dir`, oldest first.
pub async fn list_files(dir: &Path) -> io::Result<Vec<ScratchFile>> {
    Ok(walk(dir)
        .await?
        .into_iter()
        .sorted_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)))
        .collect())
}

async fn walk(dir: &Path) -> io::Result<Vec<ScratchFile>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };

        while let Some(entry) = entries.next_entry().await? {
            let metadata = match fs::symlink_metadata(entry.path()).await {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };

            if metadata.is_dir() {
                pending.push(entry.path());
            } else if metadata.is_file() {
                files.push(ScratchFile {
                    path: entry.path(),
                    name: entry.file_name().to_string_lossy().into_owned(),
                    size: metadata.len(),
                    modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                });
            }
        }
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_create_and_remove_layout() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ScratchLayout::new(dir.path(), Uuid::new_v4());

        layout.create("console.log(1)").await.unwrap();
        assert!(layout.work.is_dir());
        assert!(layout.home.is_dir());
        assert_eq!(
            std::fs::read_to_string(&layout.script).unwrap(),
            "console.log(1)"
        );
        assert!(std::fs::read_to_string(&layout.harness)
            .unwrap()
            .contains("AsyncFunction"));

        layout.remove().await.unwrap();
        assert!(!layout.root.exists());
        layout.remove().await.unwrap();
    }

    #[tokio::test]
    async fn test_list_files_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("first.png"), b"12").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("second.pdf"), b"3456").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("/etc/passwd", dir.path().join("link")).unwrap();

        let files = list_files(dir.path()).await.unwrap();
        let names: Vec<_> = files.iter().map(|file| file.name.as_str()).collect();

        assert_eq!(names, vec!["first.png", "second.pdf"]);
        assert_eq!(dir_size(dir.path()).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();

        assert!(list_files(&dir.path().join("gone")).await.unwrap().is_empty());
    }
}
