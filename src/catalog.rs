//! Persisted record of every work, volume and chapter already turned into artifacts.
//!
//! [`Catalog`] holds the in-memory state and the merge/prune rules; [`CatalogStore`]
//! owns the file. Every store call reads the whole file, mutates it in memory and
//! writes it back atomically. Concurrent runs against one file are not supported.

use std::path::{Path, PathBuf};

use serde::Serialize as _;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::formats::{CatalogEntry, CatalogFile, CatalogVolume};
use crate::layout;
use crate::model::Work;

/// Chapters of one volume that were turned into artifact content during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedVolume {
    pub name: String,
    /// Chapter count reported by the source for the whole volume.
    pub total_chapters: usize,
    pub chapters: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed_works: Vec<String>,
    pub removed_volumes: Vec<(String, String)>,
}

impl PruneReport {
    pub fn is_empty(&self) -> bool {
        self.removed_works.is_empty() && self.removed_volumes.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    file: CatalogFile,
}

impl Catalog {
    pub fn from_file(file: CatalogFile) -> Self {
        Self { file }
    }

    pub fn file(&self) -> &CatalogFile {
        &self.file
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.file.ln_list
    }

    pub fn find(&self, url: &str) -> Option<&CatalogEntry> {
        self.file.ln_list.iter().find(|e| e.ln_url == url)
    }

    /// Records fetched volumes and chapters for `work`.
    ///
    /// Unknown works are appended whole. For known works the name is refreshed,
    /// unseen volumes are appended and unseen chapter names are appended to known
    /// volumes in order. Merging the same input twice is a no-op.
    pub fn merge(&mut self, work: &Work, fetched: &[FetchedVolume]) {
        let Some(entry) = self.file.ln_list.iter_mut().find(|e| e.ln_url == work.url) else {
            self.file.ln_list.push(CatalogEntry {
                ln_name: work.name.clone(),
                ln_url: work.url.clone(),
                num_vol: work.volumes.len().max(fetched.len()),
                vol_list: fetched.iter().map(new_volume_record).collect(),
                extra: Default::default(),
            });
            return;
        };

        if entry.ln_name != work.name {
            entry.ln_name = work.name.clone();
        }

        for volume in fetched {
            match entry.vol_list.iter_mut().find(|v| v.vol_name == volume.name) {
                None => entry.vol_list.push(new_volume_record(volume)),
                Some(record) => {
                    for chapter in &volume.chapters {
                        if !record.chapter_list.contains(chapter) {
                            record.chapter_list.push(chapter.clone());
                        }
                    }
                    record.num_chapter = record.num_chapter.max(record.chapter_list.len());
                }
            }
        }
        entry.num_vol = entry.num_vol.max(entry.vol_list.len());
    }

    /// Drops works whose directory and volumes whose artifact file no longer exist.
    pub fn prune_missing(&mut self, output_dir: &Path) -> PruneReport {
        let mut report = PruneReport::default();

        self.file.ln_list.retain(|entry| {
            if entry.ln_name.is_empty() {
                return true;
            }
            let keep = layout::work_dir(output_dir, &entry.ln_name).is_dir();
            if !keep {
                report.removed_works.push(entry.ln_name.clone());
            }
            keep
        });

        for entry in &mut self.file.ln_list {
            if entry.ln_name.is_empty() {
                continue;
            }
            let work_name = entry.ln_name.clone();
            entry.vol_list.retain(|volume| {
                if volume.vol_name.is_empty() {
                    return true;
                }
                let keep = layout::volume_path(output_dir, &work_name, &volume.vol_name).is_file();
                if !keep {
                    report
                        .removed_volumes
                        .push((work_name.clone(), volume.vol_name.clone()));
                }
                keep
            });
        }

        report
    }
}

fn new_volume_record(volume: &FetchedVolume) -> CatalogVolume {
    let mut chapter_list: Vec<String> = Vec::with_capacity(volume.chapters.len());
    for chapter in &volume.chapters {
        if !chapter_list.contains(chapter) {
            chapter_list.push(chapter.clone());
        }
    }
    CatalogVolume {
        vol_name: volume.name.clone(),
        num_chapter: volume.total_chapters.max(chapter_list.len()),
        chapter_list,
        extra: Default::default(),
    }
}

#[derive(Debug, Clone)]
pub struct CatalogStore {
    path: PathBuf,
}

impl CatalogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the catalog. A missing file is an empty catalog.
    pub async fn load(&self) -> Result<Catalog> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "catalog file not found; starting empty");
                return Ok(Catalog::default());
            }
            Err(err) => return Err(SyncError::catalog_io(&self.path, format!("read: {err}"))),
        };
        let file: CatalogFile = serde_json::from_slice(&bytes)
            .map_err(|err| SyncError::catalog_io(&self.path, format!("parse json: {err}")))?;
        Ok(Catalog::from_file(file))
    }

    pub async fn save(&self, catalog: &Catalog) -> Result<()> {
        write_json_atomic(&self.path, catalog.file()).await
    }

    pub async fn merge(&self, work: &Work, fetched: &[FetchedVolume]) -> Result<Catalog> {
        let mut catalog = self.load().await?;
        catalog.merge(work, fetched);
        self.save(&catalog).await?;
        info!(work = %work.name, volumes = fetched.len(), "catalog updated");
        Ok(catalog)
    }

    /// Prunes entries whose artifacts are gone. The file is only rewritten if
    /// something was removed.
    pub async fn reconcile_with_disk(&self, output_dir: &Path) -> Result<PruneReport> {
        let mut catalog = self.load().await?;
        let report = catalog.prune_missing(output_dir);
        if !report.is_empty() {
            self.save(&catalog).await?;
            info!(
                removed_works = report.removed_works.len(),
                removed_volumes = report.removed_volumes.len(),
                "catalog pruned to match output directory"
            );
        }
        Ok(report)
    }
}

async fn write_json_atomic(path: &Path, value: &CatalogFile) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .await
            .map_err(|err| SyncError::catalog_io(parent, format!("create parent dir: {err}")))?;
    }

    let mut data = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut data, formatter);
    value
        .serialize(&mut serializer)
        .map_err(|err| SyncError::catalog_io(path, format!("serialize json: {err}")))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp_path, &data)
        .await
        .map_err(|err| SyncError::catalog_io(&tmp_path, format!("write tmp: {err}")))?;
    fs::rename(&tmp_path, path)
        .await
        .map_err(|err| SyncError::catalog_io(path, format!("rename tmp to final: {err}")))?;
    Ok(())
}
