//! One synchronization run: probe hosts, align the catalog with the output
//! directory, fetch the table of contents, decide what is new, assemble it and
//! record what was written.
//!
//! Volumes are processed one at a time; the catalog is only written between
//! volumes, never while the worker pool is running.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};
use url::Url;

use crate::assemble::{AssembledChapters, AssemblyPipeline, IntroPage};
use crate::catalog::{Catalog, CatalogStore, FetchedVolume};
use crate::choose::{Chooser, SelectAll};
use crate::config::SyncConfig;
use crate::epub::{ArtifactMetadata, ArtifactWriter, VolumeArtifact};
use crate::error::{Result, SyncError};
use crate::extract::PageExtractor;
use crate::fetch::{Fetcher, HostPool, RetryPolicy};
use crate::formats::CatalogEntry;
use crate::layout;
use crate::model::{ChapterRef, Volume, Work};
use crate::pool::{ItemFailure, WorkerPool};
use crate::reconcile::{self, DeltaKind, VolumeDelta};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Download the selected volumes of a work in full.
    Download { url: String },
    /// Download a chapter range of a single volume.
    Chapters { url: String },
    /// Fetch what is new for one known work.
    Update { url: String },
    /// Fetch what is new for every known work.
    UpdateAll,
}

impl Mode {
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Download { url } | Self::Chapters { url } | Self::Update { url } => Some(url),
            Self::UpdateAll => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenVolume {
    pub work: String,
    pub volume: String,
    pub path: PathBuf,
    pub chapters_added: usize,
    /// `true` when chapters were added to an existing file.
    pub appended: bool,
}

/// A volume or work that could not be processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFailure {
    pub target: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub written: Vec<WrittenVolume>,
    pub chapter_failures: Vec<ItemFailure>,
    pub image_failures: usize,
    pub failures: Vec<TargetFailure>,
}

impl SyncReport {
    pub fn chapters_added(&self) -> usize {
        self.written.iter().map(|v| v.chapters_added).sum()
    }

    fn record_failure(&mut self, target: impl Into<String>, err: &SyncError) {
        let target = target.into();
        warn!(target = %target, error = %err, "FAIL");
        self.failures.push(TargetFailure {
            target,
            error: err.to_string(),
        });
    }
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(SyncReport),
    /// Everything was already up to date, or nothing was selected.
    NothingToDo(SyncReport),
    /// The input does not name something this tool can work with.
    Rejected { reason: String },
}

/// Resolves user input to a URL on one of the configured hosts. No network access.
pub fn validate_url(config: &SyncConfig, raw: &str) -> Result<Url> {
    check_url(&HostPool::from_hosts(config.hosts.clone()), raw)
}

fn check_url(hosts: &HostPool, raw: &str) -> Result<Url> {
    let url = hosts.resolve(raw)?;
    if !hosts.is_known(&url) {
        return Err(SyncError::invalid_url(raw));
    }
    Ok(hosts.canonicalize(&url))
}

/// In-memory catalog plus whether it may be written back.
struct CatalogState {
    catalog: Catalog,
    persist: bool,
}

pub struct Synchronizer {
    config: SyncConfig,
    fetcher: Arc<Fetcher>,
    extractor: Arc<dyn PageExtractor>,
    writer: Arc<dyn ArtifactWriter>,
    chooser: Arc<dyn Chooser>,
    pipeline: AssemblyPipeline,
    store: CatalogStore,
}

impl Synchronizer {
    /// Builds the HTTP client and probes the configured hosts.
    pub async fn connect(
        config: SyncConfig,
        extractor: Arc<dyn PageExtractor>,
        writer: Arc<dyn ArtifactWriter>,
        chooser: Arc<dyn Chooser>,
    ) -> Result<Self> {
        if config.hosts.is_empty() {
            return Err(SyncError::config("at least one host is required"));
        }
        let client = Fetcher::build_client(&config)?;
        let hosts = HostPool::probe(&client, &config.hosts, config.probe_timeout).await?;
        let fetcher = Fetcher::new(client, Arc::new(hosts), RetryPolicy::from_config(&config));
        Ok(Self::new(config, Arc::new(fetcher), extractor, writer, chooser))
    }

    pub fn new(
        config: SyncConfig,
        fetcher: Arc<Fetcher>,
        extractor: Arc<dyn PageExtractor>,
        writer: Arc<dyn ArtifactWriter>,
        chooser: Arc<dyn Chooser>,
    ) -> Self {
        let pipeline = AssemblyPipeline::new(
            Arc::clone(&fetcher),
            Arc::clone(&extractor),
            WorkerPool::new(config.workers),
        );
        let store = CatalogStore::new(config.catalog_path.clone());
        Self {
            config,
            fetcher,
            extractor,
            writer,
            chooser,
            pipeline,
            store,
        }
    }

    pub async fn run(&self, mode: &Mode) -> Result<RunOutcome> {
        let target = match mode.url() {
            Some(raw) => match check_url(self.fetcher.hosts(), raw) {
                Ok(url) => Some(url),
                Err(err) if err.is_invalid_input() => {
                    return Ok(RunOutcome::Rejected {
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            },
            None => None,
        };

        let mut state = self.open_catalog().await?;
        let mut report = SyncReport::default();

        let outcome = match (mode, target) {
            (Mode::Download { .. }, Some(url)) => {
                self.download(&url, &mut state, &mut report).await
            }
            (Mode::Chapters { .. }, Some(url)) => {
                self.download_range(&url, &mut state, &mut report).await
            }
            (Mode::Update { .. }, Some(url)) => {
                let Some(entry) = self.find_entry(&state.catalog, &url).cloned() else {
                    return Ok(RunOutcome::Rejected {
                        reason: format!("not in the catalog: {url}"),
                    });
                };
                self.update_work(&entry, self.chooser.as_ref(), &mut state, &mut report)
                    .await
            }
            (Mode::UpdateAll, _) => self.update_all(&mut state, &mut report).await,
            (_, None) => return Err(SyncError::config("mode requires a URL")),
        };

        match outcome {
            Ok(()) => {}
            Err(err) if err.is_invalid_input() => {
                return Ok(RunOutcome::Rejected {
                    reason: err.to_string(),
                });
            }
            Err(err) => return Err(err),
        }

        if report.written.is_empty() && report.failures.is_empty() && report.chapter_failures.is_empty()
        {
            Ok(RunOutcome::NothingToDo(report))
        } else {
            Ok(RunOutcome::Completed(report))
        }
    }

    /// Prunes the catalog against the output directory and loads it. A malformed
    /// file is left alone and the run continues without persisting.
    async fn open_catalog(&self) -> Result<CatalogState> {
        match self.store.reconcile_with_disk(&self.config.output_dir).await {
            Ok(report) => {
                for work in &report.removed_works {
                    info!(work = %work, "dropped from catalog; output directory is gone");
                }
                for (work, volume) in &report.removed_volumes {
                    info!(work = %work, volume = %volume, "dropped from catalog; artifact is gone");
                }
                Ok(CatalogState {
                    catalog: self.store.load().await?,
                    persist: true,
                })
            }
            Err(err @ SyncError::CatalogIo { .. }) => {
                warn!(
                    path = %self.store.path().display(),
                    error = %err,
                    "catalog is unreadable; continuing without saving progress"
                );
                Ok(CatalogState {
                    catalog: Catalog::default(),
                    persist: false,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// The catalog entry for `url`, whichever configured host it was recorded under.
    fn find_entry<'a>(&self, catalog: &'a Catalog, url: &Url) -> Option<&'a CatalogEntry> {
        let hosts = self.fetcher.hosts();
        catalog.find(url.as_str()).or_else(|| {
            catalog.entries().iter().find(|entry| {
                hosts
                    .resolve(&entry.ln_url)
                    .is_ok_and(|recorded| hosts.canonicalize(&recorded) == *url)
            })
        })
    }

    /// The URL a work is recorded under: the existing entry's, or the canonical one.
    fn record_url(&self, state: &CatalogState, url: &Url) -> String {
        self.find_entry(&state.catalog, url)
            .map(|entry| entry.ln_url.clone())
            .unwrap_or_else(|| url.to_string())
    }

    async fn download(&self, url: &Url, state: &mut CatalogState, report: &mut SyncReport) -> Result<()> {
        let mut work = self.load_work(url, &self.record_url(state, url)).await?;
        let names = work.volumes.iter().map(|v| v.name.clone()).collect::<Vec<_>>();
        let selected = self.chooser.choose_subset(&names);
        if selected.is_empty() {
            info!(work = %work.name, "no volume selected");
            return Ok(());
        }
        self.load_volumes(&mut work, &selected, report).await;

        for index in selected {
            let volume = work.volumes[index].clone();
            if volume.chapters.is_empty() {
                warn!(volume = %volume.name, "volume has no chapters; skipping");
                continue;
            }
            let chapters = volume.chapters.clone();
            if let Err(err) = self.write_volume(&work, &volume, &chapters, state, report).await {
                report.record_failure(format!("{} / {}", work.name, volume.name), &err);
            }
        }
        Ok(())
    }

    async fn download_range(&self, url: &Url, state: &mut CatalogState, report: &mut SyncReport) -> Result<()> {
        let mut work = self.load_work(url, &self.record_url(state, url)).await?;
        let names = work.volumes.iter().map(|v| v.name.clone()).collect::<Vec<_>>();
        let Some(&index) = self.chooser.choose_subset(&names).first() else {
            info!(work = %work.name, "no volume selected");
            return Ok(());
        };
        self.load_volumes(&mut work, &[index], report).await;

        let volume = work.volumes[index].clone();
        let chapter_names = volume.chapters.iter().map(|c| c.name.clone()).collect::<Vec<_>>();
        let Some(range) = self.chooser.choose_range(&chapter_names) else {
            warn!(volume = %volume.name, "chapter range does not match this volume");
            return Ok(());
        };
        let chapters = volume.chapters[range].to_vec();

        if let Err(err) = self.write_volume(&work, &volume, &chapters, state, report).await {
            report.record_failure(format!("{} / {}", work.name, volume.name), &err);
        }
        Ok(())
    }

    async fn update_all(&self, state: &mut CatalogState, report: &mut SyncReport) -> Result<()> {
        let entries = state.catalog.entries().to_vec();
        if entries.is_empty() {
            info!("catalog is empty; nothing to update");
        }
        for entry in &entries {
            if let Err(err) = self.update_work(entry, &SelectAll, state, report).await {
                report.record_failure(entry.ln_name.clone(), &err);
            }
        }
        Ok(())
    }

    async fn update_work(
        &self,
        entry: &CatalogEntry,
        chooser: &dyn Chooser,
        state: &mut CatalogState,
        report: &mut SyncReport,
    ) -> Result<()> {
        info!(work = %entry.ln_name, "checking for updates");
        let url = self.fetcher.hosts().resolve(&entry.ln_url)?;
        let mut work = self.load_work(&url, &entry.ln_url).await?;
        let all = (0..work.volumes.len()).collect::<Vec<_>>();
        self.load_volumes(&mut work, &all, report).await;

        let deltas = reconcile::reconcile(entry, &work);
        let names = deltas.iter().map(|d| d.volume.name.clone()).collect::<Vec<_>>();
        let selected = chooser.choose_subset(&names);
        if selected.is_empty() {
            info!(work = %work.name, "up to date");
            return Ok(());
        }

        for index in selected {
            let delta = &deltas[index];
            if let Err(err) = self.apply_delta(&work, delta, state, report).await {
                report.record_failure(format!("{} / {}", work.name, delta.volume.name), &err);
            }
        }
        Ok(())
    }

    async fn apply_delta(
        &self,
        work: &Work,
        delta: &VolumeDelta,
        state: &mut CatalogState,
        report: &mut SyncReport,
    ) -> Result<()> {
        info!(
            volume = %delta.volume.name,
            kind = ?delta.kind,
            chapters = delta.chapters.len(),
            "updating volume"
        );
        let path = layout::volume_path(&self.config.output_dir, &work.name, &delta.volume.name);
        let existing = match delta.kind {
            DeltaKind::NewVolume => None,
            DeltaKind::NewChapters => self.writer.next_chapter_index(&path).await?,
        };

        match existing {
            None => {
                if delta.kind == DeltaKind::NewChapters {
                    warn!(path = %path.display(), "artifact is missing; writing the new chapters to a fresh file");
                }
                self.write_volume(work, &delta.volume, &delta.chapters, state, report)
                    .await
            }
            Some(start_index) => {
                let assembled = self.pipeline.assemble(&delta.chapters, start_index).await;
                if assembled.chapters.is_empty() {
                    return Err(all_chapters_failed(&delta.volume, &assembled));
                }
                let artifact = VolumeArtifact {
                    metadata: self.metadata(work, &delta.volume),
                    cover: None,
                    intro: None,
                    chapters: assembled.chapters.clone(),
                };
                self.writer.append(&path, artifact).await?;
                self.record(work, &delta.volume, &path, assembled, true, state, report)
                    .await
            }
        }
    }

    /// Assembles `chapters` of `volume` into a fresh artifact and records them.
    async fn write_volume(
        &self,
        work: &Work,
        volume: &Volume,
        chapters: &[ChapterRef],
        state: &mut CatalogState,
        report: &mut SyncReport,
    ) -> Result<()> {
        info!(volume = %volume.name, chapters = chapters.len(), "processing volume");
        let path = layout::volume_path(&self.config.output_dir, &work.name, &volume.name);

        let assembled = self.pipeline.assemble(chapters, 0).await;
        if assembled.chapters.is_empty() {
            return Err(all_chapters_failed(volume, &assembled));
        }
        let cover = self.pipeline.fetch_cover(volume).await;
        let artifact = VolumeArtifact {
            metadata: self.metadata(work, volume),
            intro: Some(IntroPage::new(work, volume, cover.is_some())),
            cover,
            chapters: assembled.chapters.clone(),
        };
        self.writer.create(&path, artifact).await?;
        self.record(work, volume, &path, assembled, false, state, report)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        work: &Work,
        volume: &Volume,
        path: &Path,
        assembled: AssembledChapters,
        appended: bool,
        state: &mut CatalogState,
        report: &mut SyncReport,
    ) -> Result<()> {
        let fetched = FetchedVolume {
            name: volume.name.clone(),
            total_chapters: volume.chapters.len(),
            chapters: assembled.names(),
        };
        if state.persist {
            match self.store.merge(work, std::slice::from_ref(&fetched)).await {
                Ok(catalog) => state.catalog = catalog,
                Err(err) => {
                    // Progress is kept in memory only; later volumes still run.
                    report.record_failure(self.store.path().display().to_string(), &err);
                    state.persist = false;
                    state.catalog.merge(work, &[fetched]);
                }
            }
        } else {
            state.catalog.merge(work, &[fetched]);
        }

        info!(
            volume = %volume.name,
            path = %path.display(),
            chapters = assembled.chapters.len(),
            failed = assembled.failures.len(),
            "DONE volume"
        );
        report.image_failures += assembled
            .chapters
            .iter()
            .map(|c| c.image_failures.len())
            .sum::<usize>();
        report.written.push(WrittenVolume {
            work: work.name.clone(),
            volume: volume.name.clone(),
            path: path.to_path_buf(),
            chapters_added: assembled.chapters.len(),
            appended,
        });
        report.chapter_failures.extend(assembled.failures);
        Ok(())
    }

    fn metadata(&self, work: &Work, volume: &Volume) -> ArtifactMetadata {
        ArtifactMetadata::for_volume(&work.url, &work.name, &volume.name, &work.author, &self.config.lang)
    }

    /// Fetches the work page. Volumes are listed but their chapters are not loaded.
    async fn load_work(&self, url: &Url, record_url: &str) -> Result<Work> {
        let (page_url, html) = self.fetcher.fetch_page(url).await?;
        let page = self.extractor.extract_work(&page_url, &html)?;
        info!(work = %page.name, volumes = page.volumes.len(), "work page loaded");

        let hosts = self.fetcher.hosts();
        let volumes = page
            .volumes
            .into_iter()
            .map(|link| Volume {
                url: link.url.map(|u| hosts.canonicalize(&u)),
                ..Volume::new(link.name)
            })
            .collect();

        Ok(Work {
            url: record_url.to_string(),
            name: page.name,
            author: page.author,
            series_info: page.series_info,
            summary: page.summary,
            fact_item: page.fact_item,
            volumes,
        })
    }

    /// Loads cover and chapter list for the volumes at `indices`. A volume page
    /// that cannot be loaded leaves that volume without chapters and is reported.
    async fn load_volumes(&self, work: &mut Work, indices: &[usize], report: &mut SyncReport) {
        let hosts = self.fetcher.hosts();
        let work_name = work.name.clone();
        for &index in indices {
            let Some(volume) = work.volumes.get_mut(index) else {
                continue;
            };
            let target = format!("{work_name} / {}", volume.name);
            let Some(volume_url) = volume.url.clone() else {
                report.record_failure(
                    target,
                    &SyncError::extraction(&work.url, "volume has no link"),
                );
                continue;
            };
            let loaded = match self.fetcher.fetch_page(&volume_url).await {
                Ok((page_url, html)) => self.extractor.extract_volume(&page_url, &html),
                Err(err) => Err(err),
            };
            match loaded {
                Ok(page) => {
                    volume.cover_url = page.cover_url;
                    for (name, url) in page.chapters {
                        volume.push_chapter(name, hosts.canonicalize(&url));
                    }
                }
                Err(err) => report.record_failure(target, &err),
            }
        }
    }
}

fn all_chapters_failed(volume: &Volume, assembled: &AssembledChapters) -> SyncError {
    let message = assembled
        .failures
        .first()
        .map(|f| f.error.clone())
        .unwrap_or_else(|| "no chapters".to_string());
    SyncError::extraction(
        volume
            .url
            .as_ref()
            .map(Url::to_string)
            .unwrap_or_else(|| volume.name.clone()),
        format!("every chapter failed: {message}"),
    )
}
