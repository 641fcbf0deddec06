//! Turns an ordered chapter list into ordered, self-contained chapter blocks.
//!
//! Chapters are fetched in parallel on the [`WorkerPool`]; each chapter's images
//! are fetched sequentially inside its own task. Chapter `n` (1-based, offset by
//! `start_index`) is stored as `chap_<n>` with images under
//! `images/chapter_<n>/image_<k>.jpeg`.

use std::sync::Arc;

use tracing::{info, warn};
use url::Url;

use crate::epub::xml_escape;
use crate::error::{Result, SyncError};
use crate::extract::PageExtractor;
use crate::fetch::Fetcher;
use crate::media;
use crate::model::{ChapterRef, FetchTask, Volume, Work};
use crate::pool::{ItemFailure, WorkerPool};

/// A binary file stored next to the chapter documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    /// Path relative to the content root, e.g. `images/chapter_1/image_0.jpeg`.
    pub path: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ChapterBlock {
    /// Position in the requested chapter list.
    pub index: usize,
    /// 1-based chapter number inside the artifact.
    pub number: usize,
    /// Chapter name as listed by the volume page; recorded in the catalog.
    pub name: String,
    pub title: String,
    /// HTML fragment: heading followed by the chapter body.
    pub body: String,
    pub assets: Vec<Asset>,
    pub image_failures: Vec<ItemFailure>,
}

impl ChapterBlock {
    pub fn stem(&self) -> String {
        chapter_stem(self.number)
    }
}

pub fn chapter_stem(number: usize) -> String {
    format!("chap_{number}")
}

#[derive(Debug, Default)]
pub struct AssembledChapters {
    /// Successfully rendered chapters in list order.
    pub chapters: Vec<ChapterBlock>,
    pub failures: Vec<ItemFailure>,
}

impl AssembledChapters {
    pub fn names(&self) -> Vec<String> {
        self.chapters.iter().map(|c| c.name.clone()).collect()
    }
}

/// Intro page content shown right after the cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntroPage {
    pub body: String,
}

impl IntroPage {
    pub fn new(work: &Work, volume: &Volume, has_cover: bool) -> Self {
        let mut body = String::from("<div class=\"intro\">\n");
        if has_cover {
            body.push_str("<img id=\"cover\" src=\"cover.jpeg\" alt=\"cover\" />\n");
        }
        body.push_str(&format!(
            "<div>\n<h1>{}</h1>\n<h3>{}</h3>\n</div>\n",
            xml_escape(&work.name),
            xml_escape(&volume.name)
        ));
        body.push_str(&work.series_info);
        body.push_str(&work.summary);
        body.push_str(&work.fact_item);
        body.push_str("\n</div>\n");
        Self { body }
    }
}

pub struct AssemblyPipeline {
    fetcher: Arc<Fetcher>,
    extractor: Arc<dyn PageExtractor>,
    pool: WorkerPool,
}

impl AssemblyPipeline {
    pub fn new(fetcher: Arc<Fetcher>, extractor: Arc<dyn PageExtractor>, pool: WorkerPool) -> Self {
        Self {
            fetcher,
            extractor,
            pool,
        }
    }

    /// Fetches and renders `chapters`, numbering them from `start_index + 1`.
    ///
    /// Failed chapters are left out of the result and reported in `failures`;
    /// they never abort their siblings.
    pub async fn assemble(&self, chapters: &[ChapterRef], start_index: usize) -> AssembledChapters {
        let tasks = chapters
            .iter()
            .enumerate()
            .map(|(index, chapter)| FetchTask {
                index,
                url: chapter.url.clone(),
                label: chapter.name.clone(),
            })
            .collect::<Vec<_>>();

        let fetcher = Arc::clone(&self.fetcher);
        let extractor = Arc::clone(&self.extractor);
        let outcome = self
            .pool
            .run(tasks, move |task| {
                let fetcher = Arc::clone(&fetcher);
                let extractor = Arc::clone(&extractor);
                async move { render_chapter(&fetcher, extractor.as_ref(), task, start_index).await }
            })
            .await;

        let (chapters, failures) = outcome.into_values();
        for chapter in &chapters {
            info!(chapter = %chapter.name, number = chapter.number, "DONE chapter");
        }
        for failure in &failures {
            warn!(chapter = %failure.label, error = %failure.error, "FAIL chapter");
        }
        AssembledChapters { chapters, failures }
    }

    /// Fetches the volume cover as JPEG. A failure only costs the cover.
    pub async fn fetch_cover(&self, volume: &Volume) -> Option<Vec<u8>> {
        let url = volume.cover_url.as_ref()?;
        match media::fetch_jpeg(&self.fetcher, url).await {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!(volume = %volume.name, url = %url, error = %err, "FAIL cover image");
                None
            }
        }
    }
}

async fn render_chapter(
    fetcher: &Fetcher,
    extractor: &dyn PageExtractor,
    task: FetchTask,
    start_index: usize,
) -> Result<ChapterBlock> {
    let number = start_index + task.index + 1;
    let (page_url, html) = fetcher.fetch_page(&task.url).await?;
    let page = extractor.extract_chapter(&page_url, &html)?;

    let title = page
        .title
        .clone()
        .unwrap_or_else(|| format!("Chapter {number}"));

    let mut body = page.body_html.clone();
    let mut assets = Vec::new();
    let mut image_failures = Vec::new();

    for image in &page.images {
        if media::is_banner(&image.src) {
            continue;
        }
        let local = format!("images/chapter_{number}/image_{}.jpeg", image.position);
        let fetched = match resolve_image(&page_url, &image.src) {
            Some(remote) => media::fetch_jpeg(fetcher, &remote).await,
            None => Err(SyncError::invalid_url(image.src.clone())),
        };
        match fetched {
            Ok(bytes) => {
                body = rewrite_image_src(&body, &image.src, &local);
                assets.push(Asset { path: local, bytes });
            }
            Err(err) => {
                warn!(chapter = %task.label, src = %image.src, error = %err, "FAIL chapter image");
                image_failures.push(ItemFailure {
                    index: image.position,
                    label: image.src.clone(),
                    error: err.to_string(),
                });
            }
        }
    }

    let mut content = format!(
        "<h4 class=\"chapter-title\">{}</h4>\n",
        xml_escape(&title)
    );
    content.push_str(&body);
    let content = apply_notes(&content, &page.notes);

    Ok(ChapterBlock {
        index: task.index,
        number,
        name: task.label,
        title,
        body: content,
        assets,
        image_failures,
    })
}

fn resolve_image(page_url: &Url, src: &str) -> Option<Url> {
    page_url.join(src.trim()).ok()
}

/// Points every `src` attribute equal to `remote` at `local`.
///
/// Serialized markup escapes `&` in attribute values, so both spellings are replaced.
pub fn rewrite_image_src(body: &str, remote: &str, local: &str) -> String {
    let replacement = format!("src=\"{local}\"");
    let mut out = body.replace(&format!("src=\"{remote}\""), &replacement);
    let escaped = remote.replace('&', "&amp;");
    if escaped != remote {
        out = out.replace(&format!("src=\"{escaped}\""), &replacement);
    }
    out
}

/// Replaces `[noteN]` markers with their note text. Unknown markers stay as they are.
pub fn apply_notes(body: &str, notes: &[(String, String)]) -> String {
    let mut out = body.to_string();
    for (marker, text) in notes {
        out = out.replace(marker.as_str(), &xml_escape(text));
    }
    out
}
