//! Turns fetched pages into structured records.
//!
//! The pipeline only depends on [`PageExtractor`]; [`HakoExtractor`] knows the
//! markup of the ln.hako.vn family of sites.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::error::{Result, SyncError};

const SUMMARY_HEADING: &str = "<h4>Tóm tắt</h4>";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkPage {
    pub name: String,
    pub author: String,
    pub series_info: String,
    pub summary: String,
    pub fact_item: String,
    pub volumes: Vec<VolumeLink>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeLink {
    pub name: String,
    pub url: Option<Url>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumePage {
    pub cover_url: Option<Url>,
    pub chapters: Vec<(String, Url)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChapterPage {
    pub title: Option<String>,
    /// Serialized chapter body, opaque to the pipeline.
    pub body_html: String,
    pub images: Vec<ImageRef>,
    /// `(marker, replacement)` pairs, e.g. `("[note1]", "(Note: ...)")`.
    pub notes: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Position among all `<img>` tags of the chapter body.
    pub position: usize,
    /// The `src` attribute exactly as it appears in the page.
    pub src: String,
}

pub trait PageExtractor: Send + Sync {
    fn extract_work(&self, url: &Url, html: &str) -> Result<WorkPage>;
    fn extract_volume(&self, url: &Url, html: &str) -> Result<VolumePage>;
    fn extract_chapter(&self, url: &Url, html: &str) -> Result<ChapterPage>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HakoExtractor;

impl PageExtractor for HakoExtractor {
    fn extract_work(&self, url: &Url, html: &str) -> Result<WorkPage> {
        let doc = Html::parse_document(html);

        let volume_sel = selector(url, "section.volume-list")?;
        if doc.select(&volume_sel).next().is_none() {
            return Err(SyncError::extraction(
                url.as_str(),
                "no volume list found; not a valid work page",
            ));
        }

        let name = first_text(&doc, &selector(url, "span.series-name")?)
            .unwrap_or_else(|| "Unknown Light Novel".to_string());

        let mut page = WorkPage {
            name,
            ..WorkPage::default()
        };

        if let Some(info) = doc
            .select(&selector(url, "div.series-information")?)
            .next()
        {
            page.series_info = strip_bound_attributes(&info.html());
            page.author = extract_author(url, info)?.unwrap_or_default();
        }

        if let Some(summary) = doc.select(&selector(url, "div.summary-content")?).next() {
            page.summary = format!("{SUMMARY_HEADING}{}", strip_bound_attributes(&summary.html()));
        }

        if let Some(fact) = doc.select(&selector(url, "div.fact-item")?).next() {
            page.fact_item = strip_bound_attributes(&fact.html());
        }

        let title_sel = selector(url, "span.sect-title")?;
        let cover_link_sel = selector(url, "div.volume-cover a")?;
        for section in doc.select(&volume_sel) {
            let name = section
                .select(&title_sel)
                .next()
                .map(|el| format_text(&el.text().collect::<String>()))
                .unwrap_or_else(|| "Unknown Volume".to_string());
            let volume_url = section
                .select(&cover_link_sel)
                .next()
                .and_then(|a| a.value().attr("href"))
                .and_then(|href| url.join(href.trim()).ok());
            page.volumes.push(VolumeLink {
                name,
                url: volume_url,
            });
        }

        Ok(page)
    }

    fn extract_volume(&self, url: &Url, html: &str) -> Result<VolumePage> {
        let doc = Html::parse_document(html);
        let mut page = VolumePage::default();

        let cover_sel = selector(url, "div.series-cover div.img-in-ratio")?;
        page.cover_url = doc
            .select(&cover_sel)
            .next()
            .and_then(|el| el.value().attr("style"))
            .and_then(url_in_style)
            .and_then(|raw| url.join(&raw).ok());

        let list_sel = selector(url, "ul.list-chapters")?;
        let Some(list) = doc.select(&list_sel).next() else {
            return Err(SyncError::extraction(url.as_str(), "no chapter list found"));
        };

        let link_sel = selector(url, "li a")?;
        for link in list.select(&link_sel) {
            let Some(href) = link.value().attr("href") else {
                continue;
            };
            let Ok(chapter_url) = url.join(href.trim()) else {
                continue;
            };
            let name = format_text(&link.text().collect::<String>());
            match page.chapters.iter_mut().find(|(n, _)| *n == name) {
                Some(existing) => existing.1 = chapter_url,
                None => page.chapters.push((name, chapter_url)),
            }
        }

        Ok(page)
    }

    fn extract_chapter(&self, url: &Url, html: &str) -> Result<ChapterPage> {
        let mut doc = Html::parse_document(html);

        let title = doc
            .select(&selector(url, "div.title-top h4")?)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty());

        let notes = extract_notes(url, &doc)?;

        let promo_sel = selector(url, "div#chapter-content p[target=\"__blank\"]")?;
        let promo_ids = doc.select(&promo_sel).map(|el| el.id()).collect::<Vec<_>>();
        for id in promo_ids {
            if let Some(mut node) = doc.tree.get_mut(id) {
                node.detach();
            }
        }

        let content_sel = selector(url, "div#chapter-content")?;
        let Some(content) = doc.select(&content_sel).next() else {
            return Err(SyncError::extraction(url.as_str(), "no chapter content found"));
        };

        let img_sel = selector(url, "img")?;
        let images = content
            .select(&img_sel)
            .enumerate()
            .filter_map(|(position, img)| {
                img.value().attr("src").map(|src| ImageRef {
                    position,
                    src: src.to_string(),
                })
            })
            .collect();

        Ok(ChapterPage {
            title,
            body_html: content.html(),
            images,
            notes,
        })
    }
}

fn extract_author(url: &Url, info: ElementRef<'_>) -> Result<Option<String>> {
    let item_sel = selector(url, "div.info-item")?;
    let link_sel = selector(url, "a")?;
    let items = info.select(&item_sel).take(2).collect::<Vec<_>>();
    for item in items {
        if let Some(link) = item.select(&link_sel).next() {
            return Ok(Some(format_text(&link.text().collect::<String>())));
        }
    }
    Ok(None)
}

fn extract_notes(url: &Url, doc: &Html) -> Result<Vec<(String, String)>> {
    let note_sel = selector(url, "div[id^=\"note\"]")?;
    let content_sel = selector(url, "span.note-content_real")?;
    let mut notes = Vec::new();
    for div in doc.select(&note_sel) {
        let Some(id) = div.value().attr("id") else {
            continue;
        };
        let Some(content) = div.select(&content_sel).next() else {
            continue;
        };
        let text = content.text().collect::<String>();
        notes.push((format!("[{id}]"), format!("(Note: {text})")));
    }
    Ok(notes)
}

fn selector(url: &Url, css: &str) -> Result<Selector> {
    Selector::parse(css)
        .map_err(|err| SyncError::extraction(url.as_str(), format!("bad selector {css}: {err}")))
}

fn first_text(doc: &Html, sel: &Selector) -> Option<String> {
    doc.select(sel)
        .next()
        .map(|el| format_text(&el.text().collect::<String>()))
}

/// Trims and drops newlines, the way names are compared across runs.
pub fn format_text(text: &str) -> String {
    text.trim().replace('\n', "")
}

static BOUND_ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\s(?::|@|v-)[\w.:-]*="[^"]*""#).expect("bound attribute regex is valid")
});

/// Removes framework-bound attributes (`:href`, `@click`, `v-on:click`, `v-if`), which are not
/// valid XHTML.
pub fn strip_bound_attributes(html: &str) -> String {
    BOUND_ATTRIBUTE.replace_all(html, "").into_owned()
}

/// Pulls the URL out of `background-image: url('...')`.
fn url_in_style(style: &str) -> Option<String> {
    let start = style.find("url(")? + "url(".len();
    let rest = &style[start..];
    let end = rest.find(')')?;
    let raw = rest[..end].trim().trim_matches(|c| c == '\'' || c == '"').trim();
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}
