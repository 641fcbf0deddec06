use std::collections::BTreeMap;
use std::fs;
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use sha2::{Digest as _, Sha256};
use tracing::{debug, info};
use zip::write::SimpleFileOptions;

use crate::assemble::{Asset, ChapterBlock, IntroPage, chapter_stem};
use crate::error::{Result, SyncError};
use crate::layout;

const CONTENT_DIR: &str = "OEBPS";
const COVER_FILE: &str = "cover.jpeg";
const INTRO_FILE: &str = "intro.xhtml";

/// Entries rebuilt on every write; everything else in an existing package is preserved.
const GENERATED_ENTRIES: &[&str] = &[
    "mimetype",
    "META-INF/container.xml",
    "OEBPS/content.opf",
    "OEBPS/nav.xhtml",
    "OEBPS/toc.ncx",
    "OEBPS/style.css",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactMetadata {
    pub identifier: String,
    pub title: String,
    pub author: String,
    /// BCP-47 language tag used for package metadata and XHTML documents.
    pub lang: String,
}

impl ArtifactMetadata {
    pub fn for_volume(work_url: &str, work_name: &str, volume_name: &str, author: &str, lang: &str) -> Self {
        let lang = lang.trim();
        Self {
            identifier: volume_identifier(work_url, volume_name),
            title: format!("{volume_name} - {work_name}"),
            author: author.to_string(),
            lang: if lang.is_empty() { "und" } else { lang }.to_string(),
        }
    }
}

/// Stable across runs so readers treat an appended file as the same book.
pub fn volume_identifier(work_url: &str, volume_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(work_url.as_bytes());
    hasher.update([0]);
    hasher.update(volume_name.as_bytes());
    format!("urn:hako2epub:{}", hex::encode(hasher.finalize()))
}

/// Everything needed to write (or extend) one volume file.
#[derive(Debug, Clone)]
pub struct VolumeArtifact {
    pub metadata: ArtifactMetadata,
    /// JPEG bytes.
    pub cover: Option<Vec<u8>>,
    pub intro: Option<IntroPage>,
    pub chapters: Vec<ChapterBlock>,
}

#[async_trait]
pub trait ArtifactWriter: Send + Sync {
    /// Number to continue chapter numbering from, or `None` if `path` does not exist.
    async fn next_chapter_index(&self, path: &Path) -> Result<Option<usize>>;

    /// Writes a new artifact, replacing any file at `path`.
    async fn create(&self, path: &Path, artifact: VolumeArtifact) -> Result<()>;

    /// Adds `artifact.chapters` to the existing artifact at `path`. Cover, intro and
    /// metadata of the existing file are kept.
    async fn append(&self, path: &Path, artifact: VolumeArtifact) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EpubWriter;

#[async_trait]
impl ArtifactWriter for EpubWriter {
    async fn next_chapter_index(&self, path: &Path) -> Result<Option<usize>> {
        let path = path.to_path_buf();
        run_blocking(path.clone(), move || {
            if !path.is_file() {
                return Ok(None);
            }
            let package = ExistingPackage::read(&path)?;
            Ok(Some(package.next_chapter_index()))
        })
        .await
    }

    async fn create(&self, path: &Path, artifact: VolumeArtifact) -> Result<()> {
        let path = path.to_path_buf();
        run_blocking(path.clone(), move || create_package(&path, &artifact)).await
    }

    async fn append(&self, path: &Path, artifact: VolumeArtifact) -> Result<()> {
        let path = path.to_path_buf();
        run_blocking(path.clone(), move || append_package(&path, &artifact)).await
    }
}

async fn run_blocking<T, F>(path: PathBuf, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| SyncError::artifact_io(path, format!("writer task aborted: {err}")))?
}

#[derive(Debug, Clone)]
struct ChapterSpec {
    number: usize,
    stem: String,
    title: String,
}

#[derive(Debug)]
struct PackagePlan {
    metadata: ArtifactMetadata,
    has_cover: bool,
    has_intro: bool,
    chapters: Vec<ChapterSpec>,
    /// Content-relative paths of binary assets other than the cover.
    assets: Vec<String>,
}

fn create_package(path: &Path, artifact: &VolumeArtifact) -> Result<()> {
    let lang = artifact.metadata.lang.as_str();
    let mut files = Vec::new();

    if let Some(cover) = &artifact.cover {
        files.push((COVER_FILE.to_string(), cover.clone()));
    }
    if let Some(intro) = &artifact.intro {
        let xhtml = wrap_xhtml_document("Intro", lang, &to_xhtml_fragment(&intro.body));
        files.push((INTRO_FILE.to_string(), xhtml.into_bytes()));
    }
    let (chapters, assets) = push_chapter_files(&mut files, &artifact.chapters, lang);

    let plan = PackagePlan {
        metadata: artifact.metadata.clone(),
        has_cover: artifact.cover.is_some(),
        has_intro: artifact.intro.is_some(),
        chapters,
        assets,
    };
    write_package(path, &plan, &files)?;
    info!(path = %path.display(), chapters = plan.chapters.len(), "epub created");
    Ok(())
}

fn append_package(path: &Path, artifact: &VolumeArtifact) -> Result<()> {
    let existing = ExistingPackage::read(path)?;
    let lang = existing.lang.clone().unwrap_or_else(|| artifact.metadata.lang.clone());

    let mut metadata = artifact.metadata.clone();
    if let Some(identifier) = &existing.identifier {
        metadata.identifier = identifier.clone();
    }
    metadata.lang = lang.clone();

    let mut chapters = existing.chapters.clone();
    let mut assets = existing.assets.clone();
    let mut files = Vec::new();
    let mut replaced = Vec::new();

    let (new_chapters, new_assets) = push_chapter_files(&mut files, &artifact.chapters, &lang);
    for chapter in new_chapters {
        if let Some(pos) = chapters.iter().position(|c| c.stem == chapter.stem) {
            replaced.push(chapters.remove(pos).stem);
        }
        chapters.push(chapter);
    }
    chapters.sort_by_key(|c| c.number);
    for asset in new_assets {
        if !assets.contains(&asset) {
            assets.push(asset);
        }
    }

    let new_names = files.iter().map(|(name, _)| name.clone()).collect::<Vec<_>>();
    let mut all_files = existing
        .preserved
        .into_iter()
        .filter(|(name, _)| !new_names.contains(name))
        .collect::<Vec<_>>();
    all_files.extend(files);

    if !replaced.is_empty() {
        debug!(path = %path.display(), ?replaced, "existing chapters overwritten");
    }

    let plan = PackagePlan {
        metadata,
        has_cover: existing.has_cover,
        has_intro: existing.has_intro,
        chapters,
        assets,
    };
    write_package(path, &plan, &all_files)?;
    info!(
        path = %path.display(),
        added = artifact.chapters.len(),
        total = plan.chapters.len(),
        "epub extended"
    );
    Ok(())
}

/// Appends chapter documents and their assets to `files`; returns the entries for the
/// package documents.
fn push_chapter_files(
    files: &mut Vec<(String, Vec<u8>)>,
    chapters: &[ChapterBlock],
    lang: &str,
) -> (Vec<ChapterSpec>, Vec<String>) {
    let mut specs = Vec::with_capacity(chapters.len());
    let mut assets = Vec::new();
    for chapter in chapters {
        let stem = chapter.stem();
        let xhtml = wrap_xhtml_document(&chapter.title, lang, &to_xhtml_fragment(&chapter.body));
        files.push((format!("{stem}.xhtml"), xhtml.into_bytes()));
        for Asset { path, bytes } in &chapter.assets {
            files.push((path.clone(), bytes.clone()));
            assets.push(path.clone());
        }
        specs.push(ChapterSpec {
            number: chapter.number,
            stem,
            title: chapter.title.clone(),
        });
    }
    (specs, assets)
}

/// Writes the package to a temp file next to `path` and renames it into place.
fn write_package(path: &Path, plan: &PackagePlan, files: &[(String, Vec<u8>)]) -> Result<()> {
    layout::ensure_parent_dir(path)?;
    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));

    let result = write_zip(&tmp_path, plan, files);
    if let Err(err) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    fs::rename(&tmp_path, path)
        .map_err(|err| SyncError::artifact_io(path, format!("rename tmp to final: {err}")))
}

fn write_zip(out_path: &Path, plan: &PackagePlan, files: &[(String, Vec<u8>)]) -> Result<()> {
    let io_err = |what: &str, err: &dyn std::fmt::Display| {
        SyncError::artifact_io(out_path, format!("{what}: {err}"))
    };

    let modified = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let container_xml = render_container_xml();
    let css = default_style_css();
    let nav_xhtml = render_nav_xhtml(plan);
    let toc_ncx = render_toc_ncx(plan);
    let content_opf = render_content_opf(plan, &modified);

    let out_file = fs::File::create(out_path).map_err(|err| io_err("create epub", &err))?;
    let mut zip = zip::ZipWriter::new(out_file);

    // `mimetype` must be the first entry and must be stored uncompressed.
    let mimetype_options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .unix_permissions(0o644);
    zip.start_file("mimetype", mimetype_options)
        .map_err(|err| io_err("start mimetype", &err))?;
    zip.write_all(b"application/epub+zip")
        .map_err(|err| io_err("write mimetype", &err))?;

    let deflated_options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let documents = [
        ("META-INF/container.xml".to_string(), container_xml),
        (format!("{CONTENT_DIR}/content.opf"), content_opf),
        (format!("{CONTENT_DIR}/nav.xhtml"), nav_xhtml),
        (format!("{CONTENT_DIR}/toc.ncx"), toc_ncx),
        (format!("{CONTENT_DIR}/style.css"), css),
    ];
    for (name, body) in &documents {
        zip.start_file(name.as_str(), deflated_options)
            .map_err(|err| io_err(&format!("start {name}"), &err))?;
        zip.write_all(body.as_bytes())
            .map_err(|err| io_err(&format!("write {name}"), &err))?;
    }

    for (rel, bytes) in files {
        let name = format!("{CONTENT_DIR}/{rel}");
        zip.start_file(name.as_str(), deflated_options)
            .map_err(|err| io_err(&format!("start {name}"), &err))?;
        zip.write_all(bytes)
            .map_err(|err| io_err(&format!("write {name}"), &err))?;
    }

    zip.finish().map_err(|err| io_err("finish zip", &err))?;
    Ok(())
}

/// What an existing package already contains.
#[derive(Debug, Default)]
struct ExistingPackage {
    identifier: Option<String>,
    lang: Option<String>,
    has_cover: bool,
    has_intro: bool,
    chapters: Vec<ChapterSpec>,
    assets: Vec<String>,
    /// Content-relative entries carried over unchanged, in archive order.
    preserved: Vec<(String, Vec<u8>)>,
}

static CHAPTER_ENTRY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^chap_(\d+)\.xhtml$").expect("chapter entry regex is valid"));
static TITLE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<title>(.*?)</title>").expect("title regex is valid"));
static IDENTIFIER_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<dc:identifier[^>]*>([^<]*)</dc:identifier>").expect("identifier regex is valid")
});
static LANGUAGE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<dc:language>([^<]*)</dc:language>").expect("language regex is valid")
});

impl ExistingPackage {
    fn read(path: &Path) -> Result<Self> {
        let io_err = |what: &str, err: &dyn std::fmt::Display| {
            SyncError::artifact_io(path, format!("{what}: {err}"))
        };

        let file = fs::File::open(path).map_err(|err| io_err("open epub", &err))?;
        let mut archive = zip::ZipArchive::new(file).map_err(|err| io_err("read epub", &err))?;

        let mut package = ExistingPackage::default();
        let mut numbered = BTreeMap::new();
        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|err| io_err("read epub entry", &err))?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            let mut bytes = Vec::new();
            entry
                .read_to_end(&mut bytes)
                .map_err(|err| io_err(&format!("read {name}"), &err))?;

            if name == "OEBPS/content.opf" {
                let opf = String::from_utf8_lossy(&bytes);
                package.identifier = IDENTIFIER_TAG
                    .captures(&opf)
                    .map(|caps| xml_unescape(caps[1].trim()));
                package.lang = LANGUAGE_TAG
                    .captures(&opf)
                    .map(|caps| xml_unescape(caps[1].trim()))
                    .filter(|lang| !lang.is_empty());
                continue;
            }
            if GENERATED_ENTRIES.contains(&name.as_str()) {
                continue;
            }
            let Some(rel) = name.strip_prefix("OEBPS/").map(str::to_string) else {
                continue;
            };

            if let Some(caps) = CHAPTER_ENTRY.captures(&rel) {
                let number = caps[1].parse::<usize>().unwrap_or(0);
                let stem = chapter_stem(number);
                let title = TITLE_TAG
                    .captures(&String::from_utf8_lossy(&bytes))
                    .map(|caps| xml_unescape(caps[1].trim()))
                    .unwrap_or_else(|| stem.clone());
                numbered.insert(number, ChapterSpec { number, stem, title });
            } else if rel == COVER_FILE {
                package.has_cover = true;
            } else if rel == INTRO_FILE {
                package.has_intro = true;
            } else if !rel.ends_with(".xhtml") {
                package.assets.push(rel.clone());
            }
            package.preserved.push((rel, bytes));
        }
        package.chapters = numbered.into_values().collect();
        Ok(package)
    }

    /// Chapter count, or the highest chapter number if numbering has gaps, so
    /// appended chapters never overwrite existing ones.
    fn next_chapter_index(&self) -> usize {
        let highest = self.chapters.iter().map(|c| c.number).max().unwrap_or(0);
        highest.max(self.chapters.len())
    }
}

fn render_container_xml() -> String {
    r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#
    .to_string()
}

fn default_style_css() -> String {
    r#"@charset "utf-8";

html { font-family: serif; }
body { margin: 0; padding: 0 1.2em; line-height: 1.6; }
img { display: block; margin-left: auto; margin-right: auto; max-width: 100%; height: auto; }
h4.chapter-title { text-align: center; }
.intro { text-align: center; }
.intro h1, .intro h3 { text-align: center; }
"#
    .to_string()
}

fn render_nav_xhtml(plan: &PackagePlan) -> String {
    let title = plan.metadata.title.as_str();
    let lang = plan.metadata.lang.as_str();
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<!DOCTYPE html>\n");
    out.push_str(&format!(
        "<html xmlns=\"http://www.w3.org/1999/xhtml\" xmlns:epub=\"http://www.idpf.org/2007/ops\" lang=\"{}\" xml:lang=\"{}\">\n",
        xml_escape(lang),
        xml_escape(lang)
    ));
    out.push_str("<head>\n");
    out.push_str(&format!("  <title>{}</title>\n", xml_escape(title)));
    out.push_str("  <meta charset=\"utf-8\" />\n");
    out.push_str("  <link rel=\"stylesheet\" type=\"text/css\" href=\"style.css\" />\n");
    out.push_str("</head>\n");
    out.push_str("<body>\n");
    out.push_str(&format!("  <h1>{}</h1>\n", xml_escape(title)));
    out.push_str("  <nav epub:type=\"toc\" id=\"toc\">\n");
    out.push_str("    <ol>\n");
    if plan.has_intro {
        out.push_str(&format!("      <li><a href=\"{INTRO_FILE}\">Intro</a></li>\n"));
    }
    for ch in &plan.chapters {
        out.push_str(&format!(
            "      <li><a href=\"{}.xhtml\">{}</a></li>\n",
            xml_escape(&ch.stem),
            xml_escape(&ch.title)
        ));
    }
    out.push_str("    </ol>\n");
    out.push_str("  </nav>\n");
    out.push_str("</body>\n");
    out.push_str("</html>\n");
    out
}

fn render_toc_ncx(plan: &PackagePlan) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str(
        "<!DOCTYPE ncx PUBLIC \"-//NISO//DTD ncx 2005-1//EN\" \"http://www.daisy.org/z3986/2005/ncx-2005-1.dtd\">\n",
    );
    out.push_str("<ncx xmlns=\"http://www.daisy.org/z3986/2005/ncx/\" version=\"2005-1\">\n");
    out.push_str("  <head>\n");
    out.push_str(&format!(
        "    <meta name=\"dtb:uid\" content=\"{}\" />\n",
        xml_escape(&plan.metadata.identifier)
    ));
    out.push_str("    <meta name=\"dtb:depth\" content=\"1\" />\n");
    out.push_str("    <meta name=\"dtb:totalPageCount\" content=\"0\" />\n");
    out.push_str("    <meta name=\"dtb:maxPageNumber\" content=\"0\" />\n");
    out.push_str("  </head>\n");
    out.push_str("  <docTitle><text>");
    out.push_str(&xml_escape(&plan.metadata.title));
    out.push_str("</text></docTitle>\n");
    out.push_str("  <navMap>\n");

    let mut points = Vec::new();
    if plan.has_intro {
        points.push(("Intro".to_string(), INTRO_FILE.to_string()));
    }
    points.extend(
        plan.chapters
            .iter()
            .map(|ch| (ch.title.clone(), format!("{}.xhtml", ch.stem))),
    );
    for (idx, (label, href)) in points.iter().enumerate() {
        let play = idx + 1;
        out.push_str(&format!(
            "    <navPoint id=\"navPoint-{play}\" playOrder=\"{play}\">\n"
        ));
        out.push_str("      <navLabel><text>");
        out.push_str(&xml_escape(label));
        out.push_str("</text></navLabel>\n");
        out.push_str(&format!("      <content src=\"{}\" />\n", xml_escape(href)));
        out.push_str("    </navPoint>\n");
    }
    out.push_str("  </navMap>\n");
    out.push_str("</ncx>\n");
    out
}

fn render_content_opf(plan: &PackagePlan, modified: &str) -> String {
    let meta = &plan.metadata;
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str(&format!(
        "<package xmlns=\"http://www.idpf.org/2007/opf\" unique-identifier=\"bookid\" version=\"3.0\" xml:lang=\"{}\">\n",
        xml_escape(&meta.lang)
    ));
    out.push_str("  <metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\">\n");
    out.push_str(&format!(
        "    <dc:identifier id=\"bookid\">{}</dc:identifier>\n",
        xml_escape(&meta.identifier)
    ));
    out.push_str(&format!("    <dc:title>{}</dc:title>\n", xml_escape(&meta.title)));
    if !meta.author.is_empty() {
        out.push_str(&format!(
            "    <dc:creator>{}</dc:creator>\n",
            xml_escape(&meta.author)
        ));
    }
    out.push_str(&format!(
        "    <dc:language>{}</dc:language>\n",
        xml_escape(&meta.lang)
    ));
    out.push_str(&format!(
        "    <meta property=\"dcterms:modified\">{}</meta>\n",
        xml_escape(modified)
    ));
    if plan.has_cover {
        out.push_str("    <meta name=\"cover\" content=\"cover-image\" />\n");
    }
    out.push_str("  </metadata>\n");
    out.push_str("  <manifest>\n");
    out.push_str(
        "    <item id=\"nav\" href=\"nav.xhtml\" media-type=\"application/xhtml+xml\" properties=\"nav\" />\n",
    );
    out.push_str(
        "    <item id=\"ncx\" href=\"toc.ncx\" media-type=\"application/x-dtbncx+xml\" />\n",
    );
    out.push_str("    <item id=\"css\" href=\"style.css\" media-type=\"text/css\" />\n");
    if plan.has_cover {
        out.push_str(&format!(
            "    <item id=\"cover-image\" href=\"{COVER_FILE}\" media-type=\"image/jpeg\" properties=\"cover-image\" />\n"
        ));
    }
    if plan.has_intro {
        out.push_str(&format!(
            "    <item id=\"intro\" href=\"{INTRO_FILE}\" media-type=\"application/xhtml+xml\" />\n"
        ));
    }

    for ch in &plan.chapters {
        out.push_str(&format!(
            "    <item id=\"{}\" href=\"{}.xhtml\" media-type=\"application/xhtml+xml\" />\n",
            xml_escape(&ch.stem),
            xml_escape(&ch.stem)
        ));
    }

    for (idx, asset) in plan.assets.iter().enumerate() {
        out.push_str(&format!(
            "    <item id=\"asset-{}\" href=\"{}\" media-type=\"{}\" />\n",
            idx + 1,
            xml_escape(asset),
            xml_escape(media_type_for_asset(asset))
        ));
    }

    out.push_str("  </manifest>\n");
    out.push_str("  <spine toc=\"ncx\">\n");
    if plan.has_intro {
        out.push_str("    <itemref idref=\"intro\" />\n");
    }
    out.push_str("    <itemref idref=\"nav\" />\n");
    for ch in &plan.chapters {
        out.push_str(&format!(
            "    <itemref idref=\"{}\" />\n",
            xml_escape(&ch.stem)
        ));
    }
    out.push_str("  </spine>\n");
    out.push_str("</package>\n");
    out
}

fn media_type_for_asset(rel_path: &str) -> &'static str {
    let ext = Path::new(rel_path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "css" => "text/css",
        _ => "application/octet-stream",
    }
}

fn wrap_xhtml_document(title: &str, lang: &str, body_html: &str) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<!DOCTYPE html>\n");
    out.push_str(&format!(
        "<html xmlns=\"http://www.w3.org/1999/xhtml\" lang=\"{}\" xml:lang=\"{}\">\n",
        xml_escape(lang),
        xml_escape(lang)
    ));
    out.push_str("<head>\n");
    out.push_str(&format!("  <title>{}</title>\n", xml_escape(title)));
    out.push_str("  <meta charset=\"utf-8\" />\n");
    out.push_str("  <link rel=\"stylesheet\" type=\"text/css\" href=\"style.css\" />\n");
    out.push_str("</head>\n");
    out.push_str("<body>\n");
    out.push_str(body_html);
    if !body_html.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("</body>\n");
    out.push_str("</html>\n");
    out
}

/// Serialized HTML to something an XML parser accepts.
fn to_xhtml_fragment(html: &str) -> String {
    ensure_xhtml_void_tags(&html.replace("&nbsp;", "&#160;"))
}

fn ensure_xhtml_void_tags(html: &str) -> String {
    // `<img ...>` becomes `<img ... />`.
    const VOID_TAGS: &[&str] = &[
        "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
        "source", "track", "wbr",
    ];

    let bytes = html.as_bytes();
    let mut out = String::with_capacity(html.len());
    let mut cursor = 0;

    while let Some(rel_lt) = html[cursor..].find('<') {
        let lt = cursor + rel_lt;
        out.push_str(&html[cursor..lt]);

        // End of tag, skipping quoted attribute values.
        let mut in_quote: Option<u8> = None;
        let mut gt = lt + 1;
        while gt < bytes.len() {
            let b = bytes[gt];
            if let Some(q) = in_quote {
                if b == q {
                    in_quote = None;
                }
                gt += 1;
                continue;
            }
            if b == b'"' || b == b'\'' {
                in_quote = Some(b);
                gt += 1;
                continue;
            }
            if b == b'>' {
                break;
            }
            gt += 1;
        }
        if gt >= bytes.len() {
            out.push_str(&html[lt..]);
            return out;
        }

        let raw_tag = &html[lt..=gt];
        if raw_tag
            .as_bytes()
            .get(1)
            .is_some_and(|b| matches!(b, b'!' | b'?' | b'/'))
        {
            out.push_str(raw_tag);
            cursor = gt + 1;
            continue;
        }

        let name_start = lt + 1;
        let mut name_end = name_start;
        while name_end < gt && (bytes[name_end] as char).is_ascii_alphabetic() {
            name_end += 1;
        }
        let tag_name = html[name_start..name_end].to_ascii_lowercase();
        if name_end == name_start || !VOID_TAGS.contains(&tag_name.as_str()) {
            out.push_str(raw_tag);
            cursor = gt + 1;
            continue;
        }

        let tag_without_gt = &html[lt..gt];
        if tag_without_gt.trim_end().ends_with('/') {
            out.push_str(raw_tag);
        } else {
            out.push_str(tag_without_gt);
            out.push_str(" />");
        }
        cursor = gt + 1;
    }

    out.push_str(&html[cursor..]);
    out
}

pub(crate) fn xml_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn xml_unescape(input: &str) -> String {
    input
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chapter(number: usize, title: &str, with_image: bool) -> ChapterBlock {
        let mut assets = Vec::new();
        let mut body = format!("<h4 class=\"chapter-title\">{title}</h4>\n<p>text&nbsp;{number}<br></p>");
        if with_image {
            let path = format!("images/chapter_{number}/image_0.jpeg");
            body.push_str(&format!("<img src=\"{path}\">"));
            assets.push(Asset {
                path,
                bytes: vec![0xFF, 0xD8, 0xFF],
            });
        }
        ChapterBlock {
            index: number - 1,
            number,
            name: format!("C{number}"),
            title: title.to_string(),
            body,
            assets,
            image_failures: Vec::new(),
        }
    }

    fn artifact(chapters: Vec<ChapterBlock>) -> VolumeArtifact {
        VolumeArtifact {
            metadata: ArtifactMetadata::for_volume(
                "https://ln.hako.vn/truyen/1",
                "Novel",
                "Vol 1",
                "Author",
                "vi",
            ),
            cover: Some(vec![0xFF, 0xD8, 0xFF]),
            intro: Some(IntroPage {
                body: "<div class=\"intro\"><h1>Novel</h1></div>".to_string(),
            }),
            chapters,
        }
    }

    fn read_entries(path: &Path) -> BTreeMap<String, String> {
        let file = fs::File::open(path).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        let mut out = BTreeMap::new();
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).unwrap();
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).unwrap();
            out.insert(
                entry.name().to_string(),
                String::from_utf8_lossy(&bytes).into_owned(),
            );
        }
        out
    }

    fn first_entry_name(path: &Path) -> String {
        let file = fs::File::open(path).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        let entry = archive.by_index(0).unwrap();
        entry.name().to_string()
    }

    #[test]
    fn ensure_xhtml_void_tags_preserves_utf8_text() {
        let input = "<p>Tiếng Việt</p><img src=\"x.png\">";
        let out = ensure_xhtml_void_tags(input);
        assert!(out.contains("Tiếng Việt"));
        assert!(out.contains("<img src=\"x.png\" />"));
    }

    #[test]
    fn identifier_is_stable_per_volume() {
        let a = volume_identifier("https://ln.hako.vn/truyen/1", "Vol 1");
        assert_eq!(a, volume_identifier("https://ln.hako.vn/truyen/1", "Vol 1"));
        assert_ne!(a, volume_identifier("https://ln.hako.vn/truyen/1", "Vol 2"));
    }

    #[tokio::test]
    async fn create_writes_a_complete_package() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Novel/Vol-1-Novel.epub");
        let writer = EpubWriter;

        assert_eq!(writer.next_chapter_index(&path).await.unwrap(), None);
        writer
            .create(&path, artifact(vec![chapter(1, "One", true), chapter(2, "Two", false)]))
            .await
            .unwrap();

        assert_eq!(first_entry_name(&path), "mimetype");
        let entries = read_entries(&path);
        assert_eq!(entries["mimetype"], "application/epub+zip");
        assert!(entries.contains_key("OEBPS/cover.jpeg"));
        assert!(entries.contains_key("OEBPS/intro.xhtml"));
        assert!(entries.contains_key("OEBPS/images/chapter_1/image_0.jpeg"));

        let chap1 = &entries["OEBPS/chap_1.xhtml"];
        assert!(chap1.contains("<title>One</title>"));
        assert!(chap1.contains("text&#160;1<br />"));
        assert!(chap1.contains("<img src=\"images/chapter_1/image_0.jpeg\" />"));

        let opf = &entries["OEBPS/content.opf"];
        assert!(opf.contains("<dc:creator>Author</dc:creator>"));
        assert!(opf.contains("href=\"images/chapter_1/image_0.jpeg\" media-type=\"image/jpeg\""));
        assert!(opf.contains("properties=\"cover-image\""));

        assert_eq!(writer.next_chapter_index(&path).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn append_keeps_existing_content_and_extends_the_toc() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Vol-1-Novel.epub");
        let writer = EpubWriter;
        writer
            .create(&path, artifact(vec![chapter(1, "One", true), chapter(2, "Two", false)]))
            .await
            .unwrap();
        let before = read_entries(&path);

        let mut extra = artifact(vec![chapter(3, "Three & more", true)]);
        extra.cover = None;
        extra.intro = None;
        extra.metadata.identifier = "something-else".to_string();
        writer.append(&path, extra).await.unwrap();

        assert_eq!(first_entry_name(&path), "mimetype");
        let after = read_entries(&path);
        assert_eq!(after["OEBPS/chap_1.xhtml"], before["OEBPS/chap_1.xhtml"]);
        assert_eq!(after["OEBPS/intro.xhtml"], before["OEBPS/intro.xhtml"]);
        assert!(after.contains_key("OEBPS/cover.jpeg"));
        assert!(after.contains_key("OEBPS/images/chapter_1/image_0.jpeg"));
        assert!(after.contains_key("OEBPS/images/chapter_3/image_0.jpeg"));

        let nav = &after["OEBPS/nav.xhtml"];
        let one = nav.find(">One<").unwrap();
        let two = nav.find(">Two<").unwrap();
        let three = nav.find(">Three &amp; more<").unwrap();
        assert!(one < two && two < three);

        let opf = &after["OEBPS/content.opf"];
        assert!(opf.contains("urn:hako2epub:"));
        assert!(!opf.contains("something-else"));
        assert!(opf.contains("idref=\"chap_3\""));
        assert!(opf.contains("properties=\"cover-image\""));

        assert_eq!(writer.next_chapter_index(&path).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn append_to_garbage_is_an_artifact_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.epub");
        fs::write(&path, b"not a zip").unwrap();

        let err = EpubWriter
            .append(&path, artifact(vec![chapter(1, "One", false)]))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ArtifactIo { .. }));
        assert_eq!(fs::read(&path).unwrap(), b"not a zip");
    }
}
