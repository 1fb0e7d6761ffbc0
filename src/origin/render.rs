//! HTML renderers for the static origin.
//!
//! These are pure `manifest → bytes` functions; the origin treats them as
//! opaque. One template each for the explorer listing, the zip index, and
//! the markdown preview.

use pulldown_cmark::{html, Options, Parser};

use crate::workspace::manifest::ManifestEntry;

const PAGE_STYLE: &str = "\
body{font-family:system-ui,sans-serif;margin:2rem auto;max-width:52rem;padding:0 1rem;color:#1a1a1a}\
h1{font-size:1.3rem}table{border-collapse:collapse;width:100%}\
td,th{text-align:left;padding:.35rem .75rem;border-bottom:1px solid #e2e2e2}\
td.num{text-align:right;font-variant-numeric:tabular-nums}\
a{color:#0550ae;text-decoration:none}a:hover{text-decoration:underline}\
.meta{color:#6a6a6a;font-size:.85rem}";

/// Render the file-explorer listing.
pub fn explorer_page(manifest: &[ManifestEntry]) -> String {
    let mut rows = String::new();
    for entry in manifest {
        rows.push_str(&format!(
            "<tr><td><a href=\"{url}\">{name}</a></td><td class=\"num\">{size}</td><td class=\"meta\">{modified}</td></tr>\n",
            url = entry.relative_url,
            name = html_escape(&entry.name),
            size = human_size(entry.size),
            modified = html_escape(&entry.modified_at),
        ));
    }
    format!(
        "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>shared files</title>\
<style>{PAGE_STYLE}</style></head><body>\n<h1>Shared files</h1>\n\
<table><tr><th>Name</th><th>Size</th><th>Modified</th></tr>\n{rows}</table>\n\
<p class=\"meta\">{count} file(s)</p>\n</body></html>\n",
        count = manifest.len(),
    )
}

/// Render the zip-mode index page referencing the bundle.
pub fn zip_index_page(files: &[ManifestEntry], bundle: &ManifestEntry) -> String {
    let mut items = String::new();
    for entry in files {
        items.push_str(&format!(
            "<li>{} <span class=\"meta\">({})</span></li>\n",
            html_escape(&entry.name),
            human_size(entry.size)
        ));
    }
    format!(
        "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>download</title>\
<style>{PAGE_STYLE}</style></head><body>\n<h1>Download bundle</h1>\n\
<p><a href=\"{url}\">download.zip</a> <span class=\"meta\">({size})</span></p>\n\
<p class=\"meta\">Contains:</p>\n<ul>\n{items}</ul>\n</body></html>\n",
        url = bundle.relative_url,
        size = human_size(bundle.size),
    )
}

/// Render a markdown file as an HTML page, stripping any leading YAML
/// front-matter block.
pub fn markdown_page(title: &str, source: &str) -> String {
    let body_source = strip_front_matter(source);
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    let parser = Parser::new_ext(body_source, options);
    let mut rendered = String::with_capacity(body_source.len() * 2);
    html::push_html(&mut rendered, parser);

    format!(
        "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>{title}</title>\
<style>{PAGE_STYLE}</style></head><body>\n{rendered}</body></html>\n",
        title = html_escape(title),
    )
}

/// Drop a leading `---` … `---` YAML block, if present.
fn strip_front_matter(source: &str) -> &str {
    let rest = source.strip_prefix("---").map(|r| r.trim_start_matches('\r'));
    let Some(rest) = rest.and_then(|r| r.strip_prefix('\n')) else {
        return source;
    };
    for terminator in ["\n---\n", "\n---\r\n"] {
        if let Some(idx) = rest.find(terminator) {
            return &rest[idx + terminator.len()..];
        }
    }
    if let Some(stripped) = rest.strip_suffix("\n---") {
        // Front matter with no body.
        let _ = stripped;
        return "";
    }
    source
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
