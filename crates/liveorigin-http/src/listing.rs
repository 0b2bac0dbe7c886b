//! Directory listing rendered as a small HTML page.

use std::fmt::Write as _;

/// One row of a listing.
#[derive(Debug, Clone)]
pub struct ListingEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Render the listing of `url_path`. Entries are sorted with directories
/// first, then by name.
pub fn render(url_path: &str, mut entries: Vec<ListingEntry>) -> String {
    entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));

    let base = if url_path.ends_with('/') {
        url_path.to_owned()
    } else {
        format!("{url_path}/")
    };
    let title = escape(&base);

    let mut html = String::new();
    let _ = write!(
        html,
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Index of {title}</title></head>\n<body><h1>Index of {title}</h1>\n<ul>\n"
    );
    if base != "/" {
        html.push_str("<li><a href=\"../\">../</a></li>\n");
    }
    for entry in &entries {
        let suffix = if entry.is_dir { "/" } else { "" };
        let name = escape(&entry.name);
        if entry.is_dir {
            let _ = writeln!(html, "<li><a href=\"{name}{suffix}\">{name}{suffix}</a></li>");
        } else {
            let _ = writeln!(
                html,
                "<li><a href=\"{name}\">{name}</a> ({} bytes)</li>",
                entry.size
            );
        }
    }
    html.push_str("</ul>\n</body></html>\n");
    html
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
