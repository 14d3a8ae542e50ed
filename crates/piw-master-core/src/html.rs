//! A minimal HTML index builder, matching the "simple" package-repository
//! convention, plus the atomic write-temp-then-rename discipline shared by
//! every index write.

use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::db::FileRecord;

/// Escape the five HTML-significant characters in `s`.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Render the root index: one anchor per known package.
pub fn render_root(packages: &[String]) -> String {
    let mut body = String::new();
    for package in packages {
        let escaped = escape(package);
        body.push_str(&format!("<a href=\"{escaped}\">{escaped}</a><br/>\n"));
    }
    html_document("piwheels", &format!("<meta name=\"api-version\" content=\"2\">\n"), &body)
}

/// Render a single package's index: one anchor per committed artifact.
pub fn render_package(package: &str, files: &[FileRecord]) -> String {
    let mut body = format!("<h1>{}</h1>\n", escape(package));
    for file in files {
        let name = escape(&file.filename);
        let hash = escape(&file.filehash);
        body.push_str(&format!(
            "<a href=\"{name}#sha256={hash}\" rel=\"internal\">{name}</a><br/>\n"
        ));
    }
    html_document(package, "", &body)
}

fn html_document(title: &str, head_extra: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<title>{}</title>\n{}</head>\n<body>\n{}</body>\n</html>\n",
        escape(title),
        head_extra,
        body
    )
}

/// Write `content` to `dir/filename`, atomically: a temporary file is
/// created in `dir`, written fully, flushed, chmod'd to `0644`, then renamed
/// into place. Readers never observe a partial file.
pub fn write_atomic(dir: &Path, filename: &str, content: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.flush()?;
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o644))?;
    tmp.persist(dir.join(filename))
        .map_err(|err| err.error)?;
    Ok(())
}
