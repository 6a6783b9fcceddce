pub mod fs;

use std::path::Path;

/// Content type used when serving an artifact inline.
pub fn mimetype_for(filename: &str) -> String {
    mime_guess::from_path(filename)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Reduces a script-chosen path to a safe single file name.
pub fn sanitize_filename(name: &str) -> Option<String> {
    let base = Path::new(name).file_name()?.to_str()?;
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        return None;
    }
    Some(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mimetype_for() {
        assert_eq!(mimetype_for("document.pdf"), "application/pdf");
        assert_eq!(mimetype_for("example-chromium.png"), "image/png");
        assert_eq!(mimetype_for("shot.jpeg"), "image/jpeg");
        assert_eq!(mimetype_for("blob"), "application/octet-stream");
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("shot.png").as_deref(), Some("shot.png"));
        assert_eq!(sanitize_filename("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_filename("my shot?.png").as_deref(), Some("my_shot_.png"));
        assert_eq!(sanitize_filename("nested/dir/page.pdf").as_deref(), Some("page.pdf"));
        assert_eq!(sanitize_filename(".."), None);
        assert_eq!(sanitize_filename(""), None);
    }
}
