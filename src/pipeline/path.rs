//! Storage layout for downloaded files.
//!
//! Every file lands under the download root at a path derived from its
//! record's track id, its role and its position in the record:
//!
//! | role               | path                                                    |
//! |--------------------|---------------------------------------------------------|
//! | main               | `main_file/{track_id}{ext}`                             |
//! | supplementary      | `SI_file/{track_id}/sup_{index}{ext}`                   |
//! | peer review        | `PR_file/{track_id}/pr_{index}{ext}`                    |
//! | comment attachment | `PR_file/{track_id}/comment_{c}_attach_{index}{ext}`    |
//! | image              | `images/{track_id}/{sha256(url)}{ext}`                  |
//! | other              | `other/{track_id}/{url basename or file_{index}{ext}}`  |
//!
//! Track ids are percent-encoded (see [`encode_track_id`]) so two distinct ids
//! never share a directory or file name.

use url::Url;

use super::checksum::sha256_hex;
use super::classify::{FileDownloadRequest, FileRole};

/// Extension used when neither the URL nor the Content-Type gives one.
pub const FALLBACK_EXTENSION: &str = ".bin";

/// Extension assumed for images whose URL has none.
pub const IMAGE_FALLBACK_EXTENSION: &str = ".jpg";

/// Content-Type substrings and the extension they map to, checked in order.
const CONTENT_TYPE_EXTENSIONS: &[(&str, &str)] = &[
    ("application/pdf", ".pdf"),
    ("application/msword", ".doc"),
    (
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        ".docx",
    ),
    ("application/vnd.ms-excel", ".xls"),
    (
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        ".xlsx",
    ),
    ("text/plain", ".txt"),
    ("text/csv", ".csv"),
    ("application/zip", ".zip"),
    ("application/x-gzip", ".gz"),
    ("application/gzip", ".gz"),
];

/// Builds the relative storage path for a file.
///
/// `ext` includes its leading dot.
///
/// Image and other files are named after their URL, which this function does
/// not see. For those two roles it returns the positional name
/// (`images/{track_id}/image_{index}{ext}`, `other/{track_id}/file_{index}{ext}`)
/// that is only used when the URL yields nothing better. Files fetched by the
/// pipeline are always placed by [`FileDownloadRequest::relative_path`].
#[must_use]
pub fn compute_path(
    track_id: &str,
    role: FileRole,
    index: usize,
    comment_index: Option<usize>,
    ext: &str,
) -> String {
    let track = encode_track_id(track_id);
    match role {
        FileRole::Main => format!("main_file/{track}{ext}"),
        FileRole::Supplementary => format!("SI_file/{track}/sup_{index}{ext}"),
        FileRole::PeerReview => format!("PR_file/{track}/pr_{index}{ext}"),
        FileRole::CommentAttachment => {
            let comment = comment_index.unwrap_or(0);
            format!("PR_file/{track}/comment_{comment}_attach_{index}{ext}")
        }
        FileRole::Image => format!("images/{track}/image_{index}{ext}"),
        FileRole::Other => format!("other/{track}/file_{index}{ext}"),
    }
}

impl FileDownloadRequest {
    /// Extension for this file given the response Content-Type.
    ///
    /// Images only look at the URL and default to `.jpg`; every other role
    /// goes through [`resolve_extension`].
    #[must_use]
    pub fn extension(&self, content_type: Option<&str>) -> String {
        match self.role {
            FileRole::Image => extension_from_url(&self.url)
                .unwrap_or_else(|| IMAGE_FALLBACK_EXTENSION.to_string()),
            _ => resolve_extension(&self.url, content_type),
        }
    }

    /// Relative storage path for this file.
    #[must_use]
    pub fn relative_path(&self, ext: &str) -> String {
        match self.role {
            FileRole::Image => format!(
                "images/{}/{}{ext}",
                encode_track_id(&self.track_id),
                sha256_hex(self.url.as_bytes())
            ),
            FileRole::Other => match url_basename(&self.url) {
                Some(name) => format!("other/{}/{name}", encode_track_id(&self.track_id)),
                None => compute_path(&self.track_id, self.role, self.index, None, ext),
            },
            _ => compute_path(
                &self.track_id,
                self.role,
                self.index,
                self.comment_index,
                ext,
            ),
        }
    }
}

/// Picks a file extension: URL path first, then Content-Type, then `.bin`.
///
/// # Examples
///
/// ```
/// use harvester_core::pipeline::resolve_extension;
///
/// assert_eq!(resolve_extension("https://a.org/Paper.PDF", None), ".pdf");
/// assert_eq!(resolve_extension("https://a.org/download?id=7", Some("application/pdf")), ".pdf");
/// assert_eq!(resolve_extension("https://a.org/download", Some("image/webp")), ".bin");
/// ```
#[must_use]
pub fn resolve_extension(url: &str, content_type: Option<&str>) -> String {
    if let Some(ext) = extension_from_url(url) {
        return ext;
    }
    content_type
        .and_then(extension_from_content_type)
        .unwrap_or(FALLBACK_EXTENSION)
        .to_string()
}

/// Lower-cased extension of the URL's last path segment, including the dot.
pub(crate) fn extension_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last_segment = parsed.path_segments()?.next_back()?;
    let dot_index = last_segment.rfind('.')?;
    let ext = &last_segment[dot_index..];
    if ext.len() <= 1 || ext.len() > 12 {
        return None;
    }
    Some(ext.to_lowercase())
}

/// Maps a Content-Type header to an extension by substring match.
pub(crate) fn extension_from_content_type(content_type: &str) -> Option<&'static str> {
    let content_type = content_type.to_lowercase();
    CONTENT_TYPE_EXTENSIONS
        .iter()
        .find(|(mime, _)| content_type.contains(mime))
        .map(|(_, ext)| *ext)
}

/// Percent-decoded, sanitized last path segment of a URL.
fn url_basename(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    if last.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(last).map_or_else(|_| last.to_string(), |d| d.into_owned());
    let name = sanitize_path_segment(&decoded);
    (!name.trim_matches('_').is_empty()).then_some(name)
}

/// Encodes a track id as one directory or file name segment.
///
/// Everything outside `A-Z a-z 0-9 - _ . ~` is percent-encoded, so the mapping
/// is injective and never yields a separator. Dot-only ids have their dots
/// encoded too, and the empty id becomes `%`, which no other id produces.
///
/// # Examples
///
/// ```
/// use harvester_core::pipeline::encode_track_id;
///
/// assert_eq!(encode_track_id("NHLBI-42"), "NHLBI-42");
/// assert_eq!(encode_track_id("10.1/x"), "10.1%2Fx");
/// assert_eq!(encode_track_id("10.1_x"), "10.1_x");
/// ```
#[must_use]
pub fn encode_track_id(track_id: &str) -> String {
    if track_id.is_empty() {
        return "%".to_string();
    }
    if track_id.chars().all(|c| c == '.') {
        return track_id.replace('.', "%2E");
    }
    urlencoding::encode(track_id).into_owned()
}

/// Makes a string safe to use as a single path segment.
///
/// Separators and characters invalid on common filesystems become `_`, and
/// dot-only segments (`.`, `..`) are rewritten so a segment can never climb
/// out of its parent directory.
pub(crate) fn sanitize_path_segment(value: &str) -> String {
    let sanitized: String = value
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }
    if sanitized.chars().all(|c| c == '.') {
        return sanitized.replace('.', "_");
    }
    sanitized
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn request(role: FileRole, url: &str, index: usize) -> FileDownloadRequest {
        FileDownloadRequest {
            url: url.to_string(),
            track_id: "BL-0042".to_string(),
            role,
            index,
            comment_index: None,
            metadata: None,
        }
    }

    // ==================== compute_path Tests ====================

    #[test]
    fn test_compute_path_table() {
        assert_eq!(
            compute_path("T1", FileRole::Main, 0, None, ".pdf"),
            "main_file/T1.pdf"
        );
        assert_eq!(
            compute_path("T1", FileRole::Supplementary, 2, None, ".xlsx"),
            "SI_file/T1/sup_2.xlsx"
        );
        assert_eq!(
            compute_path("T1", FileRole::PeerReview, 1, None, ".docx"),
            "PR_file/T1/pr_1.docx"
        );
        assert_eq!(
            compute_path("T1", FileRole::CommentAttachment, 3, Some(2), ".pdf"),
            "PR_file/T1/comment_2_attach_3.pdf"
        );
        assert_eq!(
            compute_path("T1", FileRole::Other, 4, None, ".bin"),
            "other/T1/file_4.bin"
        );
    }

    #[test]
    fn test_compute_path_encodes_track_id() {
        assert_eq!(
            compute_path("../etc", FileRole::Main, 0, None, ".pdf"),
            "main_file/..%2Fetc.pdf"
        );
        assert_eq!(
            compute_path("..", FileRole::Supplementary, 1, None, ".pdf"),
            "SI_file/%2E%2E/sup_1.pdf"
        );
        assert_eq!(
            compute_path("BL 0042", FileRole::Main, 0, None, ".pdf"),
            "main_file/BL%200042.pdf"
        );
    }

    #[test]
    fn test_doi_like_track_ids_do_not_collide() {
        let ids = ["10.1/x", "10.1_x", "10.1%2Fx", "10.1:x", "..", "%2E%2E", "", "%"];
        let paths: std::collections::HashSet<String> = ids
            .iter()
            .map(|id| compute_path(id, FileRole::Main, 0, None, ".pdf"))
            .collect();
        assert_eq!(paths.len(), ids.len());
        for path in &paths {
            let name = path.strip_prefix("main_file/").unwrap();
            assert!(!name.contains('/'), "{path}");
        }
    }

    #[test]
    fn test_compute_path_image_is_positional() {
        assert_eq!(
            compute_path("T1", FileRole::Image, 2, None, ".png"),
            "images/T1/image_2.png"
        );
    }

    #[test]
    fn test_paths_are_distinct_across_roles_and_indices() {
        let mut seen = std::collections::HashSet::new();
        for role in [FileRole::Supplementary, FileRole::PeerReview] {
            for index in 1..=5 {
                assert!(seen.insert(compute_path("T1", role, index, None, ".pdf")));
            }
        }
        for comment in 1..=3 {
            for index in 1..=3 {
                assert!(seen.insert(compute_path(
                    "T1",
                    FileRole::CommentAttachment,
                    index,
                    Some(comment),
                    ".pdf"
                )));
            }
        }
        assert!(seen.insert(compute_path("T1", FileRole::Main, 0, None, ".pdf")));
    }

    // ==================== relative_path Tests ====================

    #[test]
    fn test_image_path_uses_url_hash() {
        let url = "https://cdn.example.org/fig/1.PNG";
        let req = request(FileRole::Image, url, 1);
        let ext = req.extension(Some("image/png"));
        assert_eq!(ext, ".png");
        assert_eq!(
            req.relative_path(&ext),
            format!("images/BL-0042/{}.png", sha256_hex(url.as_bytes()))
        );
    }

    #[test]
    fn test_image_without_extension_defaults_to_jpg() {
        let req = request(FileRole::Image, "https://cdn.example.org/render?id=9", 1);
        assert_eq!(req.extension(Some("image/png")), ".jpg");
    }

    #[test]
    fn test_other_path_uses_url_basename() {
        let req = request(FileRole::Other, "https://a.org/files/Data%20Dictionary.csv", 3);
        assert_eq!(req.relative_path(".csv"), "other/BL-0042/Data Dictionary.csv");
    }

    #[test]
    fn test_other_path_without_basename_falls_back_to_index() {
        let req = request(FileRole::Other, "https://a.org/", 3);
        assert_eq!(req.relative_path(".bin"), "other/BL-0042/file_3.bin");
    }

    #[test]
    fn test_comment_attachment_relative_path() {
        let mut req = request(FileRole::CommentAttachment, "https://a.org/x.pdf", 2);
        req.comment_index = Some(1);
        assert_eq!(req.relative_path(".pdf"), "PR_file/BL-0042/comment_1_attach_2.pdf");
    }

    // ==================== Extension Tests ====================

    #[test]
    fn test_extension_from_url_wins_over_content_type() {
        assert_eq!(
            resolve_extension("https://a.org/table.XLSX", Some("application/pdf")),
            ".xlsx"
        );
    }

    #[test]
    fn test_extension_from_content_type_table() {
        let cases = [
            ("application/pdf", ".pdf"),
            ("application/msword", ".doc"),
            (
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
                ".docx",
            ),
            ("application/vnd.ms-excel", ".xls"),
            (
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
                ".xlsx",
            ),
            ("text/plain; charset=utf-8", ".txt"),
            ("TEXT/CSV", ".csv"),
            ("application/zip", ".zip"),
            ("application/x-gzip", ".gz"),
            ("application/gzip", ".gz"),
        ];
        for (content_type, expected) in cases {
            assert_eq!(
                resolve_extension("https://a.org/download", Some(content_type)),
                expected,
                "content type {content_type}"
            );
        }
    }

    #[test]
    fn test_unknown_type_falls_back_to_bin() {
        assert_eq!(resolve_extension("https://a.org/download", None), ".bin");
        assert_eq!(
            resolve_extension("https://a.org/download", Some("application/octet-stream")),
            ".bin"
        );
        assert_eq!(resolve_extension("not a url", None), ".bin");
    }

    #[test]
    fn test_extension_from_url_rejects_degenerate() {
        assert_eq!(extension_from_url("https://a.org/file."), None);
        assert_eq!(extension_from_url("https://a.org/v1.2/download"), None);
        assert_eq!(extension_from_url("https://a.org/report.final-version-2023"), None);
    }

    #[test]
    fn test_sanitize_path_segment() {
        assert_eq!(sanitize_path_segment("a/b\\c:d"), "a_b_c_d");
        assert_eq!(sanitize_path_segment("."), "_");
        assert_eq!(sanitize_path_segment("  "), "_");
        assert_eq!(sanitize_path_segment("BL-0042"), "BL-0042");
    }
}
