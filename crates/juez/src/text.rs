//! Small helpers for text shown to learners.

const TRUNCATION_NOTE: &str = "\n... [truncated]";

/// Cut `text` to at most `limit` bytes on a char boundary, noting the cut.
pub fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &text[..end], TRUNCATION_NOTE)
}

/// Replace every occurrence of `path` with `placeholder`.
pub fn scrub_path(text: &str, path: &std::path::Path, placeholder: &str) -> String {
    let needle = path.to_string_lossy();
    if needle.is_empty() {
        return text.to_string();
    }
    text.replace(needle.as_ref(), placeholder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        let cut = truncate("ñandú", 2);
        assert!(cut.starts_with('ñ'));
        assert!(cut.ends_with("[truncated]"));
        let cut = truncate("ñandú", 1);
        assert!(cut.starts_with(TRUNCATION_NOTE));
    }

    #[test]
    fn test_scrub_path() {
        let text = "/tmp/juez/juez-abc/submission.c:3:5: error";
        let scrubbed = scrub_path(text, Path::new("/tmp/juez/juez-abc"), ".");
        assert_eq!(scrubbed, "./submission.c:3:5: error");
    }
}
