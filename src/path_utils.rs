//! Logical-path helpers shared by the index, shard manager and archive façade.
//!
//! Paths stored in the index are POSIX-style, slash-separated, with no leading
//! or trailing slash; the root directory is the empty string.

/// Normalize a logical path: strip a leading `/`, drop a trailing `/`,
/// collapse `.` segments, and resolve `..` syntactically (no filesystem
/// access, unlike `std::fs::canonicalize`).
pub fn normalize(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                out.pop();
            }
            s => out.push(s),
        }
    }
    out.join("/")
}

/// Parent sentinel used for the root directory's own `parent` column: not a
/// value `normalize` can ever produce for a real path, so it never collides.
pub const ROOT_PARENT_SENTINEL: &str = "\u{0}root-parent\u{0}";

/// Logical parent of a normalized path. The root (`""`) has no real parent;
/// callers that need to insert it use [`ROOT_PARENT_SENTINEL`] directly.
pub fn parent(path: &str) -> String {
    match path.rfind('/') {
        Some(idx) => path[..idx].to_string(),
        None => String::new(),
    }
}

/// All strict ancestors of `path`, root first, not including `path` itself.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut result = vec![String::new()];
    let mut acc = String::new();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    for segment in &segments[..segments.len().saturating_sub(1)] {
        if !acc.is_empty() {
            acc.push('/');
        }
        acc.push_str(segment);
        result.push(acc.clone());
    }
    result
}

/// Basename (last path segment) of a normalized path.
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Escape `[`, `?`, `*` so a path can be used as a literal prefix in a SQL
/// `GLOB` pattern (mirrors `index.py`'s inline
/// `replace(replace(replace(path, '[','[[]'), '?','[?]'), '*','[*]')`).
pub fn escape_glob_literal(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        match c {
            '[' => out.push_str("[[]"),
            '?' => out.push_str("[?]"),
            '*' => out.push_str("[*]"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_and_collapses() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("/"), "");
        assert_eq!(normalize("/a/b/"), "a/b");
        assert_eq!(normalize("a/./b"), "a/b");
        assert_eq!(normalize("a/b/../c"), "a/c");
        assert_eq!(normalize("a/../../b"), "b");
    }

    #[test]
    fn parent_of_top_level_is_root() {
        assert_eq!(parent("a"), "");
        assert_eq!(parent("a/b"), "a");
        assert_eq!(parent("a/b/c"), "a/b");
    }

    #[test]
    fn ancestors_are_in_depth_order() {
        assert_eq!(ancestors(""), vec![""]);
        assert_eq!(ancestors("a"), vec![""]);
        assert_eq!(ancestors("a/b/c"), vec!["", "a", "a/b"]);
    }

    #[test]
    fn escape_glob_literal_escapes_metachars() {
        assert_eq!(escape_glob_literal("d/*weird[name]"), "d/[*]weird[[]name]");
    }
}
