//! Filename helpers for virtual nodes.

/// Sanitise a friendly name for use as a filename stem.
///
/// Replaces characters that are illegal or problematic in filenames:
/// `/` and `\` (path separators), `\0` (C string terminator), and `:`
/// (confuses shell tab-completion and some tools).  Whitespace around the
/// result is trimmed and interior runs of whitespace are collapsed.  A
/// leading `.` becomes `_` so nothing ends up hidden.
///
/// This is a light sanitiser: case, hyphens, dots and most punctuation are
/// kept so the name still reads like the certificate it came from.
pub fn sanitise_stem(s: &str) -> String {
    let replaced: String = s
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' | ':' => '_',
            c if c.is_control() => '_',
            _ => c,
        })
        .collect();
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let stem = match collapsed.strip_prefix('.') {
        Some(rest) => format!("_{rest}"),
        None => collapsed,
    };
    if stem.is_empty() || stem.chars().all(|c| c == '_' || c == '.') {
        "credential".to_string()
    } else {
        stem
    }
}

/// Filename for a bundle archive.
pub fn bundle_filename(stem: &str) -> String {
    format!("{stem}.zip")
}

/// Filename for a detail descriptor.
pub fn detail_filename(stem: &str) -> String {
    format!("{stem}.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitise_replaces_separators() {
        assert_eq!(sanitise_stem("home-lab: nuc/proxmox"), "home-lab_ nuc_proxmox");
        assert_eq!(sanitise_stem("a\\b"), "a_b");
    }

    #[test]
    fn sanitise_collapses_whitespace() {
        assert_eq!(sanitise_stem("  Alice   Example \t"), "Alice Example");
    }

    #[test]
    fn sanitise_unhides_dotfiles() {
        assert_eq!(sanitise_stem(".hidden"), "_hidden");
    }

    #[test]
    fn sanitise_falls_back_for_empty_names() {
        assert_eq!(sanitise_stem(""), "credential");
        assert_eq!(sanitise_stem("//"), "credential");
        assert_eq!(sanitise_stem(".."), "credential");
    }

    #[test]
    fn extensions() {
        assert_eq!(bundle_filename("alice"), "alice.zip");
        assert_eq!(detail_filename("alice"), "alice.json");
    }
}
