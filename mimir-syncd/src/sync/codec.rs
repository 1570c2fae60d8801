//! Maps remote titles onto file names that are safe in the download directory.
//!
//! The mapping is the identity bridge between remote items and local files, so it has to stay
//! pure and idempotent: `canonical_name(&canonical_name(s)) == canonical_name(s)`.

pub const PLACEHOLDER: &str = "untitled";
const MAX_NAME_LEN: usize = 255;

pub fn canonical_name(title: &str) -> String {
    if title.is_empty() {
        return PLACEHOLDER.to_string();
    }
    let mut name: String = title
        .chars()
        .map(|c| if is_safe(c) { c } else { '_' })
        .take(MAX_NAME_LEN)
        .collect();
    // Leading dots would produce hidden files (or "." / "..").
    if name.starts_with('.') {
        name.replace_range(..1, "_");
    }
    name
}

pub fn is_canonical(name: &str) -> bool {
    !name.is_empty() && canonical_name(name) == name
}

fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

/// Disambiguates a name claimed by another item: `photo.jpg` -> `photo_1a2b3c4d.jpg`.
///
/// The stem is shortened when needed so the suffix always survives the length limit.
pub fn with_id_suffix(name: &str, item_id: &str) -> String {
    let short: String = canonical_name(item_id).chars().take(8).collect();
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && ext.len() + short.len() + 2 < MAX_NAME_LEN => {
            (stem, format!(".{ext}"))
        }
        _ => (name, String::new()),
    };
    let room = MAX_NAME_LEN - short.len() - 1 - ext.len();
    let stem: String = stem.chars().take(room).collect();
    canonical_name(&format!("{stem}_{short}{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_unsafe_characters() {
        assert_eq!(canonical_name("Sunset Photo"), "Sunset_Photo");
        assert_eq!(canonical_name("a/b\\c:d.png"), "a_b_c_d.png");
        assert_eq!(canonical_name("keep-this_one.v2.JPG"), "keep-this_one.v2.JPG");
        assert_eq!(canonical_name("Ærøskøbing"), "_r_sk_bing");
    }

    #[test]
    fn empty_title_maps_to_placeholder() {
        assert_eq!(canonical_name(""), PLACEHOLDER);
    }

    #[test]
    fn never_produces_hidden_or_relative_names() {
        assert_eq!(canonical_name("."), "_");
        assert_eq!(canonical_name(".."), "_.");
        assert_eq!(canonical_name(".env"), "_env");
    }

    #[test]
    fn is_idempotent_and_restricted() {
        let samples = [
            "",
            " ",
            "Sunset Photo",
            "..hidden",
            "日本語のタイトル.png",
            "tab\there",
            "emoji 🎉 party.mov",
            "already_safe-name.txt",
            "%20encoded%2Fpath",
        ];
        for sample in samples {
            let once = canonical_name(sample);
            assert_eq!(canonical_name(&once), once, "not idempotent for {sample:?}");
            assert!(
                once.chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')),
                "unsafe output {once:?}"
            );
            assert!(!once.is_empty());
        }
    }

    #[test]
    fn truncates_long_titles() {
        let long = "x".repeat(400);
        assert_eq!(canonical_name(&long).len(), MAX_NAME_LEN);
    }

    #[test]
    fn id_suffix_goes_before_extension() {
        assert_eq!(
            with_id_suffix("photo.jpg", "1a2b3c4d-5e6f"),
            "photo_1a2b3c4d.jpg"
        );
        assert_eq!(with_id_suffix("README", "abc"), "README_abc");
        assert!(is_canonical(&with_id_suffix("Sunset_Photo", "id with spaces")));
    }

    #[test]
    fn id_suffix_survives_the_length_limit() {
        let stem = canonical_name(&"x".repeat(300));
        let first = with_id_suffix(&stem, "aaaaaaaa1");
        let second = with_id_suffix(&stem, "bbbbbbbb2");
        assert_ne!(first, second);
        assert_eq!(first.len(), MAX_NAME_LEN);
        assert!(first.ends_with("_aaaaaaaa"));

        let with_ext = format!("{}.mov", "y".repeat(250));
        let suffixed = with_id_suffix(&canonical_name(&with_ext), "c0ffee00");
        assert_eq!(suffixed.len(), MAX_NAME_LEN);
        assert!(suffixed.ends_with("_c0ffee00.mov"), "{suffixed}");
    }
}
