//! Shared utility functions for the relay crate.

use uuid::Uuid;

/// Turn free text into a branch/id-safe slug: lowercase, alphanumeric runs
/// joined by single dashes, truncated on a char boundary.
pub fn slugify(text: &str, max_len: usize) -> String {
    let slug: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() <= max_len {
        return slug;
    }
    let mut cut = max_len;
    while !slug.is_char_boundary(cut) {
        cut -= 1;
    }
    slug[..cut].trim_end_matches('-').to_string()
}

/// Eight hex characters of a fresh v4 uuid, used to suffix run ids.
pub fn short_suffix() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// Split a configured command line on whitespace into program + args.
/// No shell quoting is supported; tools needing it should ship a wrapper
/// script.
pub fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}
