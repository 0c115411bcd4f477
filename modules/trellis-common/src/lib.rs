pub mod config;
pub mod error;
pub mod hash;
pub mod traits;
pub mod types;

pub use config::Config;
pub use error::{ErrorCode, ErrorDetail, TrellisError};
pub use hash::{content_hash, sha1_hex};
pub use traits::*;
pub use types::*;

/// Normalize a dataset or profile name into a key-safe slug: lowercase,
/// strip non-alphanumeric (keeping spaces, dots and hyphens), collapse
/// whitespace, replace spaces with hyphens.
///
/// ```
/// assert_eq!(trellis_common::slugify("Jira Issues"), "jira-issues");
/// assert_eq!(trellis_common::slugify("cdm.work_item.v1"), "cdm.work_item.v1");
/// assert_eq!(trellis_common::slugify("  GitHub   PRs  "), "github-prs");
/// ```
pub fn slugify(name: &str) -> String {
    let lowered = name.to_lowercase();
    let cleaned: String = lowered
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == ' ' || c == '.' || c == '-' || c == '_' {
                c
            } else {
                ' '
            }
        })
        .collect();
    cleaned.split_whitespace().collect::<Vec<&str>>().join("-")
}
