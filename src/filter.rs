use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;
const BUFFER_SIZE: usize = 256 * 1024;

/// Immutable set of substrings. A target containing any of them is blocked.
///
/// Built once before the listener starts and shared read-only between all
/// sessions behind an `Arc`.
#[derive(Debug, Default)]
pub struct FilterSet {
    tokens: Box<[String]>,
}

impl FilterSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let unique: HashSet<String> = tokens
            .into_iter()
            .map(Into::into)
            .filter(|t| !t.is_empty())
            .collect();

        Self {
            tokens: unique.into_iter().collect(),
        }
    }

    /// Loads the filter list at `path`, falling back to an empty set when the
    /// file cannot be read.
    pub fn load_or_empty(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(set) => set,
            Err(e) => {
                tracing::warn!("{:#}. No filters will be applied", e);
                Self::empty()
            }
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to read metadata for filter file: {:?}", path))?;

        if metadata.len() > MAX_FILE_SIZE {
            anyhow::bail!("filter file too large: {:?}", path);
        }

        let file =
            File::open(path).with_context(|| format!("Failed to open filter file: {:?}", path))?;

        let reader = BufReader::with_capacity(BUFFER_SIZE, file);

        let mut raw_count = 0;
        let mut tokens = Vec::new();

        for line in reader.lines() {
            let line = line.with_context(|| format!("Failed to read filter file: {:?}", path))?;
            raw_count += 1;
            tokens.push(line);
        }

        let set = Self::from_tokens(tokens);

        tracing::info!(
            "Loaded filter list: {} tokens from {} lines",
            set.len(),
            raw_count
        );

        Ok(set)
    }

    /// First filter token contained in `candidate`, if any. Case-sensitive;
    /// tokens carry no precedence.
    pub fn matching_token(&self, candidate: &str) -> Option<&str> {
        self.tokens
            .iter()
            .find(|token| candidate.contains(token.as_str()))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    fn temp_file(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "filter-proxy-{}-{}.txt",
            name,
            std::process::id()
        ));
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_empty_set_never_blocks() {
        let set = FilterSet::empty();
        assert!(set.is_empty());
        assert!(set.matching_token("http://anything.example/").is_none());
        assert!(set.matching_token("").is_none());
    }

    #[test]
    fn test_substring_match() {
        let set = FilterSet::from_tokens(["blocked.example", "ads"]);
        assert!(set.matching_token("http://blocked.example/x").is_some());
        assert!(set.matching_token("http://cdn.example/ads/banner.png").is_some());
        assert!(set.matching_token("http://fine.example/").is_none());
    }

    #[test]
    fn test_match_is_case_sensitive() {
        let set = FilterSet::from_tokens(["Blocked"]);
        assert!(set.matching_token("http://Blocked.example/").is_some());
        assert!(set.matching_token("http://blocked.example/").is_none());
    }

    #[test]
    fn test_matching_token_reports_culprit() {
        let set = FilterSet::from_tokens(["evil"]);
        assert_eq!(set.matching_token("http://evil.example/"), Some("evil"));
        assert_eq!(set.matching_token("http://good.example/"), None);
    }

    #[test]
    fn test_empty_and_duplicate_tokens_collapse() {
        let set = FilterSet::from_tokens(["", "a", "a", "b"]);
        assert_eq!(set.len(), 2);
        assert!(set.matching_token("xyz").is_none());
    }

    #[test]
    fn test_load_one_token_per_line() {
        let path = temp_file("load", "blocked.example\r\n\nads\nads\n");
        let set = FilterSet::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(set.len(), 2);
        assert!(set.matching_token("http://blocked.example/").is_some());
        assert!(set.matching_token("/ads/").is_some());
    }

    #[test]
    fn test_load_keeps_surrounding_spaces() {
        let path = temp_file("spaces", " spaced \n");
        let set = FilterSet::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert!(set.matching_token("spaced").is_none());
        assert!(set.matching_token("a spaced b").is_some());
    }

    #[test]
    fn test_missing_file_falls_back_to_empty() {
        let path = std::env::temp_dir().join("filter-proxy-does-not-exist.txt");
        assert!(FilterSet::load(&path).is_err());
        assert!(FilterSet::load_or_empty(&path).is_empty());
    }

    #[tokio::test]
    async fn test_shared_set_is_consistent_across_tasks() {
        let set = Arc::new(FilterSet::from_tokens(["blocked"]));
        let mut handles = Vec::new();

        for i in 0..32 {
            let set = set.clone();
            handles.push(tokio::spawn(async move {
                let target = if i % 2 == 0 {
                    format!("http://blocked/{}", i)
                } else {
                    format!("http://open/{}", i)
                };
                (i, set.matching_token(&target).is_some())
            }));
        }

        for handle in handles {
            let (i, blocked) = handle.await.unwrap();
            assert_eq!(blocked, i % 2 == 0);
        }
    }
}
