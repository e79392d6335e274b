use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// Suffix-matching domain set. A name is covered when the set holds the name
/// itself or any parent domain, so an entry `example.com` covers
/// `www.example.com`.
#[derive(Debug, Clone, Default)]
pub struct DomainList {
    domains: HashSet<String>,
}

impl DomainList {
    pub fn has(&self, fqdn: &str) -> bool {
        let name = normalize(fqdn);
        // 逐级剥离子域名进行后缀匹配 / strip labels one by one for suffix matching
        let mut search = name.as_str();
        loop {
            if self.domains.contains(search) {
                return true;
            }
            match search.find('.') {
                Some(idx) => search = &search[idx + 1..],
                None => return false,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// One domain per line, `#` starts a comment, blank lines skipped.
    pub fn from_text(text: &str) -> Self {
        let mut domains = HashSet::new();
        for line in text.lines() {
            let line = match line.split_once('#') {
                Some((before, _)) => before.trim(),
                None => line.trim(),
            };
            if line.is_empty() {
                continue;
            }
            domains.insert(normalize(line));
        }
        Self { domains }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("read domain list {}", path.display()))?;
        Ok(Self::from_text(&text))
    }
}

fn normalize(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_name_and_subdomains() {
        let list = DomainList::from_text("example.com\ncn\n");
        assert!(list.has("example.com"));
        assert!(list.has("www.example.com"));
        assert!(list.has("a.b.example.com"));
        assert!(list.has("baidu.cn"));
        assert!(!list.has("example.org"));
        assert!(!list.has("notexample.com"));
    }

    #[test]
    fn fqdn_trailing_dot_and_case_are_ignored() {
        let list = DomainList::from_text("Example.COM");
        assert!(list.has("EXAMPLE.com."));
        assert!(list.has("www.example.com."));
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let list = DomainList::from_text("# header\n\nfoo.com # inline\n");
        assert_eq!(list.len(), 1);
        assert!(list.has("foo.com"));
    }
}
