use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::error::{invalid_argument, DatabaseResult};

/// An immutable slash-separated location inside the database tree.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn new(segments: Vec<String>) -> Self {
        Self { segments }
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(segments.into_iter().map(Into::into).collect())
    }

    /// Parses `"a/b/c"` (leading/trailing slashes tolerated). Interior empty
    /// segments are rejected the way the reference surface rejects them.
    pub fn parse(raw: &str) -> DatabaseResult<Self> {
        let trimmed = raw.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let mut segments = Vec::new();
        for segment in trimmed.split('/') {
            if segment.is_empty() {
                return Err(invalid_argument(
                    "Database path cannot contain empty segments",
                ));
            }
            segments.push(segment.to_string());
        }
        Ok(Self::new(segments))
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn front(&self) -> Option<&str> {
        self.segments.first().map(|s| s.as_str())
    }

    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(|s| s.as_str())
    }

    /// The path with the first segment removed. The root pops to itself.
    pub fn pop_front(&self) -> Self {
        if self.segments.is_empty() {
            return Self::root();
        }
        Self::new(self.segments[1..].to_vec())
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self::new(self.segments[..self.segments.len() - 1].to_vec()))
    }

    pub fn child(&self, key: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(key.into());
        Self::new(segments)
    }

    pub fn child_path(&self, other: &Path) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self::new(segments)
    }

    /// True when `self` is `other` or an ancestor of `other`.
    pub fn contains(&self, other: &Path) -> bool {
        other.segments.len() >= self.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(a, b)| a == b)
    }

    /// `other` expressed relative to `self`; `None` when `other` is not at or
    /// below `self`.
    pub fn relative_to(&self, other: &Path) -> Option<Path> {
        if !self.contains(other) {
            return None;
        }
        Some(Path::new(other.segments[self.segments.len()..].to_vec()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(|s| s.as_str())
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The slash rendering used by persisted keys: `"/"` for the root,
    /// `"/a/b"` otherwise.
    pub fn slash_string(&self) -> String {
        if self.segments.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", self.segments.join("/"))
        }
    }
}

impl Display for Path {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.slash_string())
    }
}

impl PartialOrd for Path {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Path {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segments.cmp(&other.segments)
    }
}
