use std::fmt;

/// An absolute remote path in Unix syntax. The empty value means
/// "unknown", e.g. before the first `PWD` reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct ServerPath {
    segments: Vec<String>,
    known: bool,
}

impl ServerPath {
    pub fn root() -> Self {
        Self {
            segments: vec![],
            known: true,
        }
    }

    /// Parses an absolute path. `.` segments are dropped and `..` segments
    /// are resolved; relative input is rejected.
    pub fn parse(path: &str) -> Option<Self> {
        if !path.starts_with('/') {
            return None;
        }
        Self::root().change_path(path)
    }

    pub fn is_empty(&self) -> bool {
        !self.known
    }

    pub fn is_root(&self) -> bool {
        self.known && self.segments.is_empty()
    }

    pub fn has_parent(&self) -> bool {
        self.known && !self.segments.is_empty()
    }

    pub fn parent(&self) -> Option<Self> {
        if !self.has_parent() {
            return None;
        }
        let mut segments = self.segments.clone();
        segments.pop();
        Some(Self {
            segments,
            known: true,
        })
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(|s| s.as_str())
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Resolves `subdir` against this path. Absolute input replaces it.
    pub fn change_path(&self, subdir: &str) -> Option<Self> {
        let mut segments = if subdir.starts_with('/') {
            vec![]
        } else if self.known {
            self.segments.clone()
        } else {
            return None;
        };
        for segment in subdir.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                s => segments.push(s.to_owned()),
            }
        }
        Some(Self {
            segments,
            known: true,
        })
    }

    pub fn add_segment(&self, segment: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.to_owned());
        Self {
            segments,
            known: true,
        }
    }

    /// Full path of a file inside this directory.
    pub fn format_filename(&self, name: &str) -> String {
        if self.segments.is_empty() {
            format!("/{name}")
        } else {
            format!("{self}/{name}")
        }
    }

    /// `true` if `self` lies strictly below `other`.
    pub fn is_subdir_of(&self, other: &ServerPath) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self.segments.len() > other.segments.len()
            && self.segments[..other.segments.len()] == other.segments[..]
    }

    pub fn is_parent_of(&self, other: &ServerPath) -> bool {
        other.is_subdir_of(self)
    }
}

impl fmt::Display for ServerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.known {
            return Ok(());
        }
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_normalizes() {
        let path = ServerPath::parse("/pub//incoming/./old/../new/").unwrap();
        assert_eq!(path.to_string(), "/pub/incoming/new");
        assert_eq!(path.last_segment(), Some("new"));
        assert!(ServerPath::parse("relative/path").is_none());
    }

    #[test]
    fn parent_chain_ends_at_root() {
        let path = ServerPath::parse("/a/b").unwrap();
        let parent = path.parent().unwrap();
        assert_eq!(parent.to_string(), "/a");
        let root = parent.parent().unwrap();
        assert!(root.is_root());
        assert!(root.parent().is_none());
    }

    #[test]
    fn subdirs() {
        let a = ServerPath::parse("/a").unwrap();
        let ab = ServerPath::parse("/a/b").unwrap();
        let ac = ServerPath::parse("/ac").unwrap();
        assert!(ab.is_subdir_of(&a));
        assert!(a.is_parent_of(&ab));
        assert!(!a.is_subdir_of(&a));
        assert!(!ac.is_subdir_of(&a));
        assert!(ab.is_subdir_of(&ServerPath::root()));
        assert!(!ab.is_subdir_of(&ServerPath::default()));
    }

    #[test]
    fn relative_changes_need_a_known_path() {
        assert!(ServerPath::default().change_path("x").is_none());
        assert_eq!(
            ServerPath::default().change_path("/x").unwrap().to_string(),
            "/x"
        );
        let base = ServerPath::parse("/home/u").unwrap();
        assert_eq!(base.change_path("../v").unwrap().to_string(), "/home/v");
        assert_eq!(base.format_filename("f.txt"), "/home/u/f.txt");
        assert_eq!(ServerPath::root().format_filename("f.txt"), "/f.txt");
    }
}
