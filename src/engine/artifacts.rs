use crate::model::{ArtifactLayout, ArtifactReference};
use std::path::PathBuf;

/// Finds the per-step images the job writes into its output directory.
#[derive(Debug, Clone)]
pub struct ArtifactWatcher {
    dir: PathBuf,
    layout: ArtifactLayout,
}

impl ArtifactWatcher {
    /// `dir` is the resolved output directory; `layout.dir` is not consulted.
    pub fn new(dir: impl Into<PathBuf>, layout: ArtifactLayout) -> Self {
        Self {
            dir: dir.into(),
            layout,
        }
    }

    /// Derived path for `step`, whether or not it exists yet.
    pub fn path_for(&self, step: u64) -> PathBuf {
        let name = format!(
            "{}{:0width$}.{}",
            self.layout.prefix,
            step,
            self.layout.extension,
            width = self.layout.width
        );
        self.dir.join(name)
    }

    /// The artifact for `step` if it is on disk and non-empty.
    ///
    /// A miss just means the job has not flushed it yet.
    pub fn locate(&self, step: u64) -> Option<ArtifactReference> {
        let path = self.path_for(step);
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Some(ArtifactReference {
                step_index: step,
                path,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn watcher(dir: &Path) -> ArtifactWatcher {
        ArtifactWatcher::new(dir, ArtifactLayout::default())
    }

    #[test]
    fn derives_zero_padded_names() {
        let w = watcher(Path::new("/out"));
        assert_eq!(w.path_for(5), PathBuf::from("/out/Step00005.ppm"));
        assert_eq!(w.path_for(123456), PathBuf::from("/out/Step123456.ppm"));
    }

    #[test]
    fn honors_custom_layout() {
        let layout = ArtifactLayout {
            dir: PathBuf::from("ignored"),
            prefix: "frame_".into(),
            width: 3,
            extension: "pgm".into(),
        };
        let w = ArtifactWatcher::new("/tmp/x", layout);
        assert_eq!(w.path_for(7), PathBuf::from("/tmp/x/frame_007.pgm"));
    }

    #[test]
    fn missing_then_present() {
        let dir = tempfile::tempdir().unwrap();
        let w = watcher(dir.path());

        assert_eq!(w.locate(5), None);

        std::fs::write(w.path_for(5), b"P6\n1 1\n255\n\0\0\0").unwrap();
        let found = w.locate(5).unwrap();
        assert_eq!(found.step_index, 5);
        assert_eq!(found.path, w.path_for(5));
    }

    #[test]
    fn empty_file_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let w = watcher(dir.path());
        std::fs::write(w.path_for(2), b"").unwrap();
        assert_eq!(w.locate(2), None);
    }

    #[test]
    fn missing_directory_is_not_an_error() {
        let w = watcher(Path::new("/definitely/not/here"));
        assert_eq!(w.locate(1), None);
    }
}
