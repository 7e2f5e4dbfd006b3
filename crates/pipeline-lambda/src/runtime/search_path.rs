//! Layer discovery and the ordered search path built from it.
//!
//! The platform unpacks each attached layer into its own directory. Layer 0
//! carries the entry point and is searched first; later layers follow in id
//! order.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ColdStartError;

const LAYER_DIR_PREFIX: &str = "layer-";

/// Ordered directories searched for pipeline definitions and the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPath {
    dirs: Vec<PathBuf>,
}

impl SearchPath {
    /// Discover `layer-<id>` directories under `root`.
    ///
    /// Ids must run contiguously from 0; a gap means a layer failed to
    /// attach and the search path would be incomplete.
    pub fn discover(root: &Path) -> Result<Self, ColdStartError> {
        let root_err = |source| ColdStartError::LayersRoot {
            path: root.to_path_buf(),
            source,
        };
        let entries = fs::read_dir(root).map_err(root_err)?;

        let mut found: BTreeMap<usize, PathBuf> = BTreeMap::new();
        for entry in entries {
            let path = entry.map_err(root_err)?.path();
            let Some(id) = layer_id(&path) else { continue };
            if !path.is_dir() {
                continue;
            }
            // `layer-1` and `layer-01` name the same layer
            if let Some(first) = found.get(&id) {
                let (first, second) = if *first < path { (first.clone(), path) } else { (path, first.clone()) };
                return Err(ColdStartError::DuplicateLayer { id, first, second });
            }
            found.insert(id, path);
        }

        if found.is_empty() {
            return Err(ColdStartError::NoLayers(root.to_path_buf()));
        }

        let mut dirs = Vec::with_capacity(found.len());
        for (expected, (id, path)) in found.into_iter().enumerate() {
            if id != expected {
                return Err(ColdStartError::LayerGap { expected, found: id });
            }
            dirs.push(path);
        }

        tracing::debug!(root = %root.display(), layers = dirs.len(), "Discovered layer directories");
        Ok(Self { dirs })
    }

    /// Use an explicit list of layer directories, layer 0 first
    pub fn from_dirs(dirs: Vec<PathBuf>) -> Result<Self, ColdStartError> {
        if dirs.is_empty() {
            return Err(ColdStartError::NoLayers(PathBuf::new()));
        }
        if let Some(missing) = dirs.iter().find(|d| !d.is_dir()) {
            return Err(ColdStartError::MissingLayer(missing.clone()));
        }
        Ok(Self { dirs })
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    /// First existing `dir/rel` along the path
    pub fn find(&self, rel: impl AsRef<Path>) -> Option<PathBuf> {
        let rel = rel.as_ref();
        self.dirs
            .iter()
            .map(|dir| dir.join(rel))
            .find(|candidate| candidate.exists())
    }

    /// Platform path-list form, handed to the engine process
    pub fn to_env_value(&self) -> Option<OsString> {
        std::env::join_paths(&self.dirs).ok()
    }
}

fn layer_id(path: &Path) -> Option<usize> {
    path.file_name()?
        .to_str()?
        .strip_prefix(LAYER_DIR_PREFIX)?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layers(ids: &[usize]) -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        for id in ids {
            fs::create_dir(tmp.path().join(format!("layer-{}", id))).unwrap();
        }
        tmp
    }

    #[test]
    fn test_discover_orders_by_id() {
        let tmp = layers(&[2, 0, 10, 1, 3, 4, 5, 6, 7, 8, 9]);
        fs::write(tmp.path().join("README"), "").unwrap();

        let path = SearchPath::discover(tmp.path()).unwrap();

        assert_eq!(path.len(), 11);
        assert_eq!(path.dirs()[0], tmp.path().join("layer-0"));
        assert_eq!(path.dirs()[10], tmp.path().join("layer-10"));
    }

    #[test]
    fn test_discover_rejects_duplicate_ids() {
        let tmp = layers(&[0, 1]);
        fs::create_dir(tmp.path().join("layer-01")).unwrap();

        let err = SearchPath::discover(tmp.path()).unwrap_err();
        match err {
            ColdStartError::DuplicateLayer { id, first, second } => {
                assert_eq!(id, 1);
                assert_eq!(first, tmp.path().join("layer-01"));
                assert_eq!(second, tmp.path().join("layer-1"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_discover_rejects_gaps() {
        let tmp = layers(&[0, 2]);
        let err = SearchPath::discover(tmp.path()).unwrap_err();
        assert!(matches!(err, ColdStartError::LayerGap { expected: 1, found: 2 }));
    }

    #[test]
    fn test_discover_requires_layers() {
        let tmp = layers(&[]);
        assert!(matches!(
            SearchPath::discover(tmp.path()),
            Err(ColdStartError::NoLayers(_))
        ));
        assert!(matches!(
            SearchPath::discover(&tmp.path().join("missing")),
            Err(ColdStartError::LayersRoot { .. })
        ));
    }

    #[test]
    fn test_find_prefers_earlier_layers() {
        let tmp = layers(&[0, 1]);
        fs::create_dir_all(tmp.path().join("layer-0/pipelines")).unwrap();
        fs::create_dir_all(tmp.path().join("layer-1/pipelines")).unwrap();
        fs::write(tmp.path().join("layer-0/pipelines/ndvi.json"), "{}").unwrap();
        fs::write(tmp.path().join("layer-1/pipelines/ndvi.json"), "{}").unwrap();
        fs::write(tmp.path().join("layer-1/pipelines/smap.json"), "{}").unwrap();

        let path = SearchPath::discover(tmp.path()).unwrap();

        assert_eq!(
            path.find("pipelines/ndvi.json"),
            Some(tmp.path().join("layer-0/pipelines/ndvi.json"))
        );
        assert_eq!(
            path.find("pipelines/smap.json"),
            Some(tmp.path().join("layer-1/pipelines/smap.json"))
        );
        assert_eq!(path.find("pipelines/none.json"), None);
    }

    #[test]
    fn test_explicit_dirs_must_exist() {
        let tmp = layers(&[0]);
        let err = SearchPath::from_dirs(vec![tmp.path().join("layer-0"), tmp.path().join("gone")]).unwrap_err();
        assert!(matches!(err, ColdStartError::MissingLayer(_)));
    }
}
