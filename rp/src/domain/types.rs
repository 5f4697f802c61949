//! Domain types shared by the resolver, the capture tasks and the coordinator

use rp_common::{Modality, DEFAULT_PROFILE_PORT, DEFAULT_PROFILE_SECONDS};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Output file per modality
///
/// A modality without a path is never captured; its task degenerates to a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactPaths([Option<PathBuf>; 4]);

impl ArtifactPaths {
    /// `debug_profile.<modality>` for every modality, rooted at `dir`
    pub fn in_working_dir(dir: &Path) -> Self {
        let mut paths = ArtifactPaths::default();
        for modality in Modality::ALL {
            paths.set(modality, dir.join(format!("debug_profile.{}", modality.short_name())));
        }
        paths
    }

    /// `<module>_debug_profile_<modality>.prof` for every modality, rooted at `dir`
    pub fn for_module(dir: &Path, module: &str) -> Self {
        let mut paths = ArtifactPaths::default();
        for modality in Modality::ALL {
            paths.set(
                modality,
                dir.join(format!("{module}_debug_profile_{}.prof", modality.short_name())),
            );
        }
        paths
    }

    pub fn set(&mut self, modality: Modality, path: PathBuf) {
        self.0[Self::slot(modality)] = Some(path);
    }

    pub fn clear(&mut self, modality: Modality) {
        self.0[Self::slot(modality)] = None;
    }

    #[must_use]
    pub fn path_for(&self, modality: Modality) -> Option<&Path> {
        self.0[Self::slot(modality)].as_deref()
    }

    fn slot(modality: Modality) -> usize {
        (modality.code() - 1) as usize
    }
}

/// Fully resolved capture parameters for one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSettings {
    pub port: u16,
    pub paths: ArtifactPaths,
    pub duration: Duration,
}

impl ProfileSettings {
    /// Defaults rooted at `dir`: fixed port, `debug_profile.*` files, 30s captures
    pub fn defaults_in(dir: &Path) -> Self {
        Self {
            port: DEFAULT_PROFILE_PORT,
            paths: ArtifactPaths::in_working_dir(dir),
            duration: Duration::from_secs(DEFAULT_PROFILE_SECONDS),
        }
    }
}

/// A snapshot file that was written and closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub modality: Modality,
    pub path: PathBuf,
    pub bytes: u64,
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} ({} bytes)", self.modality, self.path.display(), self.bytes)
    }
}
