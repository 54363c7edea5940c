use crate::progress::ProgressMode;
use std::ffi::OsStr;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct ArtifactDir {
    pub dir_path: PathBuf,
    pub filename_prefix: PathBuf,
}

impl ArtifactDir {
    pub fn artifact_path(&self, extension: &(impl AsRef<OsStr> + ?Sized)) -> PathBuf {
        self.dir_path
            .join(self.filename_prefix.with_extension(extension))
    }
}

/// Options controlling one analysis run. These mirror the command-line options of the driving
/// compiler; intrinsics like `safety` and `debug` read their results from here.
#[derive(Clone, Debug)]
pub struct AnalysisOptions {
    pub safety: bool,
    pub debug: bool,
    pub debug_level: i64,
    pub verbosity: u32,

    // Purely a performance knob: how deep newly interned calls may be analyzed eagerly before
    // they are deferred to the outer fixpoint work-list. Varying this must never change the
    // final analysis results, only the number of iterations needed to reach them.
    pub eager_call_depth: usize,

    pub progress: ProgressMode,
    pub artifact_dir: Option<ArtifactDir>,
}

impl AnalysisOptions {
    pub fn verbose(&self, level: u32) -> bool {
        self.verbosity >= level
    }
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        AnalysisOptions {
            safety: true,
            debug: false,
            debug_level: 0,
            verbosity: 0,
            eager_call_depth: 10,
            progress: ProgressMode::Hidden,
            artifact_dir: None,
        }
    }
}
