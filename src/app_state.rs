use crate::classes::ClassTable;
use crate::config::Config;
use crate::detection::SharedDetector;
use crate::pipeline::{FrameAnnotator, StreamSettings};
use crate::session::SessionStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const UPLOADS_DIR: &str = "Uploads";
/// Default home of offline CLI outputs.
pub const DETECTIONS_DIR: &str = "Detections";

async fn init_workspace(workspace: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(workspace.join(UPLOADS_DIR)).await?;
    tokio::fs::create_dir_all(workspace.join(DETECTIONS_DIR)).await?;
    Ok(())
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub detector: SharedDetector,
    pub classes: Arc<ClassTable>,
    pub sessions: SessionStore,

    pub uploads_dir: PathBuf,
}

impl AppState {
    pub async fn new(
        config: Config,
        detector: SharedDetector,
        classes: ClassTable,
    ) -> anyhow::Result<Self> {
        let workspace = config.workspace_path();
        init_workspace(&workspace).await?;
        // Session media paths are stored absolute so they survive a cwd change.
        let workspace = tokio::fs::canonicalize(&workspace).await?;
        info!(workspace = %workspace.display(), classes = classes.len(), "Workspace ready");

        Ok(Self {
            config: Arc::new(config),
            detector,
            classes: Arc::new(classes),
            sessions: SessionStore::new(),

            uploads_dir: workspace.join(UPLOADS_DIR),
        })
    }

    pub fn uploads_dir(&self) -> &Path {
        self.uploads_dir.as_path()
    }

    pub fn annotator(&self) -> FrameAnnotator {
        FrameAnnotator::new(self.detector.clone(), self.classes.clone())
    }

    /// Stream settings for a source; still images use the stricter threshold.
    pub fn stream_settings(&self, is_image: bool) -> StreamSettings {
        StreamSettings {
            confidence: if is_image {
                self.config.image_confidence
            } else {
                self.config.video_confidence
            },
            jpeg_quality: self.config.jpeg_quality,
            max_fps: self.config.max_stream_fps,
        }
    }
}
