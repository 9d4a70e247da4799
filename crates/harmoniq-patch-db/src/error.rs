use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatchDbError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse patch database: {0}")]
    Json(#[from] serde_json::Error),
    #[error("No write access to file:\n{}", .0.display())]
    NoWriteAccess(PathBuf),
    #[error("Failed to write data to file:\n{}", .0.display())]
    WriteFailed(PathBuf),
    #[error("Failed to copy\n{}\nto\n{}", .from.display(), .to.display())]
    CopyFailed { from: PathBuf, to: PathBuf },
    #[error("patch loader thread has exited")]
    LoaderExited,
}
