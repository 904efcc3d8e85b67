use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::error::PredictError;

pub const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "avi", "mov", "webm"];

pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| VIDEO_EXTENSIONS.iter().any(|v| ext.eq_ignore_ascii_case(v)))
        .unwrap_or(false)
}

/// Removes every regular file directly inside `dir`; subdirectories are kept.
/// Individual failures are skipped. Returns the number of files removed.
pub fn clear_output_dir(dir: &Path) -> usize {
    let read_dir = match fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(error) => {
            debug!(dir = %dir.display(), error = %error, "Output directory not readable; nothing to clear");
            return 0;
        }
    };

    let mut removed = 0;
    for entry in read_dir.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(error) => {
                debug!(path = %path.display(), error = %error, "Failed to remove stale output file")
            }
        }
    }
    removed
}

/// Most recently modified recognized video file in `dir`.
pub fn locate_latest_video(dir: &Path) -> Result<PathBuf, PredictError> {
    let no_output = || PredictError::NoOutput {
        dir: dir.to_path_buf(),
    };

    let read_dir = fs::read_dir(dir).map_err(|error| {
        warn!(dir = %dir.display(), error = %error, "Failed to read output directory");
        no_output()
    })?;

    newest(read_dir.flatten().map(|entry| entry.path())).ok_or_else(no_output)
}

/// Newest existing video among files the engine reported, resolved against
/// `dir`.
pub fn select_reported_video(dir: &Path, reported: &[PathBuf]) -> Option<PathBuf> {
    newest(reported.iter().map(|relative| dir.join(relative)))
}

fn newest(candidates: impl Iterator<Item = PathBuf>) -> Option<PathBuf> {
    candidates
        .filter(|path| path.is_file() && is_video_file(path))
        .map(|path| {
            let modified = fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, path)
        })
        .max_by(|(a_time, a_path), (b_time, b_path)| {
            a_time.cmp(b_time).then_with(|| a_path.cmp(b_path))
        })
        .map(|(_, path)| path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;
    use tempfile::tempdir;

    fn write_with_mtime(path: &Path, age: Duration) {
        fs::write(path, b"video").unwrap();
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[test]
    fn recognizes_video_extensions_case_insensitively() {
        assert!(is_video_file(Path::new("out.mp4")));
        assert!(is_video_file(Path::new("out.WEBM")));
        assert!(is_video_file(Path::new("out.mov")));
        assert!(is_video_file(Path::new("out.avi")));
        assert!(!is_video_file(Path::new("out.png")));
        assert!(!is_video_file(Path::new("mp4")));
    }

    #[test]
    fn newest_video_wins_across_extensions() {
        let dir = tempdir().unwrap();
        write_with_mtime(&dir.path().join("a.mp4"), Duration::from_secs(120));
        write_with_mtime(&dir.path().join("b.webm"), Duration::from_secs(5));

        let found = locate_latest_video(dir.path()).unwrap();
        assert_eq!(found, dir.path().join("b.webm"));
    }

    #[test]
    fn non_video_files_are_ignored() {
        let dir = tempdir().unwrap();
        write_with_mtime(&dir.path().join("clip.mp4"), Duration::from_secs(60));
        write_with_mtime(&dir.path().join("preview.png"), Duration::from_secs(1));

        let found = locate_latest_video(dir.path()).unwrap();
        assert_eq!(found, dir.path().join("clip.mp4"));
    }

    #[test]
    fn empty_directory_reports_no_output() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("frame.png"), b"x").unwrap();

        let err = locate_latest_video(dir.path()).unwrap_err();
        assert!(matches!(err, PredictError::NoOutput { .. }));
    }

    #[test]
    fn missing_directory_reports_no_output() {
        let dir = tempdir().unwrap();
        let err = locate_latest_video(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, PredictError::NoOutput { .. }));
    }

    #[test]
    fn clear_removes_files_but_keeps_subdirectories() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("old.mp4"), b"x").unwrap();
        fs::write(dir.path().join("old.png"), b"x").unwrap();
        fs::create_dir(dir.path().join("subfolder")).unwrap();
        fs::write(dir.path().join("subfolder").join("nested.mp4"), b"x").unwrap();

        assert_eq!(clear_output_dir(dir.path()), 2);
        assert!(!dir.path().join("old.mp4").exists());
        assert!(dir.path().join("subfolder").join("nested.mp4").exists());
    }

    #[test]
    fn clear_missing_directory_is_noop() {
        let dir = tempdir().unwrap();
        assert_eq!(clear_output_dir(&dir.path().join("absent")), 0);
    }

    #[test]
    fn reported_outputs_prefer_newest_existing_video() {
        let dir = tempdir().unwrap();
        write_with_mtime(&dir.path().join("InfiniteTalk_00001.mp4"), Duration::from_secs(30));
        write_with_mtime(&dir.path().join("InfiniteTalk_00002.mp4"), Duration::from_secs(2));
        let reported = vec![
            PathBuf::from("InfiniteTalk_00001.mp4"),
            PathBuf::from("InfiniteTalk_00002.mp4"),
            PathBuf::from("InfiniteTalk_00002.png"),
            PathBuf::from("vanished.mp4"),
        ];

        let picked = select_reported_video(dir.path(), &reported).unwrap();
        assert_eq!(picked, dir.path().join("InfiniteTalk_00002.mp4"));
        assert!(select_reported_video(dir.path(), &[]).is_none());
    }
}
