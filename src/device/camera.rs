/// Camera capture
///
/// A camera hands out [`MediaStream`]s made of tracks. Stopping a stream
/// (explicitly or by dropping it) stops every track, which is what releases
/// the device. Steps that own a stream therefore release the camera as soon
/// as they are replaced.
use image::DynamicImage;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Frame file extensions the tether directory may contain
const FRAME_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("Camera access was denied. Please allow camera access and try again.")]
    PermissionDenied,

    #[error("No camera found on this device.")]
    NotFound,

    #[error("Error accessing camera: {0}")]
    Access(String),

    #[error("Waiting for the camera to deliver a frame.")]
    NoFrame,
}

impl CameraError {
    fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => CameraError::PermissionDenied,
            io::ErrorKind::NotFound => CameraError::NotFound,
            _ => CameraError::Access(err.to_string()),
        }
    }
}

/// Which way the camera should face
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacingMode {
    /// Selfie camera, used for the badge photo
    User,
    /// Rear camera, used to scan the event code
    Environment,
}

/// One live source inside a stream
#[derive(Debug)]
pub struct MediaTrack {
    label: String,
    live: Arc<AtomicBool>,
}

impl MediaTrack {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Shared liveness flag, kept by the camera to enforce a single
    /// acquisition
    pub fn liveness(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.live)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

/// A live camera stream
#[derive(Debug)]
pub struct MediaStream {
    facing: FacingMode,
    tracks: Vec<MediaTrack>,
    started_at: SystemTime,
}

impl MediaStream {
    pub fn new(facing: FacingMode, tracks: Vec<MediaTrack>) -> Self {
        Self {
            facing,
            tracks,
            started_at: SystemTime::now(),
        }
    }

    /// When the stream was acquired. Frames older than this belong to an
    /// earlier stream.
    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// True while at least one track is still live
    pub fn is_active(&self) -> bool {
        self.tracks.iter().any(MediaTrack::is_live)
    }

    /// Stop every track
    pub fn stop(&mut self) {
        if self.is_active() {
            debug!(facing = ?self.facing, "stopping camera stream");
        }
        for track in self.tracks.iter().filter(|t| t.is_live()) {
            track.stop();
            debug!(track = track.label(), "track stopped");
        }
    }
}

impl Drop for MediaStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Camera capture service
pub trait Camera {
    /// Request the device. Any stream from an earlier acquisition is assumed
    /// released.
    fn acquire(&mut self, facing: FacingMode) -> Result<MediaStream, CameraError>;

    /// Grab the current frame of a live stream
    fn capture_frame(&mut self, stream: &MediaStream) -> Result<DynamicImage, CameraError>;

    /// Number of tracks handed out that are still live
    fn live_tracks(&self) -> usize;
}

/// Tethered camera: the capture device writes still frames into a folder,
/// and the newest image file there is the live frame.
#[derive(Debug)]
pub struct DirectoryCamera {
    dir: PathBuf,
    issued: Vec<Arc<AtomicBool>>,
}

impl DirectoryCamera {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            issued: Vec::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Find the most recently modified frame file written after `since`
    fn newest_frame(&self, since: SystemTime) -> Result<Option<PathBuf>, CameraError> {
        let mut newest: Option<(SystemTime, PathBuf)> = None;

        for entry in WalkDir::new(&self.dir).max_depth(1).into_iter() {
            let entry = entry.map_err(|e| match e.into_io_error() {
                Some(io_err) => CameraError::from_io(io_err),
                None => CameraError::Access("tether directory loop".to_string()),
            })?;
            let path = entry.path();
            if !path.is_file() || !is_frame_file(path) {
                continue;
            }

            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            if modified <= since {
                continue;
            }

            let is_newer = match &newest {
                Some((time, current)) => modified > *time || (modified == *time && path > current.as_path()),
                None => true,
            };
            if is_newer {
                newest = Some((modified, path.to_path_buf()));
            }
        }

        Ok(newest.map(|(_, path)| path))
    }
}

fn is_frame_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| FRAME_EXTENSIONS.contains(&ext.as_str()))
}

impl Camera for DirectoryCamera {
    fn acquire(&mut self, facing: FacingMode) -> Result<MediaStream, CameraError> {
        let still_live = self.issued.iter().filter(|t| t.load(Ordering::SeqCst)).count();
        if still_live > 0 {
            warn!(still_live, "previous camera stream was not released, stopping it");
        }
        for track in self.issued.drain(..) {
            track.store(false, Ordering::SeqCst);
        }

        std::fs::read_dir(&self.dir).map_err(CameraError::from_io)?;

        let track = MediaTrack::new(format!("tether:{}", self.dir.display()));
        self.issued.push(track.liveness());
        info!(dir = %self.dir.display(), ?facing, "camera acquired");

        Ok(MediaStream::new(facing, vec![track]))
    }

    fn capture_frame(&mut self, stream: &MediaStream) -> Result<DynamicImage, CameraError> {
        if !stream.is_active() {
            return Err(CameraError::Access("camera stream has been stopped".to_string()));
        }

        let path = self
            .newest_frame(stream.started_at())?
            .ok_or(CameraError::NoFrame)?;

        image::open(&path).map_err(|e| CameraError::Access(format!("{}: {e}", path.display())))
    }

    fn live_tracks(&self) -> usize {
        self.issued.iter().filter(|t| t.load(Ordering::SeqCst)).count()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn write_frame(dir: &Path, name: &str, color: [u8; 3]) {
        RgbImage::from_pixel(8, 8, Rgb(color)).save(dir.join(name)).unwrap();
    }

    #[test]
    fn test_stream_drop_stops_tracks() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = DirectoryCamera::new(dir.path());

        let stream = camera.acquire(FacingMode::User).unwrap();
        assert_eq!(camera.live_tracks(), 1);
        drop(stream);
        assert_eq!(camera.live_tracks(), 0);
    }

    #[test]
    fn test_reacquire_stops_previous_tracks() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = DirectoryCamera::new(dir.path());

        let first = camera.acquire(FacingMode::Environment).unwrap();
        let second = camera.acquire(FacingMode::User).unwrap();
        assert!(!first.is_active());
        assert!(second.is_active());
        assert_eq!(camera.live_tracks(), 1);
    }

    #[test]
    fn test_missing_directory_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = DirectoryCamera::new(dir.path().join("absent"));
        assert_eq!(camera.acquire(FacingMode::User).unwrap_err(), CameraError::NotFound);
    }

    fn pause() {
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    #[test]
    fn test_capture_reads_newest_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = DirectoryCamera::new(dir.path());
        let stream = camera.acquire(FacingMode::User).unwrap();

        pause();
        write_frame(dir.path(), "a.png", [255, 0, 0]);
        pause();
        write_frame(dir.path(), "b.png", [0, 255, 0]);
        std::fs::write(dir.path().join("notes.txt"), "not a frame").unwrap();

        let frame = camera.capture_frame(&stream).unwrap().to_rgb8();
        assert_eq!(frame.get_pixel(0, 0), &Rgb([0, 255, 0]));
    }

    #[test]
    fn test_frames_from_before_acquire_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write_frame(dir.path(), "scan.png", [1, 2, 3]);
        pause();

        let mut camera = DirectoryCamera::new(dir.path());
        let stream = camera.acquire(FacingMode::User).unwrap();
        assert_eq!(camera.capture_frame(&stream).unwrap_err(), CameraError::NoFrame);

        pause();
        write_frame(dir.path(), "selfie.png", [9, 9, 9]);
        let frame = camera.capture_frame(&stream).unwrap().to_rgb8();
        assert_eq!(frame.get_pixel(0, 0), &Rgb([9, 9, 9]));
    }

    #[test]
    fn test_capture_after_stop_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_frame(dir.path(), "a.png", [1, 2, 3]);
        let mut camera = DirectoryCamera::new(dir.path());

        let mut stream = camera.acquire(FacingMode::User).unwrap();
        stream.stop();
        assert!(matches!(camera.capture_frame(&stream), Err(CameraError::Access(_))));
    }

    #[test]
    fn test_empty_directory_has_no_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = DirectoryCamera::new(dir.path());
        let stream = camera.acquire(FacingMode::User).unwrap();
        assert_eq!(camera.capture_frame(&stream).unwrap_err(), CameraError::NoFrame);
    }
}
