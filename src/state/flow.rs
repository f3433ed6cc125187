/// Badge issuance flow
///
/// The kiosk walks through `Scan -> Register -> Capture -> Badge`. Each page
/// is a variant of [`Step`] that owns its own state (including any live
/// camera stream), so replacing the current step is what releases the
/// camera. Guards run when a step is entered and again when it acts, and the
/// only write to the badge store happens in [`CaptureStep::finalize`].
use chrono::{DateTime, Utc};
use image::DynamicImage;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::data::{badge_id_for, BadgeRecord, MAX_BADGES_PER_DEVICE};
use super::ledger::BadgeLedger;
use super::session::RegistrationSession;
use super::store::KeyValueStore;
use crate::device::camera::{Camera, CameraError, FacingMode, MediaStream};
use crate::device::photo::Photo;
use crate::device::qr::{QrDecoder, ScanError};
use crate::error::BadgeError;

/// Pages of the kiosk. Only the carried name travels between pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Home,
    Scan,
    Register,
    PhotoCapture { name: Option<String> },
    Badge,
}

/// Message shown under the scanner
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanNotice {
    #[error("Invalid event QR code scanned.")]
    InvalidCode,

    #[error("This device has already issued its {max} badges. Please go to 'My Badge'.")]
    DeviceAtLimit { max: usize },

    #[error("Failed to scan QR code. Please ensure camera access is allowed and try again.")]
    ScanFailed,

    #[error(transparent)]
    Camera(CameraError),

    #[error("{0}")]
    Storage(String),
}

/// What a single decode event did to the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Nothing decoded, or the gate is locked
    Idle,
    /// Event code accepted, registration session granted
    Granted,
    /// A code was read but refused
    Rejected,
    /// The scanner reported an error
    Failed,
}

/// Scan gate: waits for the event code on the environment camera
#[derive(Debug)]
pub struct ScanGate {
    stream: Option<MediaStream>,
    locked: bool,
    last_scan: Option<String>,
    notice: Option<ScanNotice>,
}

impl ScanGate {
    /// Enter the gate. Always drops any session left over from a previous
    /// visit before anything else.
    pub fn enter<P, S, C>(
        ledger: &BadgeLedger<P>,
        session: &mut RegistrationSession<S>,
        camera: &mut C,
    ) -> Self
    where
        P: KeyValueStore,
        S: KeyValueStore,
        C: Camera,
    {
        if let Err(e) = session.clear() {
            warn!(error = %e, "could not clear registration session");
        }

        let mut gate = ScanGate {
            stream: None,
            locked: false,
            last_scan: None,
            notice: None,
        };

        match ledger.is_full() {
            Ok(false) => {}
            Ok(true) => {
                gate.locked = true;
                gate.notice = Some(ScanNotice::DeviceAtLimit {
                    max: MAX_BADGES_PER_DEVICE,
                });
                return gate;
            }
            Err(e) => {
                gate.locked = true;
                gate.notice = Some(ScanNotice::Storage(e.to_string()));
                return gate;
            }
        }

        match camera.acquire(FacingMode::Environment) {
            Ok(stream) => gate.stream = Some(stream),
            Err(e) => {
                warn!(error = %e, "scanner camera unavailable");
                gate.notice = Some(ScanNotice::Camera(e));
            }
        }
        gate
    }

    /// Handle one result from the QR decoder
    pub fn on_decode<P, S>(
        &mut self,
        event: Result<Option<String>, ScanError>,
        event_code: &str,
        ledger: &BadgeLedger<P>,
        session: &mut RegistrationSession<S>,
    ) -> ScanOutcome
    where
        P: KeyValueStore,
        S: KeyValueStore,
    {
        if self.locked {
            return ScanOutcome::Idle;
        }

        match event {
            Ok(None) => ScanOutcome::Idle,
            Ok(Some(text)) => {
                let matches = text == event_code;
                self.last_scan = Some(text);
                self.notice = None;

                if !matches {
                    warn!("invalid event code scanned");
                    self.notice = Some(ScanNotice::InvalidCode);
                    return ScanOutcome::Rejected;
                }

                match ledger.is_full() {
                    Ok(false) => match session.grant() {
                        Ok(()) => {
                            info!("event code accepted");
                            ScanOutcome::Granted
                        }
                        Err(e) => {
                            self.notice = Some(ScanNotice::Storage(e.to_string()));
                            ScanOutcome::Failed
                        }
                    },
                    Ok(true) => {
                        self.locked = true;
                        self.notice = Some(ScanNotice::DeviceAtLimit {
                            max: MAX_BADGES_PER_DEVICE,
                        });
                        ScanOutcome::Rejected
                    }
                    Err(e) => {
                        self.notice = Some(ScanNotice::Storage(e.to_string()));
                        ScanOutcome::Failed
                    }
                }
            }
            Err(ScanError::Camera(e @ (CameraError::PermissionDenied | CameraError::NotFound))) => {
                self.notice = Some(ScanNotice::Camera(e));
                ScanOutcome::Failed
            }
            Err(e) => {
                info!(error = %e, "QR scan error");
                self.notice = Some(ScanNotice::ScanFailed);
                ScanOutcome::Failed
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn is_scanning(&self) -> bool {
        self.stream.as_ref().is_some_and(MediaStream::is_active)
    }

    pub fn last_scan(&self) -> Option<&str> {
        self.last_scan.as_deref()
    }

    pub fn notice(&self) -> Option<&ScanNotice> {
        self.notice.as_ref()
    }
}

/// Registration page: collects the participant's name
#[derive(Debug, Default)]
pub struct Registration {
    input: String,
    disabled: bool,
    error: Option<BadgeError>,
}

impl Registration {
    /// Enter registration. A full device shows the limit whatever the
    /// session says; otherwise a missing session sends the user to the scan
    /// gate.
    pub fn enter<P, S>(
        ledger: &BadgeLedger<P>,
        session: &mut RegistrationSession<S>,
    ) -> Result<Self, Route>
    where
        P: KeyValueStore,
        S: KeyValueStore,
    {
        if let Err(e) = ledger.ensure_capacity() {
            if matches!(e, BadgeError::CapReached { .. }) {
                if let Err(clear_err) = session.clear() {
                    warn!(error = %clear_err, "could not clear registration session");
                }
            }
            return Ok(Registration {
                input: String::new(),
                disabled: true,
                error: Some(e),
            });
        }

        match session.is_granted() {
            Ok(true) => Ok(Registration::default()),
            Ok(false) => {
                info!("registration opened without a scan");
                Err(Route::Scan)
            }
            Err(e) => {
                warn!(error = %e, "could not read registration session");
                Err(Route::Scan)
            }
        }
    }

    /// Validate the name and re-check the session and the cap.
    /// Returns the trimmed name to carry to the capture step.
    pub fn submit_name<P, S>(
        &mut self,
        text: &str,
        ledger: &BadgeLedger<P>,
        session: &mut RegistrationSession<S>,
    ) -> Result<String, BadgeError>
    where
        P: KeyValueStore,
        S: KeyValueStore,
    {
        let name = text.trim();
        if name.is_empty() {
            return Err(BadgeError::Validation);
        }

        if !session.is_granted()? {
            return Err(BadgeError::SessionExpired);
        }

        if let Err(e) = ledger.ensure_capacity() {
            if matches!(e, BadgeError::CapReached { .. }) {
                self.disabled = true;
                session.clear()?;
            }
            return Err(e);
        }

        Ok(name.to_string())
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn error(&self) -> Option<&BadgeError> {
        self.error.as_ref()
    }
}

/// Camera state of the capture page
#[derive(Debug)]
pub enum CaptureState {
    NoCamera { error: Option<CameraError> },
    CameraActive { stream: MediaStream },
    PhotoCaptured { photo: Photo },
    Finalized { record: BadgeRecord },
}

/// Photo capture page
#[derive(Debug)]
pub struct CaptureStep {
    name: Option<String>,
    state: CaptureState,
    error: Option<BadgeError>,
}

impl CaptureStep {
    /// Enter with the name carried from registration. Without one the user
    /// goes back to registration.
    pub fn enter<C: Camera>(name: Option<String>, camera: &mut C) -> Result<Self, Route> {
        let Some(name) = name.filter(|n| !n.trim().is_empty()) else {
            info!("photo capture opened without a name");
            return Err(Route::Register);
        };

        let mut step = CaptureStep {
            name: Some(name),
            state: CaptureState::NoCamera { error: None },
            error: None,
        };
        step.start_camera(camera);
        Ok(step)
    }

    fn start_camera<C: Camera>(&mut self, camera: &mut C) {
        self.state = match camera.acquire(FacingMode::User) {
            Ok(stream) => CaptureState::CameraActive { stream },
            Err(e) => {
                warn!(error = %e, "photo camera unavailable");
                CaptureState::NoCamera { error: Some(e) }
            }
        };
    }

    /// Take a still from the live stream and release the camera
    pub fn capture<C: Camera>(&mut self, camera: &mut C) -> Result<(), BadgeError> {
        let CaptureState::CameraActive { stream } = &self.state else {
            return Err(self.camera_unavailable());
        };

        let frame = camera.capture_frame(stream)?;
        let photo = Photo::from_frame(&frame)?;
        debug!(bytes = photo.data_url().len(), "photo captured");

        // The replaced state owns the stream; dropping it stops the tracks
        self.state = CaptureState::PhotoCaptured { photo };
        Ok(())
    }

    /// Throw the captured photo away and reopen the camera
    pub fn retake<C: Camera>(&mut self, camera: &mut C) -> Result<(), BadgeError> {
        if !matches!(self.state, CaptureState::PhotoCaptured { .. }) {
            return Err(BadgeError::MissingPhoto);
        }
        self.start_camera(camera);
        match &self.state {
            CaptureState::NoCamera { error: Some(e) } => Err(BadgeError::Camera(e.clone())),
            _ => Ok(()),
        }
    }

    /// Try the camera again after an acquisition failure
    pub fn retry_camera<C: Camera>(&mut self, camera: &mut C) -> Result<(), BadgeError> {
        if !matches!(self.state, CaptureState::NoCamera { .. }) {
            return Ok(());
        }
        self.start_camera(camera);
        match &self.state {
            CaptureState::NoCamera { error: Some(e) } => Err(BadgeError::Camera(e.clone())),
            _ => Ok(()),
        }
    }

    /// Issue the badge: the single point where a record is persisted
    pub fn finalize<P, S>(
        &mut self,
        ledger: &mut BadgeLedger<P>,
        session: &mut RegistrationSession<S>,
        issued_at: DateTime<Utc>,
    ) -> Result<BadgeRecord, BadgeError>
    where
        P: KeyValueStore,
        S: KeyValueStore,
    {
        let CaptureState::PhotoCaptured { photo } = &self.state else {
            return Err(BadgeError::MissingPhoto);
        };
        let name = self.name.as_deref().ok_or(BadgeError::MissingName)?;

        let record = ledger.issue(name, photo.clone(), issued_at)?;

        if let Err(e) = session.clear() {
            warn!(error = %e, "badge issued but registration session could not be cleared");
        }

        self.state = CaptureState::Finalized {
            record: record.clone(),
        };
        Ok(record)
    }

    fn camera_unavailable(&self) -> BadgeError {
        match &self.state {
            CaptureState::NoCamera { error: Some(e) } => BadgeError::Camera(e.clone()),
            _ => BadgeError::Camera(CameraError::Access("camera is not active".to_string())),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> &CaptureState {
        &self.state
    }

    pub fn error(&self) -> Option<&BadgeError> {
        self.error.as_ref()
    }
}

/// Badge page content
#[derive(Debug)]
pub enum BadgeView {
    /// Nothing issued on this device yet
    Missing,
    /// Storage could not be read
    Unavailable(BadgeError),
    Ready(BadgeRecord),
}

impl BadgeView {
    pub fn load<P: KeyValueStore>(ledger: &BadgeLedger<P>) -> Self {
        match ledger.latest() {
            Ok(Some(record)) => BadgeView::Ready(record),
            Ok(None) => BadgeView::Missing,
            Err(e) => {
                warn!(error = %e, "failed to load badge data");
                BadgeView::Unavailable(e)
            }
        }
    }
}

/// Current page and its state
#[derive(Debug)]
pub enum Step {
    Home,
    Scan(ScanGate),
    Register(Registration),
    Capture(CaptureStep),
    Badge(BadgeView),
}

/// The kiosk: storage, camera and the current step
pub struct Flow<P, S, C> {
    ledger: BadgeLedger<P>,
    session: RegistrationSession<S>,
    camera: C,
    event_code: String,
    step: Step,
}

impl<P, S, C> Flow<P, S, C>
where
    P: KeyValueStore,
    S: KeyValueStore,
    C: Camera,
{
    pub fn new(
        ledger: BadgeLedger<P>,
        session: RegistrationSession<S>,
        camera: C,
        event_code: impl Into<String>,
    ) -> Self {
        Self {
            ledger,
            session,
            camera,
            event_code: event_code.into(),
            step: Step::Home,
        }
    }

    pub fn step(&self) -> &Step {
        &self.step
    }

    pub fn ledger(&self) -> &BadgeLedger<P> {
        &self.ledger
    }

    #[cfg(test)]
    pub fn session(&self) -> &RegistrationSession<S> {
        &self.session
    }

    pub fn camera(&self) -> &C {
        &self.camera
    }

    /// Route of the current step
    pub fn route(&self) -> Route {
        match &self.step {
            Step::Home => Route::Home,
            Step::Scan(_) => Route::Scan,
            Step::Register(_) => Route::Register,
            Step::Capture(capture) => Route::PhotoCapture {
                name: capture.name.clone(),
            },
            Step::Badge(_) => Route::Badge,
        }
    }

    /// Leave the current step and enter `route`, following redirects
    pub fn navigate(&mut self, route: Route) {
        // Drop the old step first so its camera stream is stopped before
        // the next step acquires one
        self.step = Step::Home;

        let mut route = route;
        loop {
            debug!(?route, "entering step");
            match self.enter(route) {
                Ok(step) => {
                    self.step = step;
                    return;
                }
                Err(redirect) => route = redirect,
            }
        }
    }

    fn enter(&mut self, route: Route) -> Result<Step, Route> {
        match route {
            Route::Home => Ok(Step::Home),
            Route::Scan => Ok(Step::Scan(ScanGate::enter(
                &self.ledger,
                &mut self.session,
                &mut self.camera,
            ))),
            Route::Register => Registration::enter(&self.ledger, &mut self.session).map(Step::Register),
            Route::PhotoCapture { name } => {
                CaptureStep::enter(name, &mut self.camera).map(Step::Capture)
            }
            Route::Badge => Ok(Step::Badge(BadgeView::load(&self.ledger))),
        }
    }

    /// Grab a frame at the scan gate and feed it to the decoder.
    /// Returns the frame for the live preview.
    pub fn poll_scanner<D: QrDecoder>(&mut self, decoder: &D) -> Option<DynamicImage> {
        let Step::Scan(gate) = &mut self.step else {
            return None;
        };
        if gate.locked {
            return None;
        }
        let stream = gate.stream.as_ref()?;

        let (frame, event) = match self.camera.capture_frame(stream) {
            Ok(frame) => {
                let event = decoder.decode(&frame);
                (Some(frame), event)
            }
            Err(CameraError::NoFrame) => (None, Ok(None)),
            Err(e) => (None, Err(ScanError::Camera(e))),
        };

        let outcome = gate.on_decode(event, &self.event_code, &self.ledger, &mut self.session);
        if outcome == ScanOutcome::Granted {
            self.navigate(Route::Register);
        }
        frame
    }

    /// Current frame of an active photo camera, for the live preview
    pub fn preview_frame(&mut self) -> Option<DynamicImage> {
        let Step::Capture(capture) = &self.step else {
            return None;
        };
        let CaptureState::CameraActive { stream } = &capture.state else {
            return None;
        };
        self.camera.capture_frame(stream).ok()
    }

    pub fn edit_name(&mut self, text: String) {
        if let Step::Register(registration) = &mut self.step {
            if !registration.disabled {
                registration.input = text;
            }
        }
    }

    pub fn submit_name(&mut self, text: &str) {
        let Step::Register(registration) = &mut self.step else {
            return;
        };

        match registration.submit_name(text, &self.ledger, &mut self.session) {
            Ok(name) => self.navigate(Route::PhotoCapture { name: Some(name) }),
            Err(BadgeError::SessionExpired) => {
                warn!("registration session expired");
                self.navigate(Route::Scan);
            }
            Err(e) => registration.error = Some(e),
        }
    }

    pub fn capture_photo(&mut self) {
        if let Step::Capture(capture) = &mut self.step {
            capture.error = capture.capture(&mut self.camera).err();
        }
    }

    pub fn retake_photo(&mut self) {
        if let Step::Capture(capture) = &mut self.step {
            capture.error = capture.retake(&mut self.camera).err();
        }
    }

    pub fn retry_camera(&mut self) {
        if let Step::Capture(capture) = &mut self.step {
            capture.error = capture.retry_camera(&mut self.camera).err();
        }
    }

    /// Confirm the captured photo; on success the badge page is shown
    pub fn finalize(&mut self, issued_at: DateTime<Utc>) {
        let Step::Capture(capture) = &mut self.step else {
            return;
        };

        match capture.finalize(&mut self.ledger, &mut self.session, issued_at) {
            Ok(_) => self.navigate(Route::Badge),
            Err(e) => {
                warn!(error = %e, "badge not issued");
                capture.error = Some(e);
            }
        }
    }

    /// Identifier the next badge will carry, for the confirm button
    pub fn next_badge_id(&self) -> Option<String> {
        self.ledger.next_badge_number().ok().map(badge_id_for)
    }

    /// Explicit user-requested reset of corrupt storage. The current page
    /// is entered again afterwards.
    pub fn reset_storage(&mut self) {
        if let Err(e) = self.ledger.reset() {
            warn!(error = %e, "storage reset failed");
            return;
        }
        let route = self.route();
        self.navigate(route);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::camera::fake::FakeCamera;
    use crate::device::camera::DirectoryCamera;
    use crate::device::qr::fake::ScriptedDecoder;
    use crate::state::ledger::{BADGES_KEY, LAST_BADGE_NUMBER_KEY};
    use crate::state::session::CAN_REGISTER_KEY;
    use crate::state::store::MemoryStore;
    use image::{Rgb, RgbImage};

    const EVENT_CODE: &str = "MITUKI-BADGE-SCAN";

    type TestFlow = Flow<MemoryStore, MemoryStore, FakeCamera>;

    fn flow_with(store: MemoryStore, camera: FakeCamera) -> TestFlow {
        Flow::new(
            BadgeLedger::new(store),
            RegistrationSession::new(MemoryStore::new()),
            camera,
            EVENT_CODE,
        )
    }

    fn new_flow() -> TestFlow {
        flow_with(MemoryStore::new(), FakeCamera::default())
    }

    fn photo() -> Photo {
        Photo::from_data_url("data:image/png;base64,AAAA")
    }

    fn scan(flow: &mut TestFlow, result: Result<Option<String>, ScanError>) {
        flow.poll_scanner(&ScriptedDecoder::new(vec![result]));
    }

    /// Scan the event code and submit a name
    fn register(flow: &mut TestFlow, name: &str) {
        flow.navigate(Route::Scan);
        scan(flow, Ok(Some(EVENT_CODE.to_string())));
        assert_eq!(flow.route(), Route::Register);
        flow.submit_name(name);
    }

    fn issue_badge(flow: &mut TestFlow, name: &str) {
        register(flow, name);
        flow.capture_photo();
        flow.finalize(Utc::now());
    }

    #[test]
    fn test_scan_gate_clears_stale_session() {
        let mut flow = new_flow();
        flow.session.grant().unwrap();

        flow.navigate(Route::Scan);
        assert!(!flow.session().is_granted().unwrap());
    }

    #[test]
    fn test_event_code_grants_session() {
        let mut flow = new_flow();
        flow.navigate(Route::Scan);
        scan(&mut flow, Ok(Some(EVENT_CODE.to_string())));

        assert_eq!(flow.route(), Route::Register);
        assert!(flow.session().is_granted().unwrap());
        // Leaving the gate released the scanner camera
        assert_eq!(flow.camera().live_tracks(), 0);
    }

    #[test]
    fn test_invalid_code_changes_nothing() {
        let mut flow = new_flow();
        flow.navigate(Route::Scan);
        scan(&mut flow, Ok(Some("SOMETHING-ELSE".to_string())));

        let Step::Scan(gate) = flow.step() else { panic!("left the scan gate") };
        assert_eq!(gate.notice(), Some(&ScanNotice::InvalidCode));
        assert_eq!(gate.last_scan(), Some("SOMETHING-ELSE"));
        assert!(!flow.session().is_granted().unwrap());
    }

    #[test]
    fn test_full_device_locks_the_gate() {
        let mut flow = new_flow();
        for i in 0..MAX_BADGES_PER_DEVICE {
            flow.ledger.issue(&format!("Guest {i}"), photo(), Utc::now()).unwrap();
        }

        flow.navigate(Route::Scan);
        let Step::Scan(gate) = flow.step() else { panic!("left the scan gate") };
        assert!(gate.is_locked());
        assert!(!gate.is_scanning());
        assert_eq!(gate.notice(), Some(&ScanNotice::DeviceAtLimit { max: 5 }));
        assert!(!flow.session().is_granted().unwrap());
    }

    #[test]
    fn test_event_code_when_cap_reached_while_scanning() {
        let mut flow = new_flow();
        flow.navigate(Route::Scan);
        for i in 0..MAX_BADGES_PER_DEVICE {
            flow.ledger.issue(&format!("Guest {i}"), photo(), Utc::now()).unwrap();
        }

        scan(&mut flow, Ok(Some(EVENT_CODE.to_string())));
        let Step::Scan(gate) = flow.step() else { panic!("left the scan gate") };
        assert_eq!(gate.notice(), Some(&ScanNotice::DeviceAtLimit { max: 5 }));
        assert!(!flow.session().is_granted().unwrap());
    }

    #[test]
    fn test_scan_errors_are_distinct() {
        let mut flow = new_flow();
        flow.navigate(Route::Scan);

        scan(&mut flow, Err(ScanError::Decode("format error".to_string())));
        let Step::Scan(gate) = flow.step() else { panic!("left the scan gate") };
        assert_eq!(gate.notice(), Some(&ScanNotice::ScanFailed));

        scan(&mut flow, Err(ScanError::Camera(CameraError::PermissionDenied)));
        let Step::Scan(gate) = flow.step() else { panic!("left the scan gate") };
        assert_eq!(gate.notice(), Some(&ScanNotice::Camera(CameraError::PermissionDenied)));
    }

    #[test]
    fn test_scanner_camera_failure() {
        let mut flow = flow_with(MemoryStore::new(), FakeCamera::failing(CameraError::NotFound));
        flow.navigate(Route::Scan);

        let Step::Scan(gate) = flow.step() else { panic!("left the scan gate") };
        assert!(!gate.is_scanning());
        assert_eq!(gate.notice(), Some(&ScanNotice::Camera(CameraError::NotFound)));
    }

    #[test]
    fn test_register_without_scan_redirects() {
        let mut flow = new_flow();
        flow.navigate(Route::Register);
        assert_eq!(flow.route(), Route::Scan);
    }

    #[test]
    fn test_capture_without_name_redirects() {
        let mut flow = new_flow();
        flow.session.grant().unwrap();
        flow.navigate(Route::PhotoCapture { name: None });
        assert_eq!(flow.route(), Route::Register);

        // Without a session the redirect continues to the scan gate
        let mut flow = new_flow();
        flow.navigate(Route::PhotoCapture { name: None });
        assert_eq!(flow.route(), Route::Scan);
    }

    #[test]
    fn test_blank_names_fail_validation() {
        let mut flow = new_flow();
        flow.navigate(Route::Scan);
        scan(&mut flow, Ok(Some(EVENT_CODE.to_string())));

        for blank in ["", "   "] {
            flow.submit_name(blank);
            let Step::Register(registration) = flow.step() else { panic!("left registration") };
            assert!(matches!(registration.error(), Some(BadgeError::Validation)));
        }
    }

    #[test]
    fn test_valid_name_is_carried_forward() {
        let mut flow = new_flow();
        register(&mut flow, "Alice");

        let Step::Capture(capture) = flow.step() else { panic!("not on capture") };
        assert_eq!(capture.name(), Some("Alice"));
        assert!(matches!(capture.state(), CaptureState::CameraActive { .. }));
        // Nothing is stored before the badge is finalized
        assert_eq!(flow.ledger().store().get(BADGES_KEY).unwrap(), None);
    }

    #[test]
    fn test_name_is_trimmed() {
        let mut flow = new_flow();
        register(&mut flow, "  Bob  ");
        assert_eq!(flow.route(), Route::PhotoCapture { name: Some("Bob".to_string()) });
    }

    #[test]
    fn test_expired_session_returns_to_scan() {
        let mut flow = new_flow();
        flow.navigate(Route::Scan);
        scan(&mut flow, Ok(Some(EVENT_CODE.to_string())));

        flow.session.clear().unwrap();
        flow.submit_name("Alice");
        assert_eq!(flow.route(), Route::Scan);
    }

    #[test]
    fn test_submit_rechecks_cap() {
        let mut registration = Registration::default();
        let mut ledger = BadgeLedger::new(MemoryStore::new());
        let mut session = RegistrationSession::new(MemoryStore::new());
        session.grant().unwrap();
        for i in 0..MAX_BADGES_PER_DEVICE {
            ledger.issue(&format!("Guest {i}"), photo(), Utc::now()).unwrap();
        }

        let err = registration.submit_name("Alice", &ledger, &mut session).unwrap_err();
        assert!(matches!(err, BadgeError::CapReached { max: 5 }));
        assert!(registration.is_disabled());
        assert!(!session.is_granted().unwrap());
    }

    #[test]
    fn test_full_device_disables_registration() {
        let mut flow = new_flow();
        for i in 0..MAX_BADGES_PER_DEVICE {
            flow.ledger.issue(&format!("Guest {i}"), photo(), Utc::now()).unwrap();
        }
        flow.session.grant().unwrap();

        flow.navigate(Route::Register);
        let Step::Register(registration) = flow.step() else { panic!("not on registration") };
        assert!(registration.is_disabled());
        assert!(matches!(registration.error(), Some(BadgeError::CapReached { .. })));
        assert!(!flow.session().is_granted().unwrap());
    }

    #[test]
    fn test_full_issuance() {
        let mut flow = new_flow();
        issue_badge(&mut flow, "Alice");

        let Step::Badge(BadgeView::Ready(record)) = flow.step() else {
            panic!("badge not shown")
        };
        assert_eq!(record.participant_name(), "Alice");
        assert_eq!(record.badge_id(), "GR2520");
        assert!(!flow.session().is_granted().unwrap());
        assert_eq!(flow.ledger().last_issued_number().unwrap(), Some(2520));
        assert_eq!(flow.camera().live_tracks(), 0);
    }

    #[test]
    fn test_sequential_badges_until_cap() {
        let mut flow = new_flow();
        for i in 0..MAX_BADGES_PER_DEVICE {
            issue_badge(&mut flow, &format!("Guest {i}"));
        }

        let numbers: Vec<u32> = flow
            .ledger()
            .load()
            .unwrap()
            .iter()
            .map(BadgeRecord::badge_number)
            .collect();
        assert_eq!(numbers, vec![2520, 2521, 2522, 2523, 2524]);

        flow.navigate(Route::Scan);
        let Step::Scan(gate) = flow.step() else { panic!("left the scan gate") };
        assert!(gate.is_locked());
    }

    #[test]
    fn test_finalize_without_photo() {
        let mut flow = new_flow();
        register(&mut flow, "Alice");
        flow.finalize(Utc::now());

        let Step::Capture(capture) = flow.step() else { panic!("left capture") };
        assert!(matches!(capture.error(), Some(BadgeError::MissingPhoto)));
        assert_eq!(flow.ledger().count().unwrap(), 0);
    }

    #[test]
    fn test_finalize_without_name() {
        let mut ledger = BadgeLedger::new(MemoryStore::new());
        let mut session = RegistrationSession::new(MemoryStore::new());
        let mut step = CaptureStep {
            name: None,
            state: CaptureState::PhotoCaptured { photo: photo() },
            error: None,
        };

        let err = step.finalize(&mut ledger, &mut session, Utc::now()).unwrap_err();
        assert!(matches!(err, BadgeError::MissingName));
        assert_eq!(ledger.count().unwrap(), 0);
    }

    #[test]
    fn test_finalize_rechecks_cap_at_write() {
        let mut flow = new_flow();
        register(&mut flow, "Alice");
        flow.capture_photo();

        // Another writer fills the device between capture and confirm
        for i in 0..MAX_BADGES_PER_DEVICE {
            flow.ledger.issue(&format!("Guest {i}"), photo(), Utc::now()).unwrap();
        }
        let before = flow.ledger().store().get(BADGES_KEY).unwrap();

        flow.finalize(Utc::now());
        let Step::Capture(capture) = flow.step() else { panic!("left capture") };
        assert!(matches!(capture.error(), Some(BadgeError::CapReached { max: 5 })));
        assert_eq!(flow.ledger().store().get(BADGES_KEY).unwrap(), before);
    }

    #[test]
    fn test_capture_stops_camera_and_retake_restarts() {
        let mut flow = new_flow();
        register(&mut flow, "Alice");
        assert_eq!(flow.camera().live_tracks(), 1);

        flow.capture_photo();
        let Step::Capture(capture) = flow.step() else { panic!("left capture") };
        assert!(matches!(capture.state(), CaptureState::PhotoCaptured { .. }));
        assert_eq!(flow.camera().live_tracks(), 0);

        flow.retake_photo();
        let Step::Capture(capture) = flow.step() else { panic!("left capture") };
        assert!(matches!(capture.state(), CaptureState::CameraActive { .. }));
        assert_eq!(flow.camera().live_tracks(), 1);
    }

    #[test]
    fn test_leaving_mid_stream_releases_camera() {
        let mut flow = new_flow();
        register(&mut flow, "Alice");
        assert_eq!(flow.camera().live_tracks(), 1);

        flow.navigate(Route::Home);
        assert_eq!(flow.camera().live_tracks(), 0);
    }

    #[test]
    fn test_photo_camera_denied() {
        let mut flow = flow_with(MemoryStore::new(), FakeCamera::default());
        register(&mut flow, "Alice");
        flow.camera.fail_with = Some(CameraError::PermissionDenied);
        flow.navigate(Route::PhotoCapture { name: Some("Alice".to_string()) });

        let Step::Capture(capture) = flow.step() else { panic!("left capture") };
        assert!(matches!(
            capture.state(),
            CaptureState::NoCamera { error: Some(CameraError::PermissionDenied) }
        ));

        flow.capture_photo();
        let Step::Capture(capture) = flow.step() else { panic!("left capture") };
        assert!(matches!(
            capture.error(),
            Some(BadgeError::Camera(CameraError::PermissionDenied))
        ));

        flow.camera.fail_with = None;
        flow.retry_camera();
        let Step::Capture(capture) = flow.step() else { panic!("left capture") };
        assert!(matches!(capture.state(), CaptureState::CameraActive { .. }));
    }

    #[test]
    fn test_scanner_waits_quietly_for_first_frame() {
        let mut camera = FakeCamera::default();
        camera.no_frame = true;
        let mut flow = flow_with(MemoryStore::new(), camera);
        flow.navigate(Route::Scan);
        scan(&mut flow, Ok(Some(EVENT_CODE.to_string())));

        let Step::Scan(gate) = flow.step() else { panic!("left the scan gate") };
        assert!(gate.is_scanning());
        assert_eq!(gate.notice(), None);
        assert_eq!(gate.last_scan(), None);
        assert!(!flow.session().is_granted().unwrap());
    }

    #[test]
    fn test_scan_frame_is_not_reused_as_photo() {
        let pause = || std::thread::sleep(std::time::Duration::from_millis(20));
        let write_frame = |dir: &std::path::Path, name: &str, color: [u8; 3]| {
            RgbImage::from_pixel(8, 8, Rgb(color)).save(dir.join(name)).unwrap();
        };

        let dir = tempfile::tempdir().unwrap();
        let mut flow = Flow::new(
            BadgeLedger::new(MemoryStore::new()),
            RegistrationSession::new(MemoryStore::new()),
            DirectoryCamera::new(dir.path()),
            EVENT_CODE,
        );

        flow.navigate(Route::Scan);
        pause();
        write_frame(dir.path(), "event-code.png", [1, 2, 3]);
        flow.poll_scanner(&ScriptedDecoder::new(vec![Ok(Some(EVENT_CODE.to_string()))]));
        assert_eq!(flow.route(), Route::Register);

        flow.submit_name("Alice");
        flow.capture_photo();
        let Step::Capture(capture) = flow.step() else { panic!("left capture") };
        assert!(matches!(capture.state(), CaptureState::CameraActive { .. }));
        assert!(matches!(capture.error(), Some(BadgeError::Camera(CameraError::NoFrame))));

        pause();
        write_frame(dir.path(), "selfie.png", [9, 9, 9]);
        flow.capture_photo();
        let Step::Capture(capture) = flow.step() else { panic!("left capture") };
        let CaptureState::PhotoCaptured { photo } = capture.state() else {
            panic!("no photo captured")
        };
        assert_eq!(photo.decode().unwrap().to_rgb8().get_pixel(0, 0), &Rgb([9, 9, 9]));
    }

    #[test]
    fn test_badge_view_picks_highest_number() {
        let records: Vec<BadgeRecord> = [2520, 2522, 2521]
            .into_iter()
            .map(|n| BadgeRecord::new(&format!("Guest {n}"), n, photo(), Utc::now()).unwrap())
            .collect();
        let mut store = MemoryStore::new();
        store.set(BADGES_KEY, &serde_json::to_string(&records).unwrap()).unwrap();
        store.set(LAST_BADGE_NUMBER_KEY, "2522").unwrap();

        let mut flow = flow_with(store, FakeCamera::default());
        flow.navigate(Route::Badge);
        let Step::Badge(BadgeView::Ready(record)) = flow.step() else {
            panic!("badge not shown")
        };
        assert_eq!(record.badge_number(), 2522);
        assert_eq!(flow.next_badge_id().as_deref(), Some("GR2523"));
    }

    #[test]
    fn test_badge_view_empty() {
        let mut flow = new_flow();
        flow.navigate(Route::Badge);
        assert!(matches!(flow.step(), Step::Badge(BadgeView::Missing)));
    }

    #[test]
    fn test_corrupt_storage_needs_explicit_reset() {
        let mut store = MemoryStore::new();
        store.set(BADGES_KEY, "[{broken").unwrap();
        let mut flow = flow_with(store, FakeCamera::default());

        flow.navigate(Route::Badge);
        assert!(matches!(flow.step(), Step::Badge(BadgeView::Unavailable(_))));
        assert_eq!(flow.ledger().store().get(BADGES_KEY).unwrap().as_deref(), Some("[{broken"));

        flow.reset_storage();
        assert!(matches!(flow.step(), Step::Badge(BadgeView::Missing)));
    }

    #[test]
    fn test_missing_counter_repair_keeps_badges() {
        let records = vec![
            BadgeRecord::new("Alice", 2520, photo(), Utc::now()).unwrap(),
            BadgeRecord::new("Bob", 2521, photo(), Utc::now()).unwrap(),
        ];
        let mut store = MemoryStore::new();
        store.set(BADGES_KEY, &serde_json::to_string(&records).unwrap()).unwrap();
        let mut flow = flow_with(store, FakeCamera::default());

        flow.navigate(Route::Badge);
        assert!(matches!(flow.step(), Step::Badge(BadgeView::Ready(_))));
        flow.navigate(Route::Scan);
        scan(&mut flow, Ok(Some(EVENT_CODE.to_string())));
        flow.submit_name("Cleo");
        flow.capture_photo();
        flow.finalize(Utc::now());
        let Step::Capture(capture) = flow.step() else { panic!("left capture") };
        assert_eq!(capture.error().and_then(BadgeError::corrupt_key), Some(LAST_BADGE_NUMBER_KEY));

        flow.reset_storage();
        assert_eq!(flow.ledger().count().unwrap(), 2);
        assert_eq!(flow.next_badge_id().as_deref(), Some("GR2522"));
    }

    #[test]
    fn test_session_flag_key() {
        let mut flow = new_flow();
        flow.navigate(Route::Scan);
        scan(&mut flow, Ok(Some(EVENT_CODE.to_string())));
        assert_eq!(
            flow.session().store().get(CAN_REGISTER_KEY).unwrap().as_deref(),
            Some("true")
        );
    }
}
