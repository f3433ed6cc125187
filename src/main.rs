use chrono::Utc;
use clap::{Parser, Subcommand};
use iced::widget::image::Handle;
use iced::widget::{column, container};
use iced::{time, Element, Length, Subscription, Task, Theme};
use image::DynamicImage;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod device;
mod error;
mod state;
mod ui;

use config::{Config, Overrides};
use device::camera::DirectoryCamera;
use device::photo::{self, Photo};
use device::qr::{self, QrCodeEncoder, QrEncoder, RqrrDecoder, BADGE_QR_SIZE, EVENT_QR_SIZE};
use state::flow::{BadgeView, CaptureState, Flow, Route, Step};
use state::ledger::BadgeLedger;
use state::session::RegistrationSession;
use state::store::{MemoryStore, SqliteStore};

/// How often the camera is polled while scanning or previewing
const CAMERA_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Parser)]
#[command(name = "event-badge")]
#[command(about = "Event badge kiosk: scan, register, capture, badge")]
struct Args {
    /// Directory holding the badge database
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Folder where the tethered camera drops its frames
    #[arg(long)]
    tether_dir: Option<PathBuf>,

    /// Text of the event QR code that unlocks registration
    #[arg(long)]
    event_code: Option<String>,

    #[arg(long, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write the event QR code to a PNG file for printing
    GenerateQr {
        #[arg(long, default_value = "event_badge_qr.png")]
        output: PathBuf,

        #[arg(long, default_value_t = EVENT_QR_SIZE)]
        size: u32,
    },
}

type KioskFlow = Flow<SqliteStore, MemoryStore, DirectoryCamera>;

/// Application messages (events)
#[derive(Debug, Clone)]
pub enum Message {
    /// Header or page button asked for another page
    Navigate(Route),
    /// Camera poll interval elapsed
    Tick,
    NameChanged(String),
    SubmitName,
    TakePhoto,
    Retake,
    RetryCamera,
    Confirm,
    /// User confirmed wiping unreadable badge storage
    ResetStorage,
}

/// Main application state
struct EventBadge {
    flow: KioskFlow,
    decoder: RqrrDecoder,
    encoder: QrCodeEncoder,
    /// Latest camera frame for the live preview
    preview: Option<Handle>,
    /// Captured photo or the shown badge's photo
    photo: Option<Handle>,
    /// QR code of the shown badge
    badge_qr: Option<Handle>,
}

impl EventBadge {
    fn new(flow: KioskFlow) -> (Self, Task<Message>) {
        (
            EventBadge {
                flow,
                decoder: RqrrDecoder,
                encoder: QrCodeEncoder::badge(),
                preview: None,
                photo: None,
                badge_qr: None,
            },
            Task::none(),
        )
    }

    /// Handle application messages and update state
    fn update(&mut self, message: Message) -> Task<Message> {
        let before = self.flow.route();

        match message {
            Message::Navigate(route) => self.flow.navigate(route),
            Message::Tick => {
                let frame = if matches!(self.flow.step(), Step::Scan(_)) {
                    self.flow.poll_scanner(&self.decoder)
                } else {
                    self.flow.preview_frame()
                };
                if let Some(frame) = frame {
                    self.preview = Some(to_handle(&frame));
                }
            }
            Message::NameChanged(text) => self.flow.edit_name(text),
            Message::SubmitName => {
                let text = match self.flow.step() {
                    Step::Register(registration) => registration.input().to_string(),
                    _ => return Task::none(),
                };
                self.flow.submit_name(&text);
            }
            Message::TakePhoto => self.flow.capture_photo(),
            Message::Retake => self.flow.retake_photo(),
            Message::RetryCamera => self.flow.retry_camera(),
            Message::Confirm => self.flow.finalize(Utc::now()),
            Message::ResetStorage => self.flow.reset_storage(),
        }

        if self.flow.route() != before {
            info!(from = ?before, to = ?self.flow.route(), "page changed");
            self.preview = None;
        }
        self.refresh_media();

        Task::none()
    }

    /// Keep the photo and QR handles in line with the current step
    fn refresh_media(&mut self) {
        let (photo, payload) = match self.flow.step() {
            Step::Capture(capture) => match capture.state() {
                CaptureState::PhotoCaptured { photo } => (Some(photo), None),
                _ => (None, None),
            },
            Step::Badge(BadgeView::Ready(record)) => (Some(record.photo()), Some(record.qr_payload())),
            _ => (None, None),
        };

        self.photo = photo.map(photo_handle);
        self.badge_qr = payload.and_then(|payload| match self.encoder.render(&payload, BADGE_QR_SIZE) {
            Ok(img) => Some(to_handle(&DynamicImage::ImageLuma8(img))),
            Err(e) => {
                warn!(error = %e, "could not render badge QR code");
                None
            }
        });
    }

    /// Build the user interface
    fn view(&self) -> Element<Message> {
        let page = match self.flow.step() {
            Step::Home => ui::pages::home(),
            Step::Scan(gate) => ui::pages::scan(gate, self.preview.as_ref()),
            Step::Register(registration) => ui::pages::register(registration),
            Step::Capture(capture) => ui::pages::capture(
                capture,
                self.preview.as_ref(),
                self.photo.as_ref(),
                self.flow.next_badge_id(),
            ),
            Step::Badge(view) => ui::pages::badge(view, self.photo.as_ref(), self.badge_qr.as_ref()),
        };

        column![
            ui::pages::header(),
            container(page)
                .width(Length::Fill)
                .height(Length::Fill)
                .center_x(Length::Fill)
                .padding(32),
        ]
        .into()
    }

    /// Poll the camera only while a live stream is on screen
    fn subscription(&self) -> Subscription<Message> {
        let polling = match self.flow.step() {
            Step::Scan(gate) => gate.is_scanning(),
            Step::Capture(capture) => matches!(capture.state(), CaptureState::CameraActive { .. }),
            _ => false,
        };

        if polling {
            time::every(CAMERA_POLL_INTERVAL).map(|_| Message::Tick)
        } else {
            Subscription::none()
        }
    }

    /// Set the application theme
    fn theme(&self) -> Theme {
        Theme::Dark
    }
}

fn to_handle(frame: &DynamicImage) -> Handle {
    let rgba = frame.to_rgba8();
    Handle::from_rgba(rgba.width(), rgba.height(), rgba.into_raw())
}

fn photo_handle(photo: &Photo) -> Handle {
    match photo.decode() {
        Ok(img) => to_handle(&img),
        Err(e) => {
            warn!(error = %e, "stored photo unreadable, showing placeholder");
            to_handle(&photo::placeholder())
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log))
        .init();

    let config = Config::load(Overrides {
        data_dir: args.data_dir,
        tether_dir: args.tether_dir,
        event_code: args.event_code,
    });

    if let Some(Command::GenerateQr { output, size }) = args.command {
        qr::write_event_code(&config.event_code, &output, size)?;
        return Ok(());
    }

    // The kiosk cannot issue anything without its store, so this is fatal
    let store = SqliteStore::open(&config.db_path())?;
    let flow = Flow::new(
        BadgeLedger::new(store),
        RegistrationSession::new(MemoryStore::new()),
        DirectoryCamera::new(&config.tether_dir),
        config.event_code,
    );

    let badge_count = flow.ledger().count().unwrap_or_else(|e| {
        warn!(error = %e, "badge storage unreadable at startup");
        0
    });
    info!(
        badges = badge_count,
        db = ?flow.ledger().store().path(),
        tether_dir = %flow.camera().dir().display(),
        "event badge kiosk initialized"
    );

    iced::application("Event Badge", EventBadge::update, EventBadge::view)
        .subscription(EventBadge::subscription)
        .theme(EventBadge::theme)
        .centered()
        .run_with(move || EventBadge::new(flow))?;

    Ok(())
}
