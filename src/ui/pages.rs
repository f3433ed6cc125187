/// Page views, one per route
use iced::widget::image::Handle;
use iced::widget::{button, column, container, image, row, text, text_input, Column};
use iced::{Alignment, Color, Element, Length};

use crate::device::camera::CameraError;
use crate::device::qr::BADGE_QR_SIZE;
use crate::error::BadgeError;
use crate::state::flow::{BadgeView, CaptureState, CaptureStep, Registration, Route, ScanGate};
use crate::state::ledger::BADGES_KEY;
use crate::Message;

const ACCENT: Color = Color::from_rgb(0.13, 0.83, 0.93);
const ERROR: Color = Color::from_rgb(0.94, 0.27, 0.27);
const WARNING: Color = Color::from_rgb(0.92, 0.70, 0.03);
const MUTED: Color = Color::from_rgb(0.61, 0.64, 0.69);
const SUCCESS: Color = Color::from_rgb(0.29, 0.87, 0.50);

const PREVIEW_WIDTH: f32 = 420.0;
const BADGE_PHOTO_SIZE: f32 = 128.0;

/// Navigation bar shown above every page
pub fn header<'a>() -> Element<'a, Message> {
    row![
        text("Event Badge").size(28).color(ACCENT),
        button("Home").on_press(Message::Navigate(Route::Home)).padding(8),
        button("Scan").on_press(Message::Navigate(Route::Scan)).padding(8),
        button("My Badge").on_press(Message::Navigate(Route::Badge)).padding(8),
    ]
    .spacing(16)
    .padding(16)
    .align_y(Alignment::Center)
    .into()
}

pub fn home<'a>() -> Element<'a, Message> {
    column![
        text("Welcome").size(32),
        text("Use the header to scan the event QR code or view your badge.").size(18),
        text("Credit: KIRITO").size(14).color(MUTED),
    ]
    .spacing(20)
    .align_x(Alignment::Center)
    .into()
}

pub fn scan<'a>(gate: &'a ScanGate, preview: Option<&'a Handle>) -> Element<'a, Message> {
    let mut content = Column::new()
        .spacing(16)
        .align_x(Alignment::Center)
        .push(text("Scan Event QR Code").size(32));

    if gate.is_locked() {
        if let Some(notice) = gate.notice() {
            content = content.push(text(notice.to_string()).size(18).color(WARNING));
        }
        return content.into();
    }

    content = content.push(camera_preview(preview, gate.is_scanning()));

    if let Some(notice) = gate.notice() {
        content = content.push(text(format!("Error: {notice}")).color(ERROR));
    }
    if let Some(last) = gate.last_scan() {
        content = content.push(text(format!("Last scan: {last}")).color(MUTED));
    }

    content.into()
}

pub fn register(registration: &Registration) -> Element<'_, Message> {
    let mut content = Column::new()
        .spacing(16)
        .width(Length::Fixed(420.0))
        .align_x(Alignment::Center)
        .push(text("Register Your Badge").size(32));

    if registration.is_disabled() {
        if let Some(error) = registration.error() {
            content = content.push(text(error.to_string()).size(18).color(WARNING));
            content = content.push_maybe(reset_button(error));
        }
        return content.into();
    }

    content = content
        .push(text("The event code was accepted. Please enter the participant's name.").color(MUTED))
        .push(
            text_input("Participant's name", registration.input())
                .on_input(Message::NameChanged)
                .on_submit(Message::SubmitName)
                .padding(10),
        );

    if let Some(error) = registration.error() {
        content = content.push(text(error.to_string()).color(ERROR));
    }

    content
        .push(
            button("Next: Capture Photo")
                .on_press(Message::SubmitName)
                .padding(10),
        )
        .into()
}

pub fn capture<'a>(
    step: &'a CaptureStep,
    preview: Option<&'a Handle>,
    photo: Option<&'a Handle>,
    next_badge_id: Option<String>,
) -> Element<'a, Message> {
    let title = format!("Capture Your Photo, {}", step.name().unwrap_or_default());
    let mut content = Column::new()
        .spacing(16)
        .align_x(Alignment::Center)
        .push(text(title).size(28));

    if let Some(error) = step.error() {
        content = content.push(text(format!("Error: {error}")).color(ERROR));
        content = content.push_maybe(reset_button(error));
    }

    let body: Element<'a, Message> = match step.state() {
        CaptureState::NoCamera { error } => camera_problem(error.as_ref()),
        CaptureState::CameraActive { .. } => column![
            camera_preview(preview, true),
            button("Take Photo").on_press(Message::TakePhoto).padding(10),
        ]
        .spacing(12)
        .align_x(Alignment::Center)
        .into(),
        CaptureState::PhotoCaptured { .. } => {
            let confirm = match next_badge_id {
                Some(id) => format!("Confirm & Get My Badge ({id})"),
                None => "Confirm & Get My Badge".to_string(),
            };
            let mut captured = Column::new()
                .spacing(12)
                .align_x(Alignment::Center)
                .push(text("Photo Captured!").color(SUCCESS));
            if let Some(handle) = photo {
                captured = captured.push(image(handle.clone()).width(PREVIEW_WIDTH));
            }
            captured
                .push(button("Retake Photo").on_press(Message::Retake).padding(10))
                .push(button(text(confirm)).on_press(Message::Confirm).padding(10))
                .into()
        }
        CaptureState::Finalized { record } => {
            text(format!("Badge {} issued.", record.badge_id())).color(SUCCESS).into()
        }
    };

    content.push(body).into()
}

pub fn badge<'a>(
    view: &'a BadgeView,
    photo: Option<&'a Handle>,
    qr: Option<&'a Handle>,
) -> Element<'a, Message> {
    let title = text("Your Event Badge").size(32).color(ACCENT);

    match view {
        BadgeView::Missing => column![
            title,
            text("No badge found for this device. Please register first.").color(ERROR),
            button("Scan event code")
                .on_press(Message::Navigate(Route::Scan))
                .padding(10),
        ]
        .spacing(16)
        .align_x(Alignment::Center)
        .into(),
        BadgeView::Unavailable(error) => column![
            title,
            text("Failed to load badge data. Storage might be corrupted or inaccessible.").color(ERROR),
            text(error.to_string()).color(MUTED),
        ]
        .push_maybe(reset_button(error))
        .spacing(16)
        .align_x(Alignment::Center)
        .into(),
        BadgeView::Ready(record) => {
            let mut card = Column::new()
                .spacing(12)
                .padding(24)
                .align_x(Alignment::Center);
            if let Some(handle) = photo {
                card = card.push(image(handle.clone()).width(BADGE_PHOTO_SIZE).height(BADGE_PHOTO_SIZE));
            }
            card = card
                .push(text(record.participant_name()).size(26))
                .push(text(record.badge_id()).size(20).color(ACCENT))
                .push(
                    text(format!("Issued {}", record.issued_at().format("%Y-%m-%d %H:%M UTC")))
                        .size(14)
                        .color(MUTED),
                );
            if let Some(handle) = qr {
                card = card.push(image(handle.clone()).width(BADGE_QR_SIZE as f32));
            }

            column![title, container(card)]
                .spacing(16)
                .align_x(Alignment::Center)
                .into()
        }
    }
}

fn camera_preview(preview: Option<&Handle>, active: bool) -> Element<'_, Message> {
    match preview {
        Some(handle) => image(handle.clone()).width(PREVIEW_WIDTH).into(),
        None if active => text("Waiting for camera frames...").color(MUTED).into(),
        None => text("Starting camera...").color(MUTED).into(),
    }
}

fn camera_problem<'a>(error: Option<&CameraError>) -> Element<'a, Message> {
    match error {
        Some(error) => column![
            text(error.to_string()).color(ERROR),
            button("Try camera again").on_press(Message::RetryCamera).padding(10),
        ]
        .spacing(12)
        .align_x(Alignment::Center)
        .into(),
        None => text("Starting camera...").color(MUTED).into(),
    }
}

/// Offered only when stored data is unreadable. Only an unreadable badge
/// list costs the issued badges; a bad counter is rebuilt from them.
fn reset_button<'a>(error: &BadgeError) -> Option<Element<'a, Message>> {
    let label = match error.corrupt_key()? {
        BADGES_KEY => "Delete all badges and reset storage",
        _ => "Repair badge counter",
    };
    Some(button(label).on_press(Message::ResetStorage).padding(10).into())
}
