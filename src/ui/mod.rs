/// Kiosk user interface
///
/// Pure view functions over the flow state. All state changes go through
/// `Message` and `Flow` in main.rs.

pub mod pages;
