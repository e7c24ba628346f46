//! Built-in transport adapters.

pub mod chromecast;
pub mod dial;
pub mod dlna;

mod description;
mod soap;

pub use chromecast::{ChromecastAdapter, ChromecastConfig};
pub use dial::{DialAdapter, DialConfig};
pub use dlna::{DlnaAdapter, DlnaConfig};
