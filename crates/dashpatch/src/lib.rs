pub mod apply;
pub mod config;
pub mod dashboard;
pub mod diff;
pub mod display;
pub mod error;
pub mod logging;
pub mod patch;
pub mod path;

pub use apply::{ApplyReport, apply, apply_all, apply_with_report};
pub use dashboard::{Dashboard, PanelId, load, save};
pub use error::{Error, Result};
pub use patch::Patch;
