mod config;
mod resume;
mod session;
mod state;

pub use config::TransferConfig;
pub use resume::restore_from_storage;
pub use session::{BlockDelivery, TransferHandle, TransferSession};
pub use state::{ResumeReport, TransferStats, TransferSummary};
