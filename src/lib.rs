pub mod chain;
pub mod config;
pub mod decay;
pub mod error;
pub mod lot;
pub mod orchestrator;
pub mod public;
pub mod repository;
pub mod service;
pub mod store;
pub mod timeline;
pub mod transitions;
pub mod types;
pub mod utils;

pub use config::EngineConfig;
pub use error::{LotError, ValidationError};
pub use repository::{ChangeSet, LotRepository};
pub use service::LotService;
pub use store::SledLotRepository;
