pub mod backfill;
pub mod config;
pub mod conversation_lock;
pub mod error;
pub mod reconciler;
pub mod rubric;
pub mod transcript;
pub mod validator;

pub use backfill::*;
pub use config::*;
pub use conversation_lock::*;
pub use error::*;
pub use reconciler::*;
pub use rubric::*;
pub use transcript::*;
pub use validator::*;
