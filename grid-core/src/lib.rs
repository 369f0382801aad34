pub mod config;
pub mod error;
pub mod ext;
pub mod member;
pub mod time;
pub mod version;

pub use config::GridConfig;
pub use error::{GridError, Result};
pub use member::{Edition, Member, MemberId};
