pub mod buffer;
pub mod member_set;
pub mod membership;
pub mod message;
pub mod packet;
pub mod poll;
pub mod service;
pub mod transport;

pub use grid_core::{Edition, GridConfig, GridError, Member, MemberId, Result};
pub use member_set::MemberIdSet;
pub use membership::{MemberState, ServiceMembership};
pub use poll::{Poll, PollOutcome};
pub use service::{GridService, ServiceState};
