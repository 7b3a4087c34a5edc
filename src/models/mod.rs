//! Entity definitions for the tenant graph and accounting ledger.
//!
//! Entities reference each other by id strings, never by embedded structs,
//! so the in-memory graph stays acyclic and `Clone` is always a deep copy.

pub mod audit;
pub mod budget;
pub mod end_user;
pub mod invitation;
pub mod key;
pub mod org;
pub mod team;
pub mod usage;
pub mod user;

pub use audit::{AuditAction, AuditLog};
pub use budget::Budget;
pub use end_user::EndUser;
pub use invitation::InvitationLink;
pub use key::{ApiKey, KeyType};
pub use org::{Organization, OrganizationMembership};
pub use team::{Team, TeamMembership};
pub use usage::UsageLog;
pub use user::{User, UserRole};
