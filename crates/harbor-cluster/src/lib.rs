//! harbor-cluster — membership and cluster-size aware pacing.
//!
//! The rest of the system treats membership as an oracle: who is alive,
//! which members are servers (and for which datacenter), and a signal for
//! "a server just became reachable". [`Membership`] is that seam;
//! [`StaticMembership`] implements it from heartbeats exchanged with a
//! configured set of peers.

pub mod membership;
pub mod pacing;

pub use membership::{Member, MemberStatus, Membership, ServerParts, StaticMembership};
pub use pacing::{ae_scale, random_stagger};
