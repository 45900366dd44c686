//! Status enums mapping to SMALLINT lookup tables.
//!
//! Each variant's discriminant matches the seed order (1-based) of the
//! corresponding `*_statuses` table in `migrations/`.

use serde::{Deserialize, Serialize};

/// Status ID type matching SMALLINT in the database.
pub type StatusId = i16;

/// A `status_id` column held a value with no matching variant.
#[derive(Debug, thiserror::Error)]
#[error("Unknown {kind} id {id}")]
pub struct UnknownStatusId {
    pub kind: &'static str,
    pub id: StatusId,
}

macro_rules! define_status_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $val:expr ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(i16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $val ),+
        }

        impl $name {
            /// Return the database status ID.
            pub fn id(self) -> StatusId {
                self as StatusId
            }

            /// Look up a variant by its database status ID.
            pub fn from_id(id: StatusId) -> Option<Self> {
                match id {
                    $( v if v == $val => Some(Self::$variant), )+
                    _ => None,
                }
            }
        }

        impl From<$name> for StatusId {
            fn from(value: $name) -> Self {
                value as StatusId
            }
        }

        impl TryFrom<StatusId> for $name {
            type Error = UnknownStatusId;

            fn try_from(id: StatusId) -> Result<Self, Self::Error> {
                Self::from_id(id).ok_or(UnknownStatusId {
                    kind: stringify!($name),
                    id,
                })
            }
        }
    };
}

define_status_enum! {
    /// Segment generation status.
    SegmentStatus {
        Pending = 1,
        Queued = 2,
        Generating = 3,
        Completed = 4,
        Failed = 5,
    }
}

define_status_enum! {
    /// Render job lifecycle status.
    RenderJobStatus {
        Queued = 1,
        Dispatching = 2,
        Processing = 3,
        Compositing = 4,
        Completed = 5,
        Failed = 6,
        Cancelled = 7,
    }
}

impl SegmentStatus {
    /// A generation task for the segment is queued or running.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Queued | Self::Generating)
    }
}

/// Render job statuses from which no transition is allowed.
pub const TERMINAL_JOB_STATUSES: [RenderJobStatus; 3] = [
    RenderJobStatus::Completed,
    RenderJobStatus::Failed,
    RenderJobStatus::Cancelled,
];

/// Render job statuses that still await work.
pub const ACTIVE_JOB_STATUSES: [RenderJobStatus; 4] = [
    RenderJobStatus::Queued,
    RenderJobStatus::Dispatching,
    RenderJobStatus::Processing,
    RenderJobStatus::Compositing,
];

impl RenderJobStatus {
    pub fn is_terminal(self) -> bool {
        TERMINAL_JOB_STATUSES.contains(&self)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// `Queued -> Failed` covers a segment failure reported for a job that
    /// has not yet been marked as dispatching.
    pub fn can_transition_to(self, next: Self) -> bool {
        use RenderJobStatus::*;
        match (self, next) {
            (Queued, Dispatching) | (Queued, Compositing) => true,
            (Dispatching, Processing) | (Dispatching, Compositing) => true,
            (Processing, Compositing) => true,
            (Compositing, Completed) => true,
            (Queued | Dispatching | Processing | Compositing, Failed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Convert a set of statuses into their ids for an `= ANY($n)` bind.
pub fn status_ids<S: Copy + Into<StatusId>>(statuses: &[S]) -> Vec<StatusId> {
    statuses.iter().map(|s| (*s).into()).collect()
}
