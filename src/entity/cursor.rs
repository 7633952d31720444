use chrono::{DateTime, Utc};

/// A requestor's position in a store's change feed.
///
/// `version` is the highest change version already handed to the requestor.
/// It only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeCursor {
    pub version: u64,
    pub last_polled_at: DateTime<Utc>,
}

impl ChangeCursor {
    /// Cursor for a requestor that has never polled.
    #[must_use]
    pub const fn start(now: DateTime<Utc>) -> Self {
        Self {
            version: 0,
            last_polled_at: now,
        }
    }

    /// Returns the cursor advanced to `watermark`, never moving backward.
    #[must_use]
    pub fn advanced(self, watermark: u64, now: DateTime<Utc>) -> Self {
        Self {
            version: self.version.max(watermark),
            last_polled_at: now,
        }
    }
}
