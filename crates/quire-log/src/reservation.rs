use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::feed::Feed;

/// A registered download interest on a feed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Want {
    pub range: Range<u64>,
    pub linear: bool,
}

/// Counters over the lifetime of a feed's download reservations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationStats {
    pub acquired: u64,
    pub released: u64,
    /// Reservations currently held.
    pub active: u64,
}

/// Guard for a download reservation made with [`Feed::download`].
///
/// The reservation is released exactly once: by [`Reservation::release`],
/// or when the guard is dropped.
pub struct Reservation {
    feed: Feed,
    id: Option<u64>,
    range: Range<u64>,
}

impl Reservation {
    pub(crate) fn new(feed: Feed, id: u64, range: Range<u64>) -> Self {
        Self {
            feed,
            id: Some(id),
            range,
        }
    }

    /// Block range this reservation covers.
    pub fn range(&self) -> Range<u64> {
        self.range.clone()
    }

    /// Returns `true` until released.
    pub fn is_active(&self) -> bool {
        self.id.is_some()
    }

    /// Release the reservation now.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(id) = self.id.take() {
            self.feed.release_want(id);
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("feed", &self.feed.key())
            .field("range", &self.range)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::feed::{Feed, FeedOptions};
    use crate::memory::MemoryStorage;

    fn feed() -> Feed {
        Feed::create(Box::new(MemoryStorage::new()), FeedOptions::default()).unwrap()
    }

    #[test]
    fn release_then_drop_counts_once() {
        let feed = feed();
        let reservation = feed.download(0..4, true);
        assert!(reservation.is_active());
        assert_eq!(reservation.range(), 0..4);
        reservation.release();

        let stats = feed.reservation_stats();
        assert_eq!((stats.acquired, stats.released, stats.active), (1, 1, 0));
    }

    #[test]
    fn drop_releases() {
        let feed = feed();
        {
            let _held = feed.download(2..3, false);
            assert_eq!(feed.reservation_stats().active, 1);
        }
        assert_eq!(feed.reservation_stats().released, 1);
    }

    #[test]
    fn releases_are_independent() {
        let feed = feed();
        let a = feed.download(0..1, false);
        let b = feed.download(0..1, false);
        drop(a);
        let stats = feed.reservation_stats();
        assert_eq!(stats.active, 1);
        drop(b);
        assert_eq!(feed.reservation_stats().active, 0);
    }
}
