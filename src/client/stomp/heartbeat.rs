//! Heart-beat negotiation
//!
//! The client offers `cx,cy` in `CONNECT`, the broker answers `sx,sy` in
//! `CONNECTED`. Outgoing beats run every `max(cx, sy)` ms, incoming beats are
//! expected every `max(cy, sx)` ms; a zero on either side disables that
//! direction.

use std::time::Duration;

/// Negotiated heart-beat intervals; `None` disables a direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    pub outgoing: Option<Duration>,
    pub incoming: Option<Duration>,
}

impl HeartBeat {
    pub fn negotiate(offered: (u64, u64), server_header: Option<&str>) -> Self {
        let (sx, sy) = server_header.and_then(parse_header).unwrap_or((0, 0));
        let (cx, cy) = offered;
        Self {
            outgoing: interval(cx, sy),
            incoming: interval(cy, sx),
        }
    }

    /// Silence longer than this means the session is dead
    pub fn incoming_deadline(&self) -> Option<Duration> {
        self.incoming.map(|interval| interval * 2)
    }
}

fn interval(ours: u64, theirs: u64) -> Option<Duration> {
    if ours == 0 || theirs == 0 {
        None
    } else {
        Some(Duration::from_millis(ours.max(theirs)))
    }
}

/// Parse a `heart-beat` header value, e.g. `10000,10000`
pub fn parse_header(value: &str) -> Option<(u64, u64)> {
    let (x, y) = value.split_once(',')?;
    Some((x.trim().parse().ok()?, y.trim().parse().ok()?))
}
