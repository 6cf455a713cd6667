use std::time::{Instant, SystemTime};

/// Per-worker cached clock.
///
/// The reactor refreshes it once per loop iteration; everything else reads
/// the cached values. `now_ms` is monotonic milliseconds since worker start
/// and is the unit every timer deadline is expressed in. `http_date` is the
/// preformatted RFC 7231 date the header writer stamps on responses,
/// regenerated only when the wall-clock second changes.
pub struct Clock {
    start: Instant,
    pub now_ms: u64,
    http_date: String,
    date_stamp_ms: u64,
}

impl Clock {
    pub fn new() -> Self {
        let mut clock = Clock {
            start: Instant::now(),
            now_ms: 0,
            http_date: String::new(),
            date_stamp_ms: u64::MAX,
        };
        clock.update();
        clock
    }

    pub fn update(&mut self) {
        self.now_ms = self.start.elapsed().as_millis() as u64;
        if self.date_stamp_ms == u64::MAX || self.now_ms - self.date_stamp_ms >= 1000 {
            self.http_date = httpdate::fmt_http_date(SystemTime::now());
            self.date_stamp_ms = self.now_ms;
        }
    }

    pub fn http_date(&self) -> &str {
        &self.http_date
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_is_preformatted() {
        let clock = Clock::new();
        // "Sun, 06 Nov 1994 08:49:37 GMT" is always 29 bytes.
        assert_eq!(clock.http_date().len(), 29);
        assert!(clock.http_date().ends_with("GMT"));
    }

    #[test]
    fn monotonic_ms_advances() {
        let mut clock = Clock::new();
        let first = clock.now_ms;
        std::thread::sleep(std::time::Duration::from_millis(5));
        clock.update();
        assert!(clock.now_ms >= first + 5);
    }
}
