//! Pure push-to-talk debouncing state machine.
//!
//! Time is injected so the rules can be tested without sleeping:
//!
//! * a key-down fires [`PttEvent::Pressed`] only when the key was up;
//!   auto-repeat downs are swallowed;
//! * a key-up arms a release deadline `window` in the future; a key-down
//!   before the deadline cancels it (flutter), so the gesture continues;
//! * [`Debouncer::poll`] fires [`PttEvent::Released`] once the deadline passes.
//!
//! Callers must `poll(at)` before feeding an edge stamped `at`, so an expired
//! deadline is settled before the next edge is judged.

use std::time::{Duration, Instant};

use super::PttEvent;

#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    down: bool,
    pending_release: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            down: false,
            pending_release: None,
        }
    }

    pub fn key_down(&mut self, _at: Instant) -> Option<PttEvent> {
        if self.pending_release.take().is_some() {
            log::trace!("ptt: release cancelled by flutter");
            return None;
        }
        if self.down {
            return None;
        }
        self.down = true;
        Some(PttEvent::Pressed)
    }

    pub fn key_up(&mut self, at: Instant) -> Option<PttEvent> {
        if !self.down || self.pending_release.is_some() {
            return None;
        }
        if self.window.is_zero() {
            self.down = false;
            return Some(PttEvent::Released);
        }
        self.pending_release = Some(at + self.window);
        None
    }

    /// Fire a pending release whose deadline is at or before `now`.
    pub fn poll(&mut self, now: Instant) -> Option<PttEvent> {
        match self.pending_release {
            Some(deadline) if now >= deadline => {
                self.pending_release = None;
                self.down = false;
                Some(PttEvent::Released)
            }
            _ => None,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending_release
    }

    /// `true` from an accepted press until its release fires.
    pub fn is_down(&self) -> bool {
        self.down
    }

    pub fn reset(&mut self) {
        self.down = false;
        self.pending_release = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(50);

    fn ms(base: Instant, n: u64) -> Instant {
        base + Duration::from_millis(n)
    }

    #[derive(Debug, Clone, Copy)]
    enum Edge {
        Down(u64),
        Up(u64),
    }

    /// Replays edges with the poll-before-edge discipline, then settles.
    fn replay(edges: &[Edge]) -> Vec<PttEvent> {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        let mut out = Vec::new();
        for edge in edges {
            let fired = match *edge {
                Edge::Down(n) => {
                    out.extend(d.poll(ms(t0, n)));
                    d.key_down(ms(t0, n))
                }
                Edge::Up(n) => {
                    out.extend(d.poll(ms(t0, n)));
                    d.key_up(ms(t0, n))
                }
            };
            out.extend(fired);
        }
        out.extend(d.poll(ms(t0, 10_000)));
        out
    }

    #[test]
    fn single_gesture() {
        assert_eq!(
            replay(&[Edge::Down(0), Edge::Up(400)]),
            vec![PttEvent::Pressed, PttEvent::Released]
        );
    }

    #[test]
    fn auto_repeat_is_swallowed() {
        let mut edges = vec![Edge::Down(0)];
        edges.extend((1..20).map(|i| Edge::Down(i * 30)));
        edges.push(Edge::Up(700));
        assert_eq!(replay(&edges), vec![PttEvent::Pressed, PttEvent::Released]);
    }

    #[test]
    fn flutter_inside_window_is_one_gesture() {
        let edges = [
            Edge::Down(0),
            Edge::Up(300),
            Edge::Down(320),
            Edge::Up(330),
            Edge::Down(345),
            Edge::Up(600),
        ];
        assert_eq!(replay(&edges), vec![PttEvent::Pressed, PttEvent::Released]);
    }

    #[test]
    fn gap_longer_than_window_is_two_gestures() {
        let edges = [Edge::Down(0), Edge::Up(100), Edge::Down(200), Edge::Up(300)];
        assert_eq!(
            replay(&edges),
            vec![
                PttEvent::Pressed,
                PttEvent::Released,
                PttEvent::Pressed,
                PttEvent::Released
            ]
        );
    }

    #[test]
    fn stray_release_without_press_is_ignored() {
        assert!(replay(&[Edge::Up(0), Edge::Up(10)]).is_empty());
    }

    #[test]
    fn every_sequence_pairs_presses_with_releases() {
        // Exhaustive over short edge sequences with 20 ms spacing.
        for mask in 0u32..(1 << 10) {
            let edges: Vec<Edge> = (0..10)
                .map(|i| {
                    let at = i as u64 * 20;
                    if mask & (1 << i) != 0 {
                        Edge::Down(at)
                    } else {
                        Edge::Up(at)
                    }
                })
                .collect();
            let events = replay(&edges);
            let mut expect_press = true;
            for ev in &events {
                let expected = if expect_press {
                    PttEvent::Pressed
                } else {
                    PttEvent::Released
                };
                assert_eq!(*ev, expected, "mask {mask:#b}: {events:?}");
                expect_press = !expect_press;
            }
            assert!(expect_press, "mask {mask:#b} left a gesture open");
        }
    }

    #[test]
    fn zero_window_releases_immediately() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(Duration::ZERO);
        assert_eq!(d.key_down(t0), Some(PttEvent::Pressed));
        assert_eq!(d.key_up(t0), Some(PttEvent::Released));
        assert!(!d.is_down());
    }

    #[test]
    fn deadline_and_reset() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.key_down(t0);
        d.key_up(ms(t0, 10));
        assert_eq!(d.next_deadline(), Some(ms(t0, 60)));
        assert_eq!(d.poll(ms(t0, 59)), None);
        assert!(d.is_down());

        d.reset();
        assert!(!d.is_down());
        assert_eq!(d.next_deadline(), None);
        assert_eq!(d.poll(ms(t0, 100)), None);
    }
}
