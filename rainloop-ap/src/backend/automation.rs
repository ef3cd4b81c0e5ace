//! Gain automation timeline for the precision backend
//!
//! A voice's gain is a piecewise curve: an initial value followed by ramps.
//! Issuing a ramp discards everything scheduled at or after its start, so a
//! new command always supersedes pending ones from that instant onwards.
//! The value at any instant is taken from the latest ramp that has begun.

use rainloop_common::FadeCurve;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Ramp {
    start: f64,
    duration: f64,
    from: f64,
    to: f64,
    curve: FadeCurve,
}

impl Ramp {
    fn end(&self) -> f64 {
        self.start + self.duration
    }

    fn value_at(&self, t: f64) -> f64 {
        if self.duration <= 0.0 || t >= self.end() {
            return self.to;
        }
        let progress = (t - self.start) / self.duration;
        self.curve.interpolate(self.from, self.to, progress)
    }
}

/// Sample-accurate gain timeline
#[derive(Debug, Clone, PartialEq)]
pub struct GainAutomation {
    initial: f64,
    ramps: Vec<Ramp>,
}

impl GainAutomation {
    pub fn new(initial: f64) -> Self {
        Self {
            initial,
            ramps: Vec::new(),
        }
    }

    /// Ramp from `from` to `to` over `duration`, beginning at `start`.
    pub fn ramp(&mut self, from: f64, to: f64, start: f64, duration: f64, curve: FadeCurve) {
        self.cancel_from(start);
        self.ramps.push(Ramp {
            start,
            duration: duration.max(0.0),
            from,
            to,
            curve,
        });
    }

    /// Drop every ramp starting at or after `t`
    pub fn cancel_from(&mut self, t: f64) {
        self.ramps.retain(|r| r.start < t);
    }

    /// Gain at time `t`
    pub fn value_at(&self, t: f64) -> f64 {
        self.ramps
            .iter()
            .rev()
            .find(|r| r.start <= t)
            .map(|r| r.value_at(t))
            .unwrap_or(self.initial)
    }

    /// Forget ramps that can no longer affect any instant from `now` on.
    pub fn prune_before(&mut self, now: f64) {
        // Index of the latest ramp that has begun; everything before it is dead.
        if let Some(active) = self.ramps.iter().rposition(|r| r.start <= now) {
            if active > 0 {
                self.initial = self.ramps[active - 1].value_at(self.ramps[active].start);
                self.ramps.drain(..active);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.ramps.len()
    }
}
