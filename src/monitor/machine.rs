//! Phase state machine. No I/O and no timers; the runtime feeds it readings
//! and applies the poll interval it returns.

use std::time::Duration;

use crate::model::{MonitorPhase, ProgressReading};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Casual -> Intensive once the valuation reaches this.
    pub valuation: f64,
    /// Graduation once progress reaches this. Strictly below 1.0.
    pub graduation: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollRates {
    pub casual: Duration,
    pub intensive: Duration,
}

impl PollRates {
    /// How often a phase polls; `None` means it does not poll at all.
    pub fn for_phase(&self, phase: MonitorPhase) -> Option<Duration> {
        match phase {
            MonitorPhase::Casual => Some(self.casual),
            MonitorPhase::Intensive => Some(self.intensive),
            MonitorPhase::Executing | MonitorPhase::Stopped => None,
        }
    }
}

/// What one reading did to the machine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Step {
    /// Phases entered, in order. Empty when nothing changed.
    pub entered: Vec<MonitorPhase>,
    /// Set on exactly one step per asset.
    pub threshold_reached: bool,
    /// New poll interval, when the phase changed.
    pub poll_interval: Option<Duration>,
}

impl Step {
    pub fn is_noop(&self) -> bool {
        self.entered.is_empty() && !self.threshold_reached
    }
}

#[derive(Debug, Clone)]
pub struct MonitorMachine {
    phase: MonitorPhase,
    latched: bool,
    thresholds: Thresholds,
    rates: PollRates,
}

impl MonitorMachine {
    pub fn new(thresholds: Thresholds, rates: PollRates) -> Self {
        Self {
            phase: MonitorPhase::Stopped,
            latched: false,
            thresholds,
            rates,
        }
    }

    pub fn phase(&self) -> MonitorPhase {
        self.phase
    }

    pub fn is_latched(&self) -> bool {
        self.latched
    }

    /// Begin watching a (new) asset. Clears the latch. Only Casual and
    /// Intensive are valid starting phases; anything else starts Casual.
    pub fn reset(&mut self, phase: MonitorPhase) -> Option<Duration> {
        self.phase = if phase.is_watching() {
            phase
        } else {
            MonitorPhase::Casual
        };
        self.latched = false;
        self.rates.for_phase(self.phase)
    }

    /// Stop watching; later readings are ignored.
    pub fn stop(&mut self) {
        self.phase = MonitorPhase::Stopped;
    }

    pub fn observe(&mut self, reading: &ProgressReading) -> Step {
        let mut step = Step::default();
        if self.latched || !self.phase.is_watching() {
            return step;
        }

        if self.phase == MonitorPhase::Casual
            && reading.valuation_estimate >= self.thresholds.valuation
        {
            self.phase = MonitorPhase::Intensive;
            step.entered.push(MonitorPhase::Intensive);
        }

        if reading.complete || reading.progress_fraction >= self.thresholds.graduation {
            self.phase = MonitorPhase::Executing;
            self.latched = true;
            step.entered.push(MonitorPhase::Executing);
            step.threshold_reached = true;
        }

        if !step.entered.is_empty() {
            step.poll_interval = self.rates.for_phase(self.phase);
        }
        step
    }
}
