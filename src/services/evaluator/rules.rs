use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Rolling-window bounds: the window keeps whichever is smaller, the last
/// `WINDOW_MAX_SAMPLES` samples or the last `WINDOW_MAX_HOURS` of time.
pub const WINDOW_MAX_SAMPLES: usize = 128;
pub const WINDOW_MAX_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct Thresholds {
    pub voltage_high_v: f64,
    pub voltage_low_v: f64,
    pub voltage_hysteresis_v: f64,
    pub temperature_high_c: f64,
    pub temperature_clear_c: f64,
    pub temperature_critical_c: f64,
    pub resistance_drift_ratio: f64,
    pub resistance_clear_ratio: f64,
    pub resistance_window_minutes: u64,
    pub soh_warning_pct: f64,
    pub soh_clear_pct: f64,
    pub soh_critical_pct: f64,
    pub soh_clear_hold_hours: u64,
    pub rul_warning_days: f64,
    pub rul_critical_days: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            voltage_high_v: 14.7,
            voltage_low_v: 10.5,
            voltage_hysteresis_v: 0.3,
            temperature_high_c: 45.0,
            temperature_clear_c: 43.0,
            temperature_critical_c: 55.0,
            resistance_drift_ratio: 1.20,
            resistance_clear_ratio: 1.10,
            resistance_window_minutes: 10,
            soh_warning_pct: 80.0,
            soh_clear_pct: 82.0,
            soh_critical_pct: 70.0,
            soh_clear_hold_hours: 24,
            rul_warning_days: 180.0,
            rul_critical_days: 90.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    VoltageHigh,
    VoltageLow,
    TemperatureHigh,
    ResistanceDrift,
    SohDegraded,
    RulWarning,
    RulCritical,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::VoltageHigh => "voltage_high",
            AlertKind::VoltageLow => "voltage_low",
            AlertKind::TemperatureHigh => "temperature_high",
            AlertKind::ResistanceDrift => "resistance_drift",
            AlertKind::SohDegraded => "soh_degraded",
            AlertKind::RulWarning => "rul_warning",
            AlertKind::RulCritical => "rul_critical",
        }
    }

    pub fn parse(raw: &str) -> Option<AlertKind> {
        match raw.trim() {
            "voltage_high" => Some(AlertKind::VoltageHigh),
            "voltage_low" => Some(AlertKind::VoltageLow),
            "temperature_high" => Some(AlertKind::TemperatureHigh),
            "resistance_drift" => Some(AlertKind::ResistanceDrift),
            "soh_degraded" => Some(AlertKind::SohDegraded),
            "rul_warning" => Some(AlertKind::RulWarning),
            "rul_critical" => Some(AlertKind::RulCritical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Severity::Info => 0,
            Severity::Warning => 1,
            Severity::Critical => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSample {
    pub ts: DateTime<Utc>,
    pub voltage_v: f64,
    pub temperature_c: f64,
    pub resistance_mohm: f64,
    pub soc_pct: f64,
    pub soh_pct: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Open {
        kind: AlertKind,
        severity: Severity,
        message: String,
        threshold: f64,
        observed: f64,
    },
    Close {
        kind: AlertKind,
        observed: f64,
    },
    Escalate {
        kind: AlertKind,
        severity: Severity,
        message: String,
        observed: f64,
    },
}

/// Per-battery evaluator state. Only the evaluator touches it; samples for
/// one battery are applied strictly in commit order.
#[derive(Debug, Default)]
pub struct BatteryWindow {
    samples: VecDeque<WindowSample>,
    open: HashMap<AlertKind, Severity>,
    soh_clear_since: Option<DateTime<Utc>>,
}

impl BatteryWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self, kind: AlertKind) -> bool {
        self.open.contains_key(&kind)
    }

    pub fn mark_open(&mut self, kind: AlertKind, severity: Severity) {
        self.open.insert(kind, severity);
    }

    /// Sync hook for user-driven resolution through the API.
    pub fn mark_resolved(&mut self, kind: AlertKind) {
        self.open.remove(&kind);
    }

    pub fn max_open_severity(&self) -> Option<Severity> {
        self.open.values().copied().max_by_key(Severity::rank)
    }

    pub fn push_history(&mut self, sample: WindowSample) {
        self.samples.push_back(sample);
        self.trim();
    }

    fn trim(&mut self) {
        while self.samples.len() > WINDOW_MAX_SAMPLES {
            self.samples.pop_front();
        }
        if let Some(newest) = self.samples.back().map(|s| s.ts) {
            let cutoff = newest - ChronoDuration::hours(WINDOW_MAX_HOURS);
            while let Some(front) = self.samples.front() {
                if front.ts < cutoff {
                    self.samples.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    fn last_n_all<F>(&self, n: usize, predicate: F) -> bool
    where
        F: Fn(&WindowSample) -> bool,
    {
        if self.samples.len() < n {
            return false;
        }
        self.samples.iter().rev().take(n).all(|s| predicate(s))
    }

    fn resistance_baseline(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut values: Vec<f64> = self.samples.iter().map(|s| s.resistance_mohm).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mid = values.len() / 2;
        if values.len() % 2 == 0 {
            Some((values[mid - 1] + values[mid]) / 2.0)
        } else {
            Some(values[mid])
        }
    }

    /// Applies one telemetry sample and returns the alert transitions it
    /// causes. The caller persists transitions and emits frames.
    pub fn evaluate_sample(
        &mut self,
        thresholds: &Thresholds,
        sample: WindowSample,
    ) -> Vec<Transition> {
        self.push_history(sample);
        let mut transitions = Vec::new();

        self.eval_voltage_high(thresholds, &sample, &mut transitions);
        self.eval_voltage_low(thresholds, &sample, &mut transitions);
        self.eval_temperature(thresholds, &sample, &mut transitions);
        self.eval_resistance(thresholds, &sample, &mut transitions);
        self.eval_soh(thresholds, &sample, &mut transitions);

        self.apply(&transitions);
        transitions
    }

    /// Applies a fresh RUL prediction (days) for this battery.
    pub fn evaluate_rul(
        &mut self,
        thresholds: &Thresholds,
        rul_days: f64,
        battery_id: &str,
    ) -> Vec<Transition> {
        let mut transitions = Vec::new();
        let cases = [
            (AlertKind::RulWarning, thresholds.rul_warning_days, Severity::Warning),
            (AlertKind::RulCritical, thresholds.rul_critical_days, Severity::Critical),
        ];
        for (kind, threshold, severity) in cases {
            let open = self.is_open(kind);
            if rul_days < threshold && !open {
                transitions.push(Transition::Open {
                    kind,
                    severity,
                    message: format!(
                        "Battery {battery_id} remaining useful life {rul_days:.0} d below {threshold:.0} d"
                    ),
                    threshold,
                    observed: rul_days,
                });
            } else if rul_days >= threshold && open {
                transitions.push(Transition::Close {
                    kind,
                    observed: rul_days,
                });
            }
        }
        self.apply(&transitions);
        transitions
    }

    fn apply(&mut self, transitions: &[Transition]) {
        for transition in transitions {
            match transition {
                Transition::Open { kind, severity, .. } => {
                    self.open.insert(*kind, *severity);
                }
                Transition::Close { kind, .. } => {
                    self.open.remove(kind);
                }
                Transition::Escalate { kind, severity, .. } => {
                    self.open.insert(*kind, *severity);
                }
            }
        }
    }

    fn eval_voltage_high(
        &self,
        thresholds: &Thresholds,
        sample: &WindowSample,
        out: &mut Vec<Transition>,
    ) {
        let kind = AlertKind::VoltageHigh;
        let high = thresholds.voltage_high_v;
        if !self.is_open(kind) {
            if self.last_n_all(2, |s| s.voltage_v > high) {
                out.push(Transition::Open {
                    kind,
                    severity: Severity::Warning,
                    message: format!(
                        "Voltage {:.2} V above threshold {high:.2} V",
                        sample.voltage_v
                    ),
                    threshold: high,
                    observed: sample.voltage_v,
                });
            }
        } else {
            let clear = high - thresholds.voltage_hysteresis_v;
            if self.last_n_all(2, |s| s.voltage_v <= clear) {
                out.push(Transition::Close {
                    kind,
                    observed: sample.voltage_v,
                });
            }
        }
    }

    fn eval_voltage_low(
        &self,
        thresholds: &Thresholds,
        sample: &WindowSample,
        out: &mut Vec<Transition>,
    ) {
        let kind = AlertKind::VoltageLow;
        let low = thresholds.voltage_low_v;
        if !self.is_open(kind) {
            if self.last_n_all(2, |s| s.voltage_v < low) {
                out.push(Transition::Open {
                    kind,
                    severity: Severity::Warning,
                    message: format!(
                        "Voltage {:.2} V below threshold {low:.2} V",
                        sample.voltage_v
                    ),
                    threshold: low,
                    observed: sample.voltage_v,
                });
            }
        } else {
            let clear = low + thresholds.voltage_hysteresis_v;
            if self.last_n_all(2, |s| s.voltage_v >= clear) {
                out.push(Transition::Close {
                    kind,
                    observed: sample.voltage_v,
                });
            }
        }
    }

    fn eval_temperature(
        &self,
        thresholds: &Thresholds,
        sample: &WindowSample,
        out: &mut Vec<Transition>,
    ) {
        let kind = AlertKind::TemperatureHigh;
        let temp = sample.temperature_c;
        let severity = if temp > thresholds.temperature_critical_c {
            Severity::Critical
        } else {
            Severity::Warning
        };
        match self.open.get(&kind) {
            None => {
                if temp > thresholds.temperature_high_c {
                    out.push(Transition::Open {
                        kind,
                        severity,
                        message: format!(
                            "Temperature {temp:.1} °C above threshold {:.1} °C",
                            thresholds.temperature_high_c
                        ),
                        threshold: thresholds.temperature_high_c,
                        observed: temp,
                    });
                }
            }
            Some(current) => {
                if temp <= thresholds.temperature_clear_c {
                    out.push(Transition::Close {
                        kind,
                        observed: temp,
                    });
                } else if severity.rank() > current.rank() {
                    out.push(Transition::Escalate {
                        kind,
                        severity,
                        message: format!(
                            "Temperature {temp:.1} °C above critical threshold {:.1} °C",
                            thresholds.temperature_critical_c
                        ),
                        observed: temp,
                    });
                }
            }
        }
    }

    fn eval_resistance(
        &self,
        thresholds: &Thresholds,
        sample: &WindowSample,
        out: &mut Vec<Transition>,
    ) {
        let kind = AlertKind::ResistanceDrift;
        let Some(baseline) = self.resistance_baseline() else {
            return;
        };
        if baseline <= 0.0 {
            return;
        }
        if !self.is_open(kind) {
            let drift_floor = baseline * thresholds.resistance_drift_ratio;
            let window_start =
                sample.ts - ChronoDuration::minutes(thresholds.resistance_window_minutes as i64);
            let covers_window = self
                .samples
                .front()
                .map(|s| s.ts <= window_start)
                .unwrap_or(false);
            let sustained = self
                .samples
                .iter()
                .filter(|s| s.ts >= window_start)
                .all(|s| s.resistance_mohm > drift_floor);
            if covers_window && sustained {
                out.push(Transition::Open {
                    kind,
                    severity: Severity::Warning,
                    message: format!(
                        "Internal resistance {:.2} mΩ exceeds baseline {:.2} mΩ by more than {:.0}%",
                        sample.resistance_mohm,
                        baseline,
                        (thresholds.resistance_drift_ratio - 1.0) * 100.0
                    ),
                    threshold: drift_floor,
                    observed: sample.resistance_mohm,
                });
            }
        } else if sample.resistance_mohm <= baseline * thresholds.resistance_clear_ratio {
            out.push(Transition::Close {
                kind,
                observed: sample.resistance_mohm,
            });
        }
    }

    fn eval_soh(
        &mut self,
        thresholds: &Thresholds,
        sample: &WindowSample,
        out: &mut Vec<Transition>,
    ) {
        let kind = AlertKind::SohDegraded;
        let soh = sample.soh_pct;

        if soh >= thresholds.soh_clear_pct {
            if self.soh_clear_since.is_none() {
                self.soh_clear_since = Some(sample.ts);
            }
        } else {
            self.soh_clear_since = None;
        }

        let severity = if soh < thresholds.soh_critical_pct {
            Severity::Critical
        } else {
            Severity::Warning
        };
        match self.open.get(&kind) {
            None => {
                if soh < thresholds.soh_warning_pct {
                    out.push(Transition::Open {
                        kind,
                        severity,
                        message: format!(
                            "State of health {soh:.1}% below threshold {:.1}%",
                            thresholds.soh_warning_pct
                        ),
                        threshold: thresholds.soh_warning_pct,
                        observed: soh,
                    });
                }
            }
            Some(current) => {
                let held = self.soh_clear_since.is_some_and(|since| {
                    sample.ts - since
                        >= ChronoDuration::hours(thresholds.soh_clear_hold_hours as i64)
                });
                if held {
                    out.push(Transition::Close {
                        kind,
                        observed: soh,
                    });
                } else if severity.rank() > current.rank() {
                    out.push(Transition::Escalate {
                        kind,
                        severity,
                        message: format!(
                            "State of health {soh:.1}% below critical threshold {:.1}%",
                            thresholds.soh_critical_pct
                        ),
                        observed: soh,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, minute, second).unwrap()
    }

    fn sample(ts: DateTime<Utc>) -> WindowSample {
        WindowSample {
            ts,
            voltage_v: 13.2,
            temperature_c: 25.0,
            resistance_mohm: 5.0,
            soc_pct: 95.0,
            soh_pct: 98.0,
        }
    }

    fn opens(transitions: &[Transition], kind: AlertKind) -> bool {
        transitions
            .iter()
            .any(|t| matches!(t, Transition::Open { kind: k, .. } if *k == kind))
    }

    fn closes(transitions: &[Transition], kind: AlertKind) -> bool {
        transitions
            .iter()
            .any(|t| matches!(t, Transition::Close { kind: k, .. } if *k == kind))
    }

    #[test]
    fn nominal_samples_raise_nothing() {
        let mut window = BatteryWindow::new();
        let thresholds = Thresholds::default();
        for i in 0..10 {
            let transitions = window.evaluate_sample(&thresholds, sample(at(i, 0)));
            assert!(transitions.is_empty());
        }
    }

    #[test]
    fn temperature_opens_on_first_hot_sample_and_needs_hysteresis_to_close() {
        let mut window = BatteryWindow::new();
        let thresholds = Thresholds::default();

        let mut hot = sample(at(0, 0));
        hot.temperature_c = 46.0;
        let transitions = window.evaluate_sample(&thresholds, hot);
        assert!(opens(&transitions, AlertKind::TemperatureHigh));

        let mut still_hot = sample(at(1, 0));
        still_hot.temperature_c = 46.1;
        let transitions = window.evaluate_sample(&thresholds, still_hot);
        assert!(transitions.is_empty(), "second hot sample must not re-open");

        // 44.0 is below the open threshold but above the 43.0 clear band.
        let mut cooling = sample(at(2, 0));
        cooling.temperature_c = 44.0;
        let transitions = window.evaluate_sample(&thresholds, cooling);
        assert!(transitions.is_empty(), "alert must stay open inside the band");

        let mut cool = sample(at(3, 0));
        cool.temperature_c = 42.5;
        let transitions = window.evaluate_sample(&thresholds, cool);
        assert!(closes(&transitions, AlertKind::TemperatureHigh));
        assert!(window.max_open_severity().is_none());
    }

    #[test]
    fn temperature_escalates_to_critical_past_55() {
        let mut window = BatteryWindow::new();
        let thresholds = Thresholds::default();

        let mut hot = sample(at(0, 0));
        hot.temperature_c = 47.0;
        window.evaluate_sample(&thresholds, hot);
        assert_eq!(window.max_open_severity(), Some(Severity::Warning));

        let mut very_hot = sample(at(1, 0));
        very_hot.temperature_c = 56.0;
        let transitions = window.evaluate_sample(&thresholds, very_hot);
        assert!(transitions
            .iter()
            .any(|t| matches!(t, Transition::Escalate { severity: Severity::Critical, .. })));
        assert_eq!(window.max_open_severity(), Some(Severity::Critical));
    }

    #[test]
    fn voltage_high_requires_two_consecutive_samples() {
        let mut window = BatteryWindow::new();
        let thresholds = Thresholds::default();

        let mut spike = sample(at(0, 0));
        spike.voltage_v = 15.0;
        let transitions = window.evaluate_sample(&thresholds, spike);
        assert!(transitions.is_empty(), "one sample is not enough");

        let mut spike2 = sample(at(1, 0));
        spike2.voltage_v = 15.1;
        let transitions = window.evaluate_sample(&thresholds, spike2);
        assert!(opens(&transitions, AlertKind::VoltageHigh));

        // One sample back under the hysteresis band does not close.
        let mut dip = sample(at(2, 0));
        dip.voltage_v = 14.3;
        let transitions = window.evaluate_sample(&thresholds, dip);
        assert!(transitions.is_empty());

        let mut dip2 = sample(at(3, 0));
        dip2.voltage_v = 14.2;
        let transitions = window.evaluate_sample(&thresholds, dip2);
        assert!(closes(&transitions, AlertKind::VoltageHigh));
    }

    #[test]
    fn voltage_low_interrupted_run_does_not_open() {
        let mut window = BatteryWindow::new();
        let thresholds = Thresholds::default();

        let mut sag = sample(at(0, 0));
        sag.voltage_v = 10.2;
        assert!(window.evaluate_sample(&thresholds, sag).is_empty());

        let recovered = sample(at(1, 0));
        assert!(window.evaluate_sample(&thresholds, recovered).is_empty());

        let mut sag2 = sample(at(2, 0));
        sag2.voltage_v = 10.1;
        assert!(window.evaluate_sample(&thresholds, sag2).is_empty());

        let mut sag3 = sample(at(3, 0));
        sag3.voltage_v = 10.0;
        assert!(opens(
            &window.evaluate_sample(&thresholds, sag3),
            AlertKind::VoltageLow
        ));
    }

    #[test]
    fn soh_opens_below_80_and_closes_after_24h_above_82() {
        let mut window = BatteryWindow::new();
        let thresholds = Thresholds::default();

        let mut degraded = sample(at(0, 0));
        degraded.soh_pct = 79.0;
        assert!(opens(
            &window.evaluate_sample(&thresholds, degraded),
            AlertKind::SohDegraded
        ));

        // Recovery starts; still open before the 24 h hold elapses.
        let mut recovering = sample(at(30, 0));
        recovering.soh_pct = 83.0;
        assert!(window.evaluate_sample(&thresholds, recovering).is_empty());

        let base = at(30, 0);
        let mut held = sample(base + ChronoDuration::hours(24));
        held.soh_pct = 83.5;
        assert!(closes(
            &window.evaluate_sample(&thresholds, held),
            AlertKind::SohDegraded
        ));
    }

    #[test]
    fn soh_escalates_below_70() {
        let mut window = BatteryWindow::new();
        let thresholds = Thresholds::default();

        let mut degraded = sample(at(0, 0));
        degraded.soh_pct = 78.0;
        window.evaluate_sample(&thresholds, degraded);

        let mut worse = sample(at(1, 0));
        worse.soh_pct = 69.0;
        let transitions = window.evaluate_sample(&thresholds, worse);
        assert!(transitions
            .iter()
            .any(|t| matches!(t, Transition::Escalate { severity: Severity::Critical, .. })));
    }

    #[test]
    fn resistance_drift_needs_sustained_ten_minutes() {
        let mut window = BatteryWindow::new();
        let thresholds = Thresholds::default();
        let start = at(0, 0);

        // Establish a 5 mΩ baseline over 20 minutes.
        for i in 0..20 {
            let transitions =
                window.evaluate_sample(&thresholds, sample(start + ChronoDuration::minutes(i)));
            assert!(transitions.is_empty());
        }

        // Drift above baseline * 1.2; the first drifted sample cannot open.
        let mut opened = false;
        for i in 20..32 {
            let mut drifted = sample(start + ChronoDuration::minutes(i));
            drifted.resistance_mohm = 6.5;
            let transitions = window.evaluate_sample(&thresholds, drifted);
            if opens(&transitions, AlertKind::ResistanceDrift) {
                assert!(i >= 30, "opened before the 10 min window was sustained");
                opened = true;
                break;
            }
        }
        assert!(opened);

        // Back under baseline * 1.1 closes immediately.
        let mut settled = sample(start + ChronoDuration::minutes(40));
        settled.resistance_mohm = 5.2;
        assert!(closes(
            &window.evaluate_sample(&thresholds, settled),
            AlertKind::ResistanceDrift
        ));
    }

    #[test]
    fn rul_thresholds_open_and_close_independently() {
        let mut window = BatteryWindow::new();
        let thresholds = Thresholds::default();

        let transitions = window.evaluate_rul(&thresholds, 120.0, "BAT-3");
        assert!(opens(&transitions, AlertKind::RulWarning));
        assert!(!opens(&transitions, AlertKind::RulCritical));

        let transitions = window.evaluate_rul(&thresholds, 45.0, "BAT-3");
        assert!(opens(&transitions, AlertKind::RulCritical));

        let transitions = window.evaluate_rul(&thresholds, 200.0, "BAT-3");
        assert!(closes(&transitions, AlertKind::RulWarning));
        assert!(closes(&transitions, AlertKind::RulCritical));
        assert!(window.max_open_severity().is_none());
    }

    #[test]
    fn window_is_bounded_by_sample_count_and_time() {
        let mut window = BatteryWindow::new();
        let start = at(0, 0);
        for i in 0..200 {
            window.push_history(sample(start + ChronoDuration::seconds(i)));
        }
        assert_eq!(window.samples.len(), WINDOW_MAX_SAMPLES);

        window.push_history(sample(start + ChronoDuration::hours(30)));
        assert_eq!(window.samples.len(), 1, "old samples fall out by time");
    }

    #[test]
    fn duplicate_open_is_impossible_from_rules() {
        let mut window = BatteryWindow::new();
        let thresholds = Thresholds::default();
        for i in 0..6 {
            let mut hot = sample(at(i, 0));
            hot.temperature_c = 48.0;
            let transitions = window.evaluate_sample(&thresholds, hot);
            if i == 0 {
                assert!(opens(&transitions, AlertKind::TemperatureHigh));
            } else {
                assert!(!opens(&transitions, AlertKind::TemperatureHigh));
            }
        }
    }
}
