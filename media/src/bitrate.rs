// Adaptive bitrate controller.
//
// A per-session closed loop fed by control-plane feedback. The controller
// only computes targets; the control thread asks the encoder's reconfigure
// hook to apply them and reports the outcome back through
// `confirm_bitrate_change`. State lives inside the session, one controller
// per session, no shared map.
//
// Settings are read per call so configuration changes apply on the next
// feedback message. The POOR-status clamp runs after the loss-category
// reduction, and the default minimum bitrate is 1 kbps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use strum_macros::Display;

use crate::config::AutoBitrateSettings;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum ConnectionStatus {
    #[strum(serialize = "okay")]
    Okay,
    #[strum(serialize = "poor")]
    Poor,
}

impl ConnectionStatus {
    pub fn from_wire(val: u32) -> ConnectionStatus {
        if val == 1 {
            ConnectionStatus::Poor
        } else {
            ConnectionStatus::Okay
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            ConnectionStatus::Okay => 0,
            ConnectionStatus::Poor => 1,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ControllerStats {
    pub current_bitrate_kbps: i32,
    /// Milliseconds from session start to the last successful adjustment,
    /// zero when nothing was ever adjusted.
    pub last_adjustment_ms: u64,
    pub adjustment_count: u32,
    pub loss_percentage: f64,
}

struct ControllerState {
    current_bitrate_kbps: i32,
    last_reported_good_frame: u64,
    loss_percentage: f64,
    connection_status: ConnectionStatus,
    session_start: Instant,
    last_adjustment: Instant,
    last_successful_adjustment: Instant,
    last_loss_stats: Instant,
    adjustment_count: u32,
}

impl ControllerState {
    fn new(current_bitrate_kbps: i32, now: Instant) -> ControllerState {
        ControllerState {
            current_bitrate_kbps,
            last_reported_good_frame: 0,
            loss_percentage: 0.0,
            connection_status: ConnectionStatus::Okay,
            session_start: now,
            last_adjustment: now,
            last_successful_adjustment: now,
            last_loss_stats: now,
            adjustment_count: 0,
        }
    }
}

pub struct BitrateController {
    enabled: bool,
    requested_bitrate_kbps: i32,
    client_min_kbps: i32,
    client_max_kbps: i32,
    framerate: u32,
    v2_active: AtomicBool,
    state: Mutex<ControllerState>,
}

impl BitrateController {
    pub fn new(
        enabled: bool,
        requested_bitrate_kbps: i32,
        client_min_kbps: i32,
        client_max_kbps: i32,
        framerate: u32,
        now: Instant,
    ) -> BitrateController {
        BitrateController {
            enabled,
            requested_bitrate_kbps,
            client_min_kbps,
            client_max_kbps,
            framerate,
            v2_active: AtomicBool::new(false),
            state: Mutex::new(ControllerState::new(requested_bitrate_kbps, now)),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// True once the client has sent V2 loss telemetry; V1 reports are
    /// ignored afterwards so the two paths never fight.
    pub fn v2_active(&self) -> bool {
        self.v2_active.load(Ordering::Acquire)
    }

    pub fn mark_v2_active(&self) {
        self.v2_active.store(true, Ordering::Release);
    }

    pub fn current_bitrate(&self) -> i32 {
        self.state.lock().current_bitrate_kbps
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.state.lock().connection_status
    }

    pub fn loss_percentage(&self) -> f64 {
        self.state.lock().loss_percentage
    }

    /// Legacy loss report: derive loss from the expected frame progression
    /// since the previous report.
    pub fn process_loss_stats(&self, last_good_frame: u64, interval: Duration, now: Instant) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.lock();
        state.loss_percentage =
            compute_loss_percentage(&state, last_good_frame, interval, self.framerate);
        state.last_reported_good_frame = last_good_frame;
        state.last_loss_stats = now;
        // current_bitrate_kbps is only moved by confirm_bitrate_change.
    }

    /// V2 loss report: the client computed the percentage itself.
    pub fn process_loss_stats_direct(&self, loss_percentage: f64, last_good_frame: u64, now: Instant) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.lock();
        state.loss_percentage = loss_percentage;
        state.last_reported_good_frame = last_good_frame;
        state.last_loss_stats = now;
    }

    pub fn process_connection_status(&self, status: ConnectionStatus) {
        if !self.enabled {
            return;
        }
        self.state.lock().connection_status = status;
    }

    pub fn should_adjust_bitrate(&self, settings: &AutoBitrateSettings, now: Instant) -> bool {
        if !self.enabled {
            return false;
        }
        let state = self.state.lock();

        let mut min_interval_ms = settings.adjustment_interval_ms;
        if min_interval_ms <= 0 {
            min_interval_ms = 3000;
        }
        let since_last_adjustment = millis_since(state.last_adjustment, now);
        if since_last_adjustment < min_interval_ms {
            return false;
        }

        let factor = adjustment_factor(&state, settings, now);

        let mut min_adjustment_pct = settings.min_adjustment_pct;
        if min_adjustment_pct < 0 {
            min_adjustment_pct = 5;
        }
        let min_adjustment_factor = f64::from(min_adjustment_pct) / 100.0;
        if (min_adjustment_pct == 0 && factor == 1.0)
            || (min_adjustment_pct > 0 && (factor - 1.0).abs() < min_adjustment_factor)
        {
            return false;
        }
        true
    }

    /// Compute the clamped target for the current factor. State is not
    /// updated here; that happens in `confirm_bitrate_change` once the
    /// encoder has actually applied the change.
    pub fn calculate_new_bitrate(&self, settings: &AutoBitrateSettings, now: Instant) -> i32 {
        if !self.enabled {
            return self.requested_bitrate_kbps;
        }
        let state = self.state.lock();

        let factor = adjustment_factor(&state, settings, now);
        let new_bitrate = (f64::from(state.current_bitrate_kbps) * factor) as i32;

        let client_min = self.client_min_kbps.max(0);
        let client_max = self.client_max_kbps.max(0);

        let mut server_min = settings.min_kbps;
        if server_min <= 0 {
            server_min = 1;
        }

        let mut server_max = settings.max_kbps;
        if server_max <= 0 {
            server_max = if settings.max_bitrate_cap > 0 {
                settings.max_bitrate_cap
            } else {
                0
            };
        } else if settings.max_bitrate_cap > 0 && settings.max_bitrate_cap < server_max {
            server_max = settings.max_bitrate_cap;
        }

        // Client bounds win where present, clamped by the server's absolute
        // limits.
        let mut min_bitrate = if client_min > 0 { client_min } else { server_min };
        if min_bitrate < server_min {
            min_bitrate = server_min;
        }

        let mut max_bitrate = if client_max > 0 {
            if server_max > 0 && client_max > server_max {
                server_max
            } else {
                client_max
            }
        } else if server_max > 0 {
            server_max
        } else {
            let requested = self.requested_bitrate_kbps;
            if requested < 1 {
                1000
            } else {
                requested
            }
        };

        if min_bitrate > max_bitrate {
            min_bitrate = max_bitrate;
        }
        if min_bitrate < 1 {
            min_bitrate = 1;
        }
        if max_bitrate < 1 {
            max_bitrate = 1;
        }

        new_bitrate.clamp(min_bitrate, max_bitrate)
    }

    /// Record the encoder's verdict. `last_adjustment` always moves so a
    /// rejected reconfigure still respects the adjustment interval instead
    /// of retrying on every feedback message.
    pub fn confirm_bitrate_change(&self, new_bitrate_kbps: i32, success: bool, now: Instant) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.lock();
        state.last_adjustment = now;

        if success && new_bitrate_kbps != state.current_bitrate_kbps {
            state.adjustment_count += 1;
            state.current_bitrate_kbps = new_bitrate_kbps;
            state.last_successful_adjustment = now;
        }
    }

    pub fn reset(&self, now: Instant) {
        *self.state.lock() = ControllerState::new(self.requested_bitrate_kbps, now);
        self.v2_active.store(false, Ordering::Release);
    }

    pub fn stats(&self) -> Option<ControllerStats> {
        if !self.enabled {
            return None;
        }
        let state = self.state.lock();
        let last_adjustment_ms = if state.adjustment_count > 0 {
            state
                .last_successful_adjustment
                .saturating_duration_since(state.session_start)
                .as_millis() as u64
        } else {
            0
        };
        Some(ControllerStats {
            current_bitrate_kbps: state.current_bitrate_kbps,
            last_adjustment_ms,
            adjustment_count: state.adjustment_count,
            loss_percentage: state.loss_percentage,
        })
    }
}

fn millis_since(earlier: Instant, now: Instant) -> i64 {
    now.saturating_duration_since(earlier).as_millis() as i64
}

/// Expected-progression loss estimate for legacy clients. The first report
/// has no baseline and counts as zero loss. Framerates above 1000 are
/// millifps.
fn compute_loss_percentage(
    state: &ControllerState,
    last_good_frame: u64,
    interval: Duration,
    framerate: u32,
) -> f64 {
    if state.last_reported_good_frame == 0 {
        return 0.0;
    }

    let mut framerate = framerate as f64;
    if framerate > 1000.0 {
        framerate /= 1000.0;
    }

    let expected_frames = framerate * interval.as_secs_f64();
    if expected_frames <= 0.0 {
        return 0.0;
    }
    let expected_current_frame = state.last_reported_good_frame + expected_frames as u64;

    let loss_count = expected_current_frame.saturating_sub(last_good_frame);
    (loss_count as f64 / expected_frames) * 100.0
}

fn adjustment_factor(
    state: &ControllerState,
    settings: &AutoBitrateSettings,
    now: Instant,
) -> f64 {
    let severe_threshold = settings.loss_severe_pct.max(0);
    let moderate_threshold = settings.loss_moderate_pct.max(0);
    let mild_threshold = settings.loss_mild_pct.max(0);

    let severe_reduction = settings.decrease_severe_pct.max(0);
    let moderate_reduction = settings.decrease_moderate_pct.max(0);
    let mild_reduction = settings.decrease_mild_pct.max(0);
    let increase_pct = settings.increase_good_pct.max(0);
    let poor_status_cap_pct = settings.poor_status_cap_pct.max(0);

    let since_last_adjustment = millis_since(state.last_adjustment, now);

    let mut factor = if state.loss_percentage > f64::from(severe_threshold) {
        1.0 - f64::from(severe_reduction) / 100.0
    } else if state.loss_percentage > f64::from(moderate_threshold) {
        1.0 - f64::from(moderate_reduction) / 100.0
    } else if state.loss_percentage > f64::from(mild_threshold) {
        1.0 - f64::from(mild_reduction) / 100.0
    } else if since_last_adjustment >= settings.good_stability_ms
        && state.connection_status == ConnectionStatus::Okay
    {
        1.0 + f64::from(increase_pct) / 100.0
    } else {
        1.0
    };

    // A POOR client report forces at least the configured reduction even
    // when measured loss is low.
    if state.connection_status == ConnectionStatus::Poor {
        factor = factor.min(1.0 - f64::from(poor_status_cap_pct) / 100.0);
    }

    if factor > 1.0 && since_last_adjustment < settings.increase_min_interval_ms {
        return 1.0;
    }

    factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AutoBitrateSettings;

    fn defaults() -> AutoBitrateSettings {
        AutoBitrateSettings::default()
    }

    fn controller(requested: i32, fps: u32, now: Instant) -> BitrateController {
        BitrateController::new(true, requested, 0, 0, fps, now)
    }

    fn at(start: Instant, ms: u64) -> Instant {
        start + Duration::from_millis(ms)
    }

    #[test]
    fn severe_loss_reduces_bitrate() {
        let t0 = Instant::now();
        let ctl = controller(10_000, 60, t0);
        let settings = defaults();

        let now = at(t0, 4000);
        ctl.process_loss_stats_direct(15.0, 200, now);
        ctl.process_connection_status(ConnectionStatus::Okay);

        assert!(ctl.should_adjust_bitrate(&settings, now));
        let new = ctl.calculate_new_bitrate(&settings, now);
        assert_eq!(new, 7500);

        ctl.confirm_bitrate_change(new, true, now);
        assert_eq!(ctl.current_bitrate(), 7500);
        assert_eq!(ctl.stats().unwrap().adjustment_count, 1);
    }

    #[test]
    fn good_range_increase_waits_for_stability() {
        let t0 = Instant::now();
        let ctl = controller(5000, 60, t0);
        let settings = defaults();

        // 2s in: the adjustment interval itself has not elapsed, and even
        // the raw factor would be 1.0 because the 5s stability window is
        // open.
        let now = at(t0, 2000);
        ctl.process_loss_stats_direct(0.0, 100, now);
        assert!(!ctl.should_adjust_bitrate(&settings, now));

        let now = at(t0, 6000);
        assert!(ctl.should_adjust_bitrate(&settings, now));
        assert_eq!(ctl.calculate_new_bitrate(&settings, now), 5250);
    }

    #[test]
    fn poor_status_caps_mild_loss() {
        let t0 = Instant::now();
        let ctl = controller(8000, 60, t0);
        let settings = defaults();

        let now = at(t0, 4000);
        ctl.process_loss_stats_direct(2.0, 100, now);
        ctl.process_connection_status(ConnectionStatus::Poor);

        // Mild band alone gives 0.95; POOR clamps to 0.75.
        assert!(ctl.should_adjust_bitrate(&settings, now));
        assert_eq!(ctl.calculate_new_bitrate(&settings, now), 6000);
    }

    #[test]
    fn failed_reconfigure_still_paces() {
        let t0 = Instant::now();
        let ctl = controller(10_000, 60, t0);
        let settings = defaults();

        let now = at(t0, 4000);
        ctl.process_loss_stats_direct(15.0, 200, now);
        assert!(ctl.should_adjust_bitrate(&settings, now));
        let new = ctl.calculate_new_bitrate(&settings, now);
        assert_eq!(new, 7500);

        ctl.confirm_bitrate_change(new, false, now);
        assert_eq!(ctl.current_bitrate(), 10_000);
        assert_eq!(ctl.stats().unwrap().adjustment_count, 0);

        // One second later the adjustment interval has not elapsed again.
        assert!(!ctl.should_adjust_bitrate(&settings, at(t0, 5000)));
    }

    #[test]
    fn clamps_to_client_max() {
        let t0 = Instant::now();
        let ctl = BitrateController::new(true, 5000, 2000, 6000, 60, t0);
        let mut settings = defaults();
        settings.min_kbps = 500;
        settings.max_bitrate_cap = 0;

        // Stable long enough for an increase; raw factor pushes well past
        // the client max.
        {
            let mut state = ctl.state.lock();
            state.current_bitrate_kbps = 7200;
        }
        let now = at(t0, 6000);
        ctl.process_loss_stats_direct(0.0, 100, now);
        let new = ctl.calculate_new_bitrate(&settings, now);
        assert_eq!(new, 6000);
    }

    #[test]
    fn v1_and_v2_loss_paths_agree() {
        let t0 = Instant::now();
        let settings = defaults();

        let v1 = controller(10_000, 60, t0);
        // Seed the baseline, then report a 30-frame deficit over one second
        // of 60 fps: expected frame 160, reported 130, 50% loss.
        v1.process_loss_stats(100, Duration::from_millis(1000), at(t0, 1000));
        v1.process_loss_stats(130, Duration::from_millis(1000), at(t0, 4000));
        assert!((v1.loss_percentage() - 50.0).abs() < 1e-9);

        let v2 = controller(10_000, 60, t0);
        v2.process_loss_stats_direct(50.0, 130, at(t0, 4000));
        v2.mark_v2_active();

        let now = at(t0, 4000);
        assert_eq!(
            v1.calculate_new_bitrate(&settings, now),
            v2.calculate_new_bitrate(&settings, now)
        );
        assert_eq!(v1.calculate_new_bitrate(&settings, now), 7500);
    }

    #[test]
    fn no_baseline_means_no_loss() {
        let t0 = Instant::now();
        let ctl = controller(10_000, 60, t0);
        ctl.process_loss_stats(5, Duration::from_millis(1000), at(t0, 1000));
        assert_eq!(ctl.loss_percentage(), 0.0);
    }

    #[test]
    fn millifps_framerate_is_scaled() {
        let t0 = Instant::now();
        let ctl = controller(10_000, 59_940, t0);
        ctl.process_loss_stats(100, Duration::from_millis(1000), at(t0, 1000));
        // 59.94 fps for one second: expected frame 159, reported 129.
        ctl.process_loss_stats(129, Duration::from_millis(1000), at(t0, 2000));
        let loss = ctl.loss_percentage();
        assert!((loss - (30.0 / 59.94) * 100.0).abs() < 0.1, "{loss}");
    }

    #[test]
    fn poor_status_with_zero_loss_still_clamps() {
        let t0 = Instant::now();
        let ctl = controller(8000, 60, t0);
        let settings = defaults();

        let now = at(t0, 4000);
        ctl.process_connection_status(ConnectionStatus::Poor);
        assert!(ctl.should_adjust_bitrate(&settings, now));
        assert_eq!(ctl.calculate_new_bitrate(&settings, now), 6000);
    }

    #[test]
    fn min_adjustment_pct_boundaries() {
        let t0 = Instant::now();
        let ctl = controller(10_000, 60, t0);
        let now = at(t0, 4000);
        ctl.process_loss_stats_direct(2.0, 100, now);

        // 100% threshold disables every adjustment the policy can produce.
        let mut settings = defaults();
        settings.min_adjustment_pct = 100;
        assert!(!ctl.should_adjust_bitrate(&settings, now));

        // Zero admits any nonzero change (mild loss gives 0.95 here).
        settings.min_adjustment_pct = 0;
        assert!(ctl.should_adjust_bitrate(&settings, now));

        // Zero with a factor of exactly 1.0 is still a no-op.
        let idle = controller(10_000, 60, t0);
        assert!(!idle.should_adjust_bitrate(&settings, now));
    }

    #[test]
    fn reset_replays_identically() {
        let t0 = Instant::now();
        let ctl = controller(10_000, 60, t0);
        let settings = defaults();

        let run = |ctl: &BitrateController| -> Vec<i32> {
            let mut trajectory = Vec::new();
            for (ms, loss) in [(4000u64, 15.0), (8000, 6.0), (12_000, 0.5)] {
                let now = at(t0, ms);
                ctl.process_loss_stats_direct(loss, 100, now);
                if ctl.should_adjust_bitrate(&settings, now) {
                    let new = ctl.calculate_new_bitrate(&settings, now);
                    ctl.confirm_bitrate_change(new, true, now);
                }
                trajectory.push(ctl.current_bitrate());
            }
            trajectory
        };

        let first = run(&ctl);
        ctl.reset(t0);
        let second = run(&ctl);
        assert_eq!(first, second);
    }

    #[test]
    fn disabled_controller_is_inert() {
        let t0 = Instant::now();
        let ctl = BitrateController::new(false, 10_000, 0, 0, 60, t0);
        let settings = defaults();
        let now = at(t0, 10_000);
        ctl.process_loss_stats_direct(50.0, 100, now);
        assert!(!ctl.should_adjust_bitrate(&settings, now));
        assert_eq!(ctl.calculate_new_bitrate(&settings, now), 10_000);
        assert!(ctl.stats().is_none());
    }

    #[test]
    fn confirm_updates_last_adjustment_even_on_failure() {
        let t0 = Instant::now();
        let ctl = controller(10_000, 60, t0);
        let now = at(t0, 4000);
        ctl.confirm_bitrate_change(7500, false, now);
        assert_eq!(ctl.state.lock().last_adjustment, now);
    }
}
