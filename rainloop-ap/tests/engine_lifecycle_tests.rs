//! Transport, volume and recovery behavior of the mixer engine

mod helpers;

use helpers::{cycles, drain, test_config, tone, tones, Harness, RATE};
use rainloop_ap::backend::{ManualClock, PrecisionBackend};
use rainloop_ap::config::EngineConfig;
use rainloop_ap::playback::{HostVisibility, PlayOutcome, UnitState};
use rainloop_ap::{Error, MixerEngine};
use rainloop_common::events::MixerEvent;
use std::sync::Arc;

fn busy_units(h: &Harness) -> usize {
    h.engine
        .unit_states()
        .iter()
        .filter(|u| !u.state.is_free())
        .count()
}

// ============================================================================
// Transport
// ============================================================================

#[test]
fn test_play_publishes_state() {
    let mut h = Harness::precision(test_config(), &[10.0]);
    let mut events = h.engine.subscribe_events();
    let state_rx = h.engine.subscribe_state();
    assert!(!state_rx.borrow().is_playing);

    h.engine.play();
    assert!(state_rx.borrow().is_playing);
    assert!(state_rx.borrow().is_loaded);

    let events = drain(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, MixerEvent::StateChanged { is_playing: true, .. })));
}

#[test]
fn test_double_play_keeps_one_rotation() {
    let mut h = Harness::precision(test_config(), &[10.0]);
    let mut events = h.engine.subscribe_events();

    assert_eq!(h.engine.play(), PlayOutcome::Started);
    let generation = h.engine.generation();
    h.run_until(1.0);
    assert_eq!(h.engine.play(), PlayOutcome::AlreadyPlaying);

    assert_eq!(h.engine.generation(), generation);
    assert_eq!(busy_units(&h), 1);
    assert_eq!(cycles(&drain(&mut events)).len(), 1);
}

#[test]
fn test_double_play_arms_no_extra_timers() {
    let mut h = Harness::precision(test_config(), &[10.0, 10.0]);
    h.engine.play();
    h.run_until(1.0);
    let pending = h.engine.pending_timers();
    assert!(pending > 0);

    assert_eq!(h.engine.play(), PlayOutcome::AlreadyPlaying);
    assert_eq!(h.engine.play(), PlayOutcome::AlreadyPlaying);
    assert_eq!(h.engine.pending_timers(), pending);
    assert_eq!(h.engine.rotation_position(), 1);
}

#[test]
fn test_stop_leaves_units_idle_within_fade() {
    let mut h = Harness::precision(test_config(), &[10.0]);
    h.engine.play();
    h.run_until(5.0);

    h.engine.stop();
    assert!(!h.engine.state().is_playing);
    assert_eq!(h.count_in(UnitState::FadingOut), 1);

    // Stop fade is 0.5s, plus one tick
    h.run_until(5.51);
    assert!(h.all_idle());
    assert_eq!(h.engine.active_gain_sum(), 0.0);
    assert_eq!(h.engine.state().current_track_index, 0);
}

#[test]
fn test_stop_mid_crossfade_silences_both_units() {
    let mut h = Harness::precision(test_config(), &[10.0, 10.0]);
    let mut events = h.engine.subscribe_events();
    h.engine.play();
    h.run_until(8.5);
    assert_eq!(busy_units(&h), 2);

    h.engine.stop();
    assert_eq!(h.count_in(UnitState::FadingOut), 2);
    drain(&mut events);

    h.run_until(9.01);
    assert!(h.all_idle());

    // No stale timer revives the rotation
    h.run_until(30.0);
    assert!(h.all_idle());
    assert!(cycles(&drain(&mut events)).is_empty());
    assert_eq!(h.engine.diagnostics().crossfades_completed, 0);
}

#[test]
fn test_stop_mid_crossfade_on_coarse_backend() {
    let mut h = Harness::coarse(test_config(), &[10.0, 10.0]);
    let mut events = h.engine.subscribe_events();
    h.engine.play();
    h.run_until(8.5);
    assert_eq!(busy_units(&h), 2);

    h.engine.stop();
    assert_eq!(h.count_in(UnitState::FadingOut), 2);
    drain(&mut events);

    h.run_until(9.01);
    assert!(h.all_idle());
    assert_eq!(h.engine.active_gain_sum(), 0.0);

    h.run_until(30.0);
    assert!(h.all_idle());
    assert!(cycles(&drain(&mut events)).is_empty());
    assert_eq!(h.engine.diagnostics().crossfades_completed, 0);
}

#[test]
fn test_stop_before_scheduled_successor() {
    let mut h = Harness::precision(test_config(), &[10.0, 10.0]);
    let mut events = h.engine.subscribe_events();
    h.engine.play();
    // Successor is scheduled at 7.5s to start at 8.0s
    h.run_until(7.7);
    assert_eq!(busy_units(&h), 2);

    h.engine.stop();
    assert_eq!(busy_units(&h), 1);
    assert_eq!(h.count_in(UnitState::FadingOut), 1);
    assert_eq!(h.engine.rotation_position(), 0);
    drain(&mut events);

    h.run_until(8.21);
    assert!(h.all_idle());

    h.run_until(30.0);
    assert!(h.all_idle());
    assert!(cycles(&drain(&mut events)).is_empty());
}

fn pause_before_successor_resumes_with_it(mut h: Harness) {
    let mut events = h.engine.subscribe_events();
    h.engine.play();
    h.run_until(7.7);

    h.engine.pause();
    assert_eq!(h.engine.rotation_position(), 1);

    // Pause fade is 1s
    h.run_until(8.71);
    assert!(h.all_idle());
    assert_eq!(h.engine.diagnostics().crossfades_completed, 0);

    drain(&mut events);
    assert_eq!(h.engine.play(), PlayOutcome::Started);
    let resumed = cycles(&drain(&mut events));
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].0, 1);
    assert_eq!(h.engine.rotation_position(), 2);
}

#[test]
fn test_pause_before_successor_resumes_with_it() {
    pause_before_successor_resumes_with_it(Harness::precision(test_config(), &[10.0, 10.0, 10.0]));
    pause_before_successor_resumes_with_it(Harness::coarse(test_config(), &[10.0, 10.0, 10.0]));
}

#[test]
fn test_stop_when_stopped_is_noop() {
    let mut h = Harness::precision(test_config(), &[10.0]);
    h.engine.stop();
    h.engine.pause();
    assert!(h.all_idle());
    assert!(!h.engine.state().is_playing);
}

#[test]
fn test_pause_resumes_with_next_asset() {
    let mut h = Harness::precision(test_config(), &[10.0, 10.0, 10.0]);
    let mut events = h.engine.subscribe_events();

    h.engine.play();
    h.run_until(3.0);
    h.engine.pause();
    assert!(!h.engine.state().is_playing);

    // Pause fade is 1s
    h.run_until(4.01);
    assert!(h.all_idle());

    drain(&mut events);
    assert_eq!(h.engine.play(), PlayOutcome::Started);
    let resumed = cycles(&drain(&mut events));
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].0, 1);

    // Stop rewinds the rotation
    h.engine.stop();
    h.run_until(5.0);
    h.engine.play();
    let restarted = cycles(&drain(&mut events));
    assert_eq!(restarted[0].0, 0);
}

#[test]
fn test_play_during_pause_fade() {
    let mut h = Harness::precision(test_config(), &[10.0, 10.0]);
    h.engine.play();
    h.run_until(3.0);
    h.engine.pause();
    h.run_until(3.5);

    assert_eq!(h.engine.play(), PlayOutcome::Started);
    assert_eq!(h.count_in(UnitState::FadingOut), 1);
    assert_eq!(h.count_in(UnitState::FadingIn), 1);

    // The paused unit still gets released on time
    h.run_until(4.01);
    assert_eq!(busy_units(&h), 1);
    assert_eq!(h.count_in(UnitState::FadingIn), 1);
}

// ============================================================================
// Volume
// ============================================================================

#[test]
fn test_volume_change_is_smoothed() {
    let mut h = Harness::precision(test_config(), &[10.0]);
    let mut events = h.engine.subscribe_events();
    h.engine.play();
    h.run_until(3.0);
    assert!((h.engine.active_gain_sum() - 1.0).abs() < 1e-4);

    h.engine.set_volume(0.2);
    assert_eq!(h.engine.target_volume(), 0.2);

    let mut previous = h.engine.active_gain_sum();
    h.run_until_with(3.5, |t, engine| {
        let gain = engine.active_gain_sum();
        assert!((gain - previous).abs() <= 0.05, "jump {} -> {} at {:.2}s", previous, gain, t);
        previous = gain;
    });
    assert!((h.engine.active_gain_sum() - 0.2).abs() < 1e-4);
    assert!((h.engine.state().volume - 0.2).abs() < 1e-6);

    let changed: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, MixerEvent::VolumeChanged { .. }))
        .collect();
    assert_eq!(changed.len(), 1);
}

#[test]
fn test_volume_is_clamped_and_non_finite_ignored() {
    let mut h = Harness::precision(test_config(), &[10.0]);
    h.engine.set_volume(1.7);
    assert_eq!(h.engine.target_volume(), 1.0);
    h.engine.set_volume(-0.3);
    assert_eq!(h.engine.target_volume(), 0.0);
    h.engine.set_volume(f32::NAN);
    assert_eq!(h.engine.target_volume(), 0.0);
}

#[test]
fn test_volume_change_during_crossfade_rescales_both_units() {
    let mut h = Harness::precision(test_config(), &[10.0, 10.0]);
    h.engine.play();
    h.run_until(8.75);

    h.engine.set_volume(0.5);
    let mut previous = h.engine.active_gain_sum();
    assert!((previous - 1.0).abs() < 0.01);

    h.run_until_with(10.0, |t, engine| {
        let sum = engine.active_gain_sum();
        assert!(sum <= previous + 1e-4, "sum rose {} -> {} at {:.2}s", previous, sum, t);
        assert!(sum >= 0.5 - 1e-4, "sum {} at {:.2}s", sum, t);
        previous = sum;
    });
    assert!((h.engine.active_gain_sum() - 0.5).abs() < 1e-4);
    assert_eq!(h.engine.diagnostics().crossfades_completed, 1);
}

#[test]
fn test_volume_change_before_crossfade_keeps_it_level() {
    let mut h = Harness::precision(test_config(), &[10.0, 10.0]);
    h.engine.play();
    // Successor is already scheduled at 7.5s
    h.run_until(7.7);
    h.engine.set_volume(0.5);

    h.run_until(8.0);
    h.run_until_with(9.6, |t, engine| {
        let sum = engine.active_gain_sum();
        assert!((sum - 0.5).abs() < 0.01, "sum {} at {:.2}s", sum, t);
    });
}

// ============================================================================
// Host integration
// ============================================================================

#[test]
fn test_silent_playback_self_heals_on_visible() {
    let mut h = Harness::precision(test_config(), &[10.0]);
    let mut events = h.engine.subscribe_events();
    h.engine.play();
    h.run_until(3.0);
    let generation = h.engine.generation();

    h.engine.notify_visibility(HostVisibility::Hidden);
    h.health.mark_failed();
    h.at(4.0);
    h.engine.notify_visibility(HostVisibility::Visible);

    assert!(h.engine.generation() > generation);
    assert!(!h.health.is_failed());
    assert_eq!(h.engine.diagnostics().self_heals, 1);
    assert!(h.engine.state().is_playing);

    let units: Vec<_> = h
        .engine
        .unit_states()
        .into_iter()
        .filter(|u| !u.state.is_free())
        .collect();
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].state, UnitState::FadingIn);
    assert_eq!(units[0].scheduled_start, Some(4.0));

    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, MixerEvent::SelfHealed { .. })));
}

#[test]
fn test_sounding_playback_is_left_alone_on_visible() {
    let mut h = Harness::precision(test_config(), &[10.0]);
    h.engine.play();
    h.run_until(3.0);
    let generation = h.engine.generation();

    h.engine.notify_visibility(HostVisibility::Hidden);
    h.run_until(4.0);
    h.engine.notify_visibility(HostVisibility::Visible);

    assert_eq!(h.engine.generation(), generation);
    assert_eq!(h.engine.diagnostics().self_heals, 0);
}

fn stalled_output_self_heals(mut h: Harness) {
    let mut events = h.engine.subscribe_events();
    h.engine.play();
    h.run_until(3.0);
    assert!(!h.health.is_stalled());
    let generation = h.engine.generation();

    // Host stops pulling audio while hidden without reporting an error
    h.engine.notify_visibility(HostVisibility::Hidden);
    h.pause_rendering();
    h.run_until(5.0);
    assert!(h.health.is_stalled());
    assert!(!h.health.is_failed());

    h.resume_rendering();
    h.engine.notify_visibility(HostVisibility::Visible);
    assert!(h.engine.generation() > generation);
    assert_eq!(h.engine.diagnostics().self_heals, 1);
    assert!(!h.health.is_stalled());
    assert!(h.engine.state().is_playing);
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, MixerEvent::SelfHealed { .. })));

    // Output flowing again is left alone
    h.run_until(6.0);
    h.engine.notify_visibility(HostVisibility::Hidden);
    h.run_until(7.0);
    h.engine.notify_visibility(HostVisibility::Visible);
    assert_eq!(h.engine.diagnostics().self_heals, 1);
}

#[test]
fn test_stalled_output_self_heals_on_visible() {
    stalled_output_self_heals(Harness::precision_rendered(test_config(), &[10.0, 10.0]));
    stalled_output_self_heals(Harness::coarse_rendered(test_config(), &[10.0, 10.0]));
}

#[test]
fn test_rendered_playback_is_left_alone_on_visible() {
    let mut h = Harness::coarse_rendered(test_config(), &[10.0]);
    h.engine.play();
    h.run_until(3.0);
    h.engine.notify_visibility(HostVisibility::Hidden);
    h.run_until(5.0);
    h.engine.notify_visibility(HostVisibility::Visible);

    assert!(h.health.callback_count() > 0);
    assert_eq!(h.engine.diagnostics().self_heals, 0);
}

#[test]
fn test_blocked_host_rejects_play() {
    let mut h = Harness::precision(test_config(), &[10.0, 10.0]);
    h.health.set_blocked(true);

    assert_eq!(h.engine.play(), PlayOutcome::Rejected);
    let state = h.engine.state();
    assert!(!state.is_playing);
    assert!(state.is_loaded);
    assert!(h.all_idle());

    // A later user-initiated play succeeds once the host allows output
    h.health.set_blocked(false);
    assert_eq!(h.engine.play(), PlayOutcome::Started);
    assert!(h.engine.state().is_playing);
}

// ============================================================================
// Construction and teardown
// ============================================================================

#[test]
fn test_shutdown_releases_everything() {
    let mut h = Harness::precision(test_config(), &[10.0, 10.0]);
    h.engine.play();
    h.run_until(2.0);

    h.engine.shutdown();
    h.engine.shutdown();
    assert!(h.engine.is_shut_down());
    assert!(h.all_idle());
    assert!(h.engine.assets().is_empty());

    let state = h.engine.state();
    assert!(!state.is_playing);
    assert!(!state.is_loaded);
    assert_eq!(h.engine.play(), PlayOutcome::Rejected);
}

#[test]
fn test_no_assets_is_an_error() {
    let clock = Arc::new(ManualClock::new());
    let backend = PrecisionBackend::headless(clock, RATE, Default::default());
    let result = MixerEngine::with_assets(test_config(), Box::new(backend), Vec::new());
    assert!(matches!(result, Err(Error::NoPlayableAssets { .. })));
}

#[test]
fn test_empty_asset_is_skipped() {
    let clock = Arc::new(ManualClock::new());
    let backend = PrecisionBackend::headless(clock, RATE, Default::default());
    let assets = vec![tone("empty", 0.0), tone("rain", 10.0)];
    let engine = MixerEngine::with_assets(test_config(), Box::new(backend), assets).unwrap();

    assert_eq!(engine.assets().len(), 1);
    assert_eq!(engine.assets()[0].id(), "rain");
    assert_eq!(engine.load_failures().len(), 1);
}

#[test]
fn test_invalid_config_rejected() {
    let clock = Arc::new(ManualClock::new());
    let backend = PrecisionBackend::headless(clock, RATE, Default::default());
    let config = EngineConfig {
        overlap_duration: 1.0,
        fade_duration: 2.0,
        ..test_config()
    };
    let result = MixerEngine::with_assets(config, Box::new(backend), tones(&[10.0]));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_zero_retry_delay_rejected() {
    let clock = Arc::new(ManualClock::new());
    let backend = PrecisionBackend::headless(clock, RATE, Default::default());
    let config = EngineConfig {
        retry_delay: 0.0,
        ..test_config()
    };
    let result = MixerEngine::with_assets(config, Box::new(backend), tones(&[10.0]));
    assert!(matches!(result, Err(Error::Config(_))));
}
