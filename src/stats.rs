//! Frame timing

use std::time::{Duration, Instant};

/// Per-frame delta time plus a frames-per-second figure refreshed once a second
#[derive(Debug, Clone)]
pub struct FrameTimer {
    last_tick: Instant,
    window_start: Instant,
    frames_in_window: u32,
    fps: u32,
    total_frames: u64,
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameTimer {
    const FPS_WINDOW: Duration = Duration::from_secs(1);

    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(now: Instant) -> Self {
        Self {
            last_tick: now,
            window_start: now,
            frames_in_window: 0,
            fps: 0,
            total_frames: 0,
        }
    }

    /// Register a frame now. Returns seconds since the previous tick.
    pub fn tick(&mut self) -> f32 {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&mut self, now: Instant) -> f32 {
        let dt = now.saturating_duration_since(self.last_tick).as_secs_f32();
        self.last_tick = now;
        self.frames_in_window += 1;
        self.total_frames += 1;

        if now.saturating_duration_since(self.window_start) >= Self::FPS_WINDOW {
            self.fps = self.frames_in_window;
            self.frames_in_window = 0;
            self.window_start = now;
            log::debug!("FPS: {}", self.fps);
        }
        dt
    }

    /// Frames counted during the last full second
    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_time() {
        let start = Instant::now();
        let mut timer = FrameTimer::starting_at(start);
        let dt = timer.tick_at(start + Duration::from_millis(250));
        assert!((dt - 0.25).abs() < 1e-4);
    }

    #[test]
    fn test_fps_updates_once_per_second() {
        let start = Instant::now();
        let mut timer = FrameTimer::starting_at(start);
        for i in 1..=59 {
            timer.tick_at(start + Duration::from_millis(i * 16));
        }
        assert_eq!(timer.fps(), 0);

        timer.tick_at(start + Duration::from_millis(1000));
        assert_eq!(timer.fps(), 60);
        assert_eq!(timer.total_frames(), 60);

        timer.tick_at(start + Duration::from_millis(1500));
        assert_eq!(timer.fps(), 60);
    }
}
