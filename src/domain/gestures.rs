use crate::domain::models::{Direction, MovementCommand};
use crate::domain::settings::GestureSettings;
use std::time::Duration;
use tracing::{debug, trace};

/// Drag position relative to where the pointer went down.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DragSample {
    /// Monotonic timestamp of the sample.
    pub at: Duration,
    pub dx: f64,
    pub dy: f64,
}

impl DragSample {
    pub fn new(at: Duration, dx: f64, dy: f64) -> Self {
        Self { at, dx, dy }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GestureInput {
    Drag(DragSample),
    Release,
}

/// Turns a continuous drag into discrete, rate-limited movement commands.
///
/// Only the horizontal component steers. A command goes out when the
/// quantized direction changes, or again once the re-trigger interval has
/// passed while a turn is held. Releasing the pointer always ends with a
/// `None` command.
#[derive(Debug, Clone)]
pub struct GestureTranslator {
    settings: GestureSettings,
    is_gesture_in_progress: bool,
    last_direction: Direction,
    last_emitted_at: Option<Duration>,
}

impl GestureTranslator {
    pub fn new(settings: GestureSettings) -> Self {
        Self {
            settings,
            is_gesture_in_progress: false,
            last_direction: Direction::None,
            last_emitted_at: None,
        }
    }

    pub fn settings(&self) -> &GestureSettings {
        &self.settings
    }

    pub fn process(&mut self, input: GestureInput) -> Option<MovementCommand> {
        match input {
            GestureInput::Drag(sample) => self.update_gesture(sample),
            GestureInput::Release => self.end_gesture(),
        }
    }

    fn update_gesture(&mut self, sample: DragSample) -> Option<MovementCommand> {
        if !sample.dx.is_finite() {
            debug!("Dropping non-finite drag sample: {:?}", sample);
            return None;
        }
        self.is_gesture_in_progress = true;
        let direction = self.quantize(sample.dx);

        let retrigger_due = direction != Direction::None
            && self.last_emitted_at.is_some_and(|emitted| {
                sample.at.saturating_sub(emitted) >= self.settings.retrigger_interval()
            });

        if direction == self.last_direction && !retrigger_due {
            return None;
        }

        self.last_direction = direction;
        self.last_emitted_at = Some(sample.at);
        let command = match direction {
            Direction::None => MovementCommand::none(),
            Direction::Left => MovementCommand::left(self.duration_for(sample.dx)),
            Direction::Right => MovementCommand::right(self.duration_for(sample.dx)),
        };
        trace!("Gesture at {:?} -> {:?}", sample.at, command);
        Some(command)
    }

    fn end_gesture(&mut self) -> Option<MovementCommand> {
        if !self.is_gesture_in_progress {
            return None;
        }
        self.is_gesture_in_progress = false;
        self.last_direction = Direction::None;
        self.last_emitted_at = None;
        Some(MovementCommand::none())
    }

    fn quantize(&self, dx: f64) -> Direction {
        if dx.abs() <= self.settings.dead_zone_px {
            Direction::None
        } else if dx > 0.0 {
            Direction::Right
        } else {
            Direction::Left
        }
    }

    /// Map horizontal magnitude between the dead zone and full scale onto
    /// the duration range.
    fn duration_for(&self, dx: f64) -> u16 {
        let min = f64::from(self.settings.min_duration_ms);
        let max = f64::from(self.settings.max_duration_ms.max(self.settings.min_duration_ms));
        let span = self.settings.full_scale_px - self.settings.dead_zone_px;

        let fraction = if span > 0.0 {
            ((dx.abs() - self.settings.dead_zone_px) / span).clamp(0.0, 1.0)
        } else {
            1.0
        };
        // Always within [min, max], both u16.
        (min + fraction * (max - min)).round() as u16
    }
}

/// Run a whole recorded gesture through a fresh translator.
pub fn translate(settings: GestureSettings, inputs: &[GestureInput]) -> Vec<MovementCommand> {
    let mut translator = GestureTranslator::new(settings);
    inputs
        .iter()
        .filter_map(|input| translator.process(*input))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drag(ms: u64, dx: f64) -> GestureInput {
        GestureInput::Drag(DragSample::new(Duration::from_millis(ms), dx, 0.0))
    }

    fn settings() -> GestureSettings {
        GestureSettings {
            dead_zone_px: 60.0,
            retrigger_interval_ms: 400,
            full_scale_px: 260.0,
            min_duration_ms: 100,
            max_duration_ms: 900,
        }
    }

    fn count(commands: &[MovementCommand], direction: Direction) -> usize {
        commands.iter().filter(|c| c.direction == direction).count()
    }

    #[test]
    fn test_dead_zone_emits_nothing() {
        let commands = translate(settings(), &[drag(0, 10.0), drag(50, -59.0), drag(100, 60.0)]);
        assert!(commands.is_empty());
    }

    #[test]
    fn test_held_right_drag_retriggers_once() {
        let inputs: Vec<GestureInput> = (0..=12).map(|i| drag(i * 50, 120.0)).collect();
        let commands = translate(settings(), &inputs);
        assert_eq!(count(&commands, Direction::Right), 2);
        assert_eq!(commands.len(), 2);
    }

    #[test]
    fn test_direction_change_emits_immediately() {
        let commands = translate(
            settings(),
            &[drag(0, 100.0), drag(20, 0.0), drag(40, -100.0), drag(60, -120.0)],
        );
        assert_eq!(
            commands.iter().map(|c| c.direction).collect::<Vec<_>>(),
            vec![Direction::Right, Direction::None, Direction::Left]
        );
    }

    #[test]
    fn test_release_emits_terminal_none_and_resets() {
        let mut translator = GestureTranslator::new(settings());
        assert!(translator.process(drag(0, 100.0)).is_some());
        assert_eq!(
            translator.process(GestureInput::Release),
            Some(MovementCommand::none())
        );
        assert_eq!(translator.process(GestureInput::Release), None);

        // A new gesture starts from scratch.
        let again = translator.process(drag(10, 100.0));
        assert_eq!(again.map(|c| c.direction), Some(Direction::Right));
    }

    #[test]
    fn test_duration_scales_with_magnitude() {
        let mut translator = GestureTranslator::new(settings());
        let near = translator.process(drag(0, 61.0)).unwrap();
        translator.process(GestureInput::Release);
        let half = translator.process(drag(0, 160.0)).unwrap();
        translator.process(GestureInput::Release);
        let far = translator.process(drag(0, -1_000.0)).unwrap();

        assert_eq!(near.duration_ms, 104);
        assert_eq!(half.duration_ms, 500);
        assert_eq!(far, MovementCommand::left(900));
    }

    #[test]
    fn test_retrigger_measured_from_last_emission() {
        let commands = translate(
            settings(),
            &[
                drag(0, 100.0),
                drag(399, 100.0),
                drag(400, 100.0),
                drag(799, 100.0),
                drag(800, 100.0),
            ],
        );
        assert_eq!(count(&commands, Direction::Right), 3);
    }

    #[test]
    fn test_non_finite_samples_are_ignored() {
        let mut translator = GestureTranslator::new(settings());
        assert_eq!(translator.process(drag(0, f64::NAN)), None);
        assert_eq!(translator.process(drag(10, f64::INFINITY)), None);
        assert_eq!(translator.process(drag(20, f64::NEG_INFINITY)), None);
        // Nothing started, so release has nothing to end.
        assert_eq!(translator.process(GestureInput::Release), None);

        assert_eq!(
            translator.process(drag(30, 160.0)),
            Some(MovementCommand::right(500))
        );
        assert_eq!(translator.process(drag(40, f64::NAN)), None);
        assert_eq!(translator.process(drag(50, 160.0)), None);
    }
}
