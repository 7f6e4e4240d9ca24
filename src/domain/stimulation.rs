//! Stimulation parameters and their safety bounds.

use crate::domain::errors::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One editable stimulation parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SettingField {
    Frequency,
    PulseWidth,
    Duration,
    Gain,
    RandomMode,
    LeftEnabled,
    RightEnabled,
}

impl SettingField {
    pub const ALL: [SettingField; 7] = [
        SettingField::Frequency,
        SettingField::PulseWidth,
        SettingField::Duration,
        SettingField::Gain,
        SettingField::RandomMode,
        SettingField::LeftEnabled,
        SettingField::RightEnabled,
    ];
}

impl fmt::Display for SettingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SettingField::Frequency => "frequency_hz",
            SettingField::PulseWidth => "pulse_width_us",
            SettingField::Duration => "duration_ms",
            SettingField::Gain => "gain_percent",
            SettingField::RandomMode => "random_mode",
            SettingField::LeftEnabled => "left_enabled",
            SettingField::RightEnabled => "right_enabled",
        };
        f.write_str(name)
    }
}

/// The bound a value violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Min(i64),
    Max(i64),
    /// Pulse width must fit inside one pulse period at the configured frequency.
    DutyCycle { max_pulse_width_us: i64 },
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bound::Min(min) => write!(f, "minimum {}", min),
            Bound::Max(max) => write!(f, "maximum {}", max),
            Bound::DutyCycle { max_pulse_width_us } => {
                write!(f, "pulse period (max {}us)", max_pulse_width_us)
            }
        }
    }
}

/// Inclusive integer range for a numeric parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub min: u16,
    pub max: u16,
}

impl Range {
    pub const fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    pub fn check(&self, field: SettingField, value: i64) -> Result<u16, ValidationError> {
        if value < i64::from(self.min) {
            return Err(ValidationError {
                field,
                bound: Bound::Min(i64::from(self.min)),
                value,
            });
        }
        if value > i64::from(self.max) {
            return Err(ValidationError {
                field,
                bound: Bound::Max(i64::from(self.max)),
                value,
            });
        }
        // In range, so the conversion cannot fail.
        u16::try_from(value).map_err(|_| ValidationError {
            field,
            bound: Bound::Max(i64::from(self.max)),
            value,
        })
    }

    /// Saturate into the range. Used for derived values (gesture magnitudes),
    /// never for user input.
    pub fn clamp(&self, value: i64) -> u16 {
        let clamped = value.clamp(i64::from(self.min), i64::from(self.max));
        u16::try_from(clamped).unwrap_or(self.max)
    }
}

/// Hard limits for every stimulation parameter.
///
/// These are device calibration constants. The defaults match the RoboRoach
/// app sliders and firmware limits and must be reviewed by someone who knows
/// the hardware before use on a live animal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyBounds {
    #[serde(default = "default_frequency")]
    pub frequency_hz: Range,
    #[serde(default = "default_pulse_width")]
    pub pulse_width_us: Range,
    #[serde(default = "default_duration")]
    pub duration_ms: Range,
    #[serde(default = "default_gain")]
    pub gain_percent: Range,
}

fn default_frequency() -> Range {
    Range::new(1, 150)
}
fn default_pulse_width() -> Range {
    Range::new(1_000, 50_000)
}
fn default_duration() -> Range {
    Range::new(10, 1_000)
}
fn default_gain() -> Range {
    Range::new(0, 100)
}

impl Default for SafetyBounds {
    fn default() -> Self {
        Self {
            frequency_hz: default_frequency(),
            pulse_width_us: default_pulse_width(),
            duration_ms: default_duration(),
            gain_percent: default_gain(),
        }
    }
}

const FLAG_RANGE: Range = Range::new(0, 1);

impl SafetyBounds {
    fn range_for(&self, field: SettingField) -> Range {
        match field {
            SettingField::Frequency => self.frequency_hz,
            SettingField::PulseWidth => self.pulse_width_us,
            SettingField::Duration => self.duration_ms,
            SettingField::Gain => self.gain_percent,
            SettingField::RandomMode | SettingField::LeftEnabled | SettingField::RightEnabled => {
                FLAG_RANGE
            }
        }
    }

    /// Check a single field in isolation.
    pub fn validate_field(&self, field: SettingField, value: i64) -> Result<(), ValidationError> {
        self.range_for(field).check(field, value).map(|_| ())
    }

    /// Check every field plus the duty-cycle constraint.
    pub fn validate(&self, settings: &StimulationSettings) -> Result<(), ValidationError> {
        for field in SettingField::ALL {
            self.validate_field(field, settings.get(field))?;
        }
        check_duty_cycle(settings)
    }
}

fn check_duty_cycle(settings: &StimulationSettings) -> Result<(), ValidationError> {
    // Random mode picks its own period and width on the device.
    if settings.random_mode {
        return Ok(());
    }
    let max_pulse_width_us = settings.pulse_period_us();
    if i64::from(settings.pulse_width_us) >= max_pulse_width_us {
        return Err(ValidationError {
            field: SettingField::PulseWidth,
            bound: Bound::DutyCycle { max_pulse_width_us },
            value: i64::from(settings.pulse_width_us),
        });
    }
    Ok(())
}

/// Parameters for one stimulation burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StimulationSettings {
    pub frequency_hz: u16,
    pub pulse_width_us: u16,
    pub duration_ms: u16,
    pub gain_percent: u8,
    pub random_mode: bool,
    pub left_enabled: bool,
    pub right_enabled: bool,
}

impl Default for StimulationSettings {
    fn default() -> Self {
        // Power-on values of the device firmware.
        Self {
            frequency_hz: 55,
            pulse_width_us: 9_000,
            duration_ms: 1_000,
            gain_percent: 50,
            random_mode: false,
            left_enabled: true,
            right_enabled: true,
        }
    }
}

impl StimulationSettings {
    pub fn get(&self, field: SettingField) -> i64 {
        match field {
            SettingField::Frequency => i64::from(self.frequency_hz),
            SettingField::PulseWidth => i64::from(self.pulse_width_us),
            SettingField::Duration => i64::from(self.duration_ms),
            SettingField::Gain => i64::from(self.gain_percent),
            SettingField::RandomMode => i64::from(self.random_mode),
            SettingField::LeftEnabled => i64::from(self.left_enabled),
            SettingField::RightEnabled => i64::from(self.right_enabled),
        }
    }

    /// Return a copy with `field` replaced, or an error if `value` does not
    /// fit the field's storage width.
    pub(crate) fn with(mut self, field: SettingField, value: i64) -> Result<Self, ValidationError> {
        let too_wide = |max: i64| ValidationError {
            field,
            bound: if value < 0 { Bound::Min(0) } else { Bound::Max(max) },
            value,
        };
        let wide = |v: i64| u16::try_from(v).map_err(|_| too_wide(i64::from(u16::MAX)));

        match field {
            SettingField::Frequency => self.frequency_hz = wide(value)?,
            SettingField::PulseWidth => self.pulse_width_us = wide(value)?,
            SettingField::Duration => self.duration_ms = wide(value)?,
            SettingField::Gain => {
                self.gain_percent =
                    u8::try_from(value).map_err(|_| too_wide(i64::from(u8::MAX)))?
            }
            SettingField::RandomMode => self.random_mode = value != 0,
            SettingField::LeftEnabled => self.left_enabled = value != 0,
            SettingField::RightEnabled => self.right_enabled = value != 0,
        }
        Ok(self)
    }

    /// Length of one pulse period in microseconds.
    pub fn pulse_period_us(&self) -> i64 {
        1_000_000 / i64::from(self.frequency_hz.max(1))
    }

    /// Short human-readable summary, as shown on the main screen.
    pub fn describe(&self) -> String {
        if self.random_mode {
            format!("Randomized stimulus. {}%", self.gain_percent)
        } else {
            format!(
                "{}Hz, {}us pulse, for {}ms. {}%",
                self.frequency_hz, self.pulse_width_us, self.duration_ms, self.gain_percent
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_within_bounds() {
        let bounds = SafetyBounds::default();
        assert!(bounds.validate(&StimulationSettings::default()).is_ok());
    }

    #[test]
    fn test_range_reports_violated_bound() {
        let bounds = SafetyBounds::default();
        let err = bounds
            .validate_field(SettingField::Frequency, 151)
            .unwrap_err();
        assert_eq!(err.field, SettingField::Frequency);
        assert_eq!(err.bound, Bound::Max(150));

        let err = bounds.validate_field(SettingField::Frequency, 0).unwrap_err();
        assert_eq!(err.bound, Bound::Min(1));
    }

    #[test]
    fn test_flags_accept_only_zero_or_one() {
        let bounds = SafetyBounds::default();
        assert!(bounds.validate_field(SettingField::RandomMode, 1).is_ok());
        assert!(bounds.validate_field(SettingField::RandomMode, 2).is_err());
        assert!(bounds.validate_field(SettingField::LeftEnabled, -1).is_err());
    }

    #[test]
    fn test_pulse_width_must_fit_period() {
        let bounds = SafetyBounds::default();
        let settings = StimulationSettings {
            frequency_hz: 150,
            pulse_width_us: 9_000,
            ..Default::default()
        };
        let err = bounds.validate(&settings).unwrap_err();
        assert_eq!(err.field, SettingField::PulseWidth);
        assert_eq!(
            err.bound,
            Bound::DutyCycle {
                max_pulse_width_us: 6_666
            }
        );

        let random = StimulationSettings {
            random_mode: true,
            ..settings
        };
        assert!(bounds.validate(&random).is_ok());
    }

    #[test]
    fn test_clamp_saturates() {
        let range = Range::new(10, 1_000);
        assert_eq!(range.clamp(-5), 10);
        assert_eq!(range.clamp(5_000), 1_000);
        assert_eq!(range.clamp(400), 400);
    }

    #[test]
    fn test_describe() {
        let settings = StimulationSettings::default();
        assert_eq!(settings.describe(), "55Hz, 9000us pulse, for 1000ms. 50%");
        let random = StimulationSettings {
            random_mode: true,
            ..settings
        };
        assert_eq!(random.describe(), "Randomized stimulus. 50%");
    }

    #[test]
    fn test_with_rejects_values_wider_than_the_field() {
        let settings = StimulationSettings::default();
        let err = settings.with(SettingField::Gain, 300).unwrap_err();
        assert_eq!(err.field, SettingField::Gain);
        assert_eq!(err.bound, Bound::Max(255));

        let err = settings.with(SettingField::Duration, -1).unwrap_err();
        assert_eq!(err.bound, Bound::Min(0));
        assert_eq!(settings.with(SettingField::Gain, 255).unwrap().gain_percent, 255);
    }
}
