//! Reconciles locally edited settings with what the device last reported.

use crate::domain::errors::ValidationError;
use crate::domain::models::{CommandId, Direction, MovementCommand, SessionEvent};
use crate::domain::stimulation::{SafetyBounds, SettingField, StimulationSettings};
use tracing::{debug, info, warn};

/// Holds the draft and the device-confirmed settings separately.
///
/// The draft is what the operator is editing. The confirmed copy only ever
/// changes when the device acknowledges a write or answers a read.
#[derive(Debug, Clone)]
pub struct SettingsSynchronizer {
    bounds: SafetyBounds,
    draft: StimulationSettings,
    confirmed: Option<StimulationSettings>,
    dirty: bool,
    pending_commit: Option<CommandId>,
    initialized: bool,
}

impl SettingsSynchronizer {
    pub fn new(bounds: SafetyBounds) -> Self {
        Self {
            bounds,
            draft: StimulationSettings::default(),
            confirmed: None,
            dirty: false,
            pending_commit: None,
            initialized: false,
        }
    }

    pub fn bounds(&self) -> &SafetyBounds {
        &self.bounds
    }

    pub fn draft(&self) -> &StimulationSettings {
        &self.draft
    }

    pub fn confirmed(&self) -> Option<&StimulationSettings> {
        self.confirmed.as_ref()
    }

    /// Whether the draft holds edits the device has not acknowledged yet.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn pending_commit(&self) -> Option<CommandId> {
        self.pending_commit
    }

    /// Validate and apply one field edit. On error the draft is untouched.
    pub fn apply_local_edit(
        &mut self,
        field: SettingField,
        value: i64,
    ) -> Result<(), ValidationError> {
        self.bounds.validate_field(field, value)?;
        let candidate = self.draft.with(field, value)?;
        self.bounds.validate(&candidate)?;

        if candidate != self.draft {
            debug!("Draft edit: {} = {}", field, value);
            self.draft = candidate;
            self.dirty = true;
        }
        Ok(())
    }

    /// Drop unsaved edits and go back to the confirmed settings.
    pub fn discard_edits(&mut self) {
        if let Some(confirmed) = self.confirmed {
            self.draft = confirmed;
        }
        self.dirty = false;
    }

    /// Snapshot of the draft to be written, re-validated as a whole.
    pub fn prepare_commit(&self) -> Result<StimulationSettings, ValidationError> {
        self.bounds.validate(&self.draft)?;
        Ok(self.draft)
    }

    /// The session accepted the write of a prepared snapshot.
    pub fn commit_started(&mut self, id: CommandId) {
        self.pending_commit = Some(id);
    }

    /// The device acknowledged a settings write.
    pub fn commit_acknowledged(
        &mut self,
        id: CommandId,
        written: StimulationSettings,
    ) -> SessionEvent {
        if self.pending_commit == Some(id) {
            self.pending_commit = None;
        }
        self.confirmed = Some(written);
        // Edits made after the snapshot was taken stay dirty.
        self.dirty = self.draft != written;
        info!("Device confirmed settings: {}", written.describe());
        SessionEvent::SettingsChanged(written)
    }

    /// A settings write failed or was cancelled. Confirmed settings stay as
    /// they were and the draft is kept for a retry.
    pub fn commit_failed(&mut self, id: CommandId) {
        if self.pending_commit == Some(id) {
            warn!("Settings commit {:?} did not reach the device", id);
            self.pending_commit = None;
        }
    }

    /// A settings read came back. Returns the events to publish, in order.
    pub fn refresh_completed(&mut self, reported: StimulationSettings) -> Vec<SessionEvent> {
        let mut events = Vec::with_capacity(2);
        if !self.initialized {
            self.initialized = true;
            events.push(SessionEvent::SettingsReadComplete);
        }

        self.confirmed = Some(reported);
        if !self.dirty {
            self.draft = reported;
        }
        debug!("Device reported settings: {}", reported.describe());
        events.push(SessionEvent::SettingsChanged(reported));
        events
    }

    /// Forget link-scoped state. The draft survives so edits can be retried
    /// after reconnecting.
    pub fn link_reset(&mut self) {
        self.pending_commit = None;
        self.initialized = false;
    }

    /// Cap a movement at the device-confirmed stimulation duration.
    pub fn cap_movement(&self, command: MovementCommand) -> MovementCommand {
        match (command.direction, self.confirmed) {
            (Direction::None, _) | (_, None) => command,
            (_, Some(confirmed)) => MovementCommand {
                direction: command.direction,
                duration_ms: command.duration_ms.min(confirmed.duration_ms),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::stimulation::{Bound, Range};

    fn synchronizer() -> SettingsSynchronizer {
        SettingsSynchronizer::new(SafetyBounds::default())
    }

    #[test]
    fn test_out_of_range_edit_leaves_draft_unchanged() {
        let mut sync = synchronizer();
        let before = *sync.draft();

        let err = sync
            .apply_local_edit(SettingField::Frequency, 400)
            .unwrap_err();
        assert_eq!(err.field, SettingField::Frequency);
        assert_eq!(err.bound, Bound::Max(150));
        assert_eq!(err.value, 400);
        assert_eq!(*sync.draft(), before);
        assert!(!sync.is_dirty());

        let err = sync.apply_local_edit(SettingField::Gain, -5).unwrap_err();
        assert_eq!(err.bound, Bound::Min(0));
        assert_eq!(*sync.draft(), before);
    }

    #[test]
    fn test_gain_above_storage_width_is_rejected() {
        let bounds = SafetyBounds {
            gain_percent: Range::new(0, 300),
            ..Default::default()
        };
        let mut sync = SettingsSynchronizer::new(bounds);

        let err = sync.apply_local_edit(SettingField::Gain, 300).unwrap_err();
        assert_eq!(err.field, SettingField::Gain);
        assert_eq!(err.bound, Bound::Max(255));
        assert_eq!(sync.draft().gain_percent, 50);
        assert!(!sync.is_dirty());
    }

    #[test]
    fn test_edit_rejected_when_duty_cycle_breaks() {
        let mut sync = synchronizer();
        // 9000us pulses do not fit a 150Hz period.
        let err = sync
            .apply_local_edit(SettingField::Frequency, 150)
            .unwrap_err();
        assert_eq!(err.field, SettingField::PulseWidth);
        assert_eq!(sync.draft().frequency_hz, 55);
    }

    #[test]
    fn test_valid_edit_marks_draft_dirty() {
        let mut sync = synchronizer();
        sync.apply_local_edit(SettingField::Gain, 75).unwrap();
        assert_eq!(sync.draft().gain_percent, 75);
        assert!(sync.is_dirty());
        sync.apply_local_edit(SettingField::RandomMode, 1).unwrap();
        assert!(sync.draft().random_mode);
    }

    #[test]
    fn test_commit_ack_replaces_confirmed() {
        let mut sync = synchronizer();
        sync.apply_local_edit(SettingField::Duration, 500).unwrap();
        let snapshot = sync.prepare_commit().unwrap();
        sync.commit_started(CommandId(3));

        let event = sync.commit_acknowledged(CommandId(3), snapshot);
        assert_eq!(event, SessionEvent::SettingsChanged(snapshot));
        assert_eq!(sync.confirmed(), Some(&snapshot));
        assert!(!sync.is_dirty());
        assert_eq!(sync.pending_commit(), None);
    }

    #[test]
    fn test_commit_failure_preserves_draft_and_confirmed() {
        let mut sync = synchronizer();
        let device = StimulationSettings::default();
        sync.refresh_completed(device);

        sync.apply_local_edit(SettingField::Gain, 90).unwrap();
        sync.prepare_commit().unwrap();
        sync.commit_started(CommandId(1));
        sync.commit_failed(CommandId(1));

        assert_eq!(sync.confirmed(), Some(&device));
        assert_eq!(sync.draft().gain_percent, 90);
        assert!(sync.is_dirty());
    }

    #[test]
    fn test_refresh_fires_settings_changed_every_time() {
        let mut sync = synchronizer();
        let device = StimulationSettings::default();

        let first = sync.refresh_completed(device);
        assert_eq!(
            first,
            vec![
                SessionEvent::SettingsReadComplete,
                SessionEvent::SettingsChanged(device)
            ]
        );

        let second = sync.refresh_completed(device);
        assert_eq!(second, vec![SessionEvent::SettingsChanged(device)]);
    }

    #[test]
    fn test_refresh_keeps_unsaved_edits() {
        let mut sync = synchronizer();
        sync.apply_local_edit(SettingField::Gain, 20).unwrap();

        let device = StimulationSettings {
            gain_percent: 60,
            ..Default::default()
        };
        sync.refresh_completed(device);
        assert_eq!(sync.draft().gain_percent, 20);
        assert_eq!(sync.confirmed().map(|s| s.gain_percent), Some(60));

        sync.discard_edits();
        assert_eq!(sync.draft().gain_percent, 60);
    }

    #[test]
    fn test_link_reset_rearms_read_complete() {
        let mut sync = synchronizer();
        sync.refresh_completed(StimulationSettings::default());
        sync.link_reset();
        let events = sync.refresh_completed(StimulationSettings::default());
        assert_eq!(events[0], SessionEvent::SettingsReadComplete);
    }

    #[test]
    fn test_movement_capped_at_confirmed_duration() {
        let mut sync = synchronizer();
        assert_eq!(
            sync.cap_movement(MovementCommand::left(900)),
            MovementCommand::left(900)
        );

        sync.refresh_completed(StimulationSettings {
            duration_ms: 300,
            ..Default::default()
        });
        assert_eq!(
            sync.cap_movement(MovementCommand::left(900)),
            MovementCommand::left(300)
        );
        assert_eq!(
            sync.cap_movement(MovementCommand::right(100)),
            MovementCommand::right(100)
        );
        assert_eq!(
            sync.cap_movement(MovementCommand::none()),
            MovementCommand::none()
        );
    }
}
