//! BLE Scanner Module
//!
//! Filters advertisements down to stimulation devices and decides when the
//! scan has found what it is looking for.

use crate::domain::errors::LinkError;
use crate::domain::models::{DeviceId, ScannedDevice};
use crate::domain::settings::BleSettings;
use crate::infrastructure::bluetooth::link::DeviceLink;
use std::collections::HashMap;
use tracing::{debug, info};

/// What to do with one advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanDecision {
    /// Not a stimulation device, or already reported.
    Ignore,
    /// A new matching device; report it and keep scanning.
    Report(ScannedDevice),
    /// A new matching device that should be connected right away.
    Connect(ScannedDevice),
}

/// BLE Scanner for discovering RoboRoach backpacks
pub struct BleScanner {
    settings: BleSettings,
    target: Option<DeviceId>,
    seen: HashMap<DeviceId, ScannedDevice>,
    active: bool,
}

impl BleScanner {
    pub fn new(settings: BleSettings) -> Self {
        Self {
            settings,
            target: None,
            seen: HashMap::new(),
            active: false,
        }
    }

    /// Start scanning for BLE devices
    ///
    /// # Arguments
    /// * `target` - Only connect to this device; other matches are still reported
    pub fn start(
        &mut self,
        link: &mut dyn DeviceLink,
        target: Option<DeviceId>,
    ) -> Result<(), LinkError> {
        self.stop(link)?;

        // Unfiltered at the radio: devices matching only by name prefix
        // do not advertise the service.
        if self.settings.debug_show_all_devices {
            info!("Starting BLE scan, reporting all devices");
        } else {
            info!(
                "Starting BLE scan for service {} or name prefix {:?}",
                self.settings.service_uuid, self.settings.name_prefix
            );
        }

        link.start_scan(None)?;
        self.seen.clear();
        self.target = target;
        self.active = true;
        Ok(())
    }

    /// Stop scanning
    pub fn stop(&mut self, link: &mut dyn DeviceLink) -> Result<(), LinkError> {
        if self.active {
            info!("Stopping BLE scan...");
            self.active = false;
            link.stop_scan()?;
        }
        Ok(())
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.active
    }

    /// Only connect to `id` from now on.
    pub fn retarget(&mut self, id: DeviceId) -> ScanDecision {
        info!("Scan retargeted to {}", id);
        let already_seen = self.seen.get(&id).cloned();
        self.target = Some(id);
        match already_seen {
            Some(device) => ScanDecision::Connect(device),
            None => ScanDecision::Ignore,
        }
    }

    /// Whether an advertisement looks like a stimulation device.
    pub fn matches(&self, name: &str, service_uuids: &[String]) -> bool {
        if self.settings.debug_show_all_devices {
            return true;
        }
        let advertises_service = service_uuids
            .iter()
            .any(|uuid| uuid.eq_ignore_ascii_case(&self.settings.service_uuid));
        advertises_service
            || (!self.settings.name_prefix.is_empty() && name.starts_with(&self.settings.name_prefix))
    }

    pub fn on_advertisement(
        &mut self,
        id: DeviceId,
        name: &str,
        rssi: i16,
        service_uuids: &[String],
    ) -> ScanDecision {
        if !self.active || !self.matches(name, service_uuids) {
            return ScanDecision::Ignore;
        }

        let is_new = !self.seen.contains_key(&id);
        let device = ScannedDevice {
            id: id.clone(),
            name: if name.is_empty() {
                "Unknown".to_string()
            } else {
                name.to_string()
            },
            signal_strength: rssi,
            advertises_service: service_uuids
                .iter()
                .any(|uuid| uuid.eq_ignore_ascii_case(&self.settings.service_uuid)),
        };
        self.seen.insert(id.clone(), device.clone());

        let wanted = match &self.target {
            Some(target) => *target == id,
            None => true,
        };

        match (is_new, wanted) {
            (_, true) => {
                debug!("Scan selected {} ({} dBm)", device.name, rssi);
                ScanDecision::Connect(device)
            }
            (true, false) => ScanDecision::Report(device),
            (false, false) => ScanDecision::Ignore,
        }
    }

    /// Matching devices seen during the current scan, strongest first.
    pub fn devices(&self) -> Vec<ScannedDevice> {
        let mut devices: Vec<ScannedDevice> = self.seen.values().cloned().collect();
        devices.sort_by(|a, b| b.signal_strength.cmp(&a.signal_strength));
        devices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::link::link_channel;
    use crate::infrastructure::bluetooth::protocol;
    use crate::infrastructure::bluetooth::simulated::SimulatedDevice;

    fn active_scanner(target: Option<DeviceId>) -> BleScanner {
        let (tx, _rx) = link_channel();
        let mut link = SimulatedDevice::new(tx);
        let mut scanner = BleScanner::new(BleSettings::default());
        scanner.start(&mut link, target).unwrap();
        scanner
    }

    #[test]
    fn test_filters_by_service_or_name() {
        let scanner = active_scanner(None);
        assert!(scanner.matches("", &[protocol::SERVICE_UUID.to_uppercase()]));
        assert!(scanner.matches("RoboRoach-7", &[]));
        assert!(!scanner.matches("Headphones", &["0000180f-0000-1000-8000-00805f9b34fb".into()]));
    }

    #[test]
    fn test_first_match_connects_without_target() {
        let mut scanner = active_scanner(None);
        let decision = scanner.on_advertisement(DeviceId::new("a"), "RoboRoach", -60, &[]);
        assert!(matches!(decision, ScanDecision::Connect(_)));
        assert_eq!(
            scanner.on_advertisement(DeviceId::new("b"), "Speaker", -40, &[]),
            ScanDecision::Ignore
        );
    }

    #[test]
    fn test_target_only_connects_to_that_device() {
        let mut scanner = active_scanner(Some(DeviceId::new("b")));
        let other = scanner.on_advertisement(DeviceId::new("a"), "RoboRoach", -50, &[]);
        assert!(matches!(other, ScanDecision::Report(_)));
        let again = scanner.on_advertisement(DeviceId::new("a"), "RoboRoach", -49, &[]);
        assert_eq!(again, ScanDecision::Ignore);

        let wanted = scanner.on_advertisement(DeviceId::new("b"), "RoboRoach", -80, &[]);
        match wanted {
            ScanDecision::Connect(device) => assert_eq!(device.id, DeviceId::new("b")),
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[test]
    fn test_retarget_to_already_seen_device() {
        let mut scanner = active_scanner(Some(DeviceId::new("z")));
        scanner.on_advertisement(DeviceId::new("a"), "RoboRoach", -50, &[]);
        assert!(matches!(
            scanner.retarget(DeviceId::new("a")),
            ScanDecision::Connect(_)
        ));
        assert_eq!(scanner.retarget(DeviceId::new("q")), ScanDecision::Ignore);
    }

    #[test]
    fn test_devices_sorted_by_signal() {
        let mut scanner = active_scanner(Some(DeviceId::new("none")));
        scanner.on_advertisement(DeviceId::new("far"), "RoboRoach", -90, &[]);
        scanner.on_advertisement(DeviceId::new("near"), "RoboRoach", -30, &[]);
        let ids: Vec<String> = scanner.devices().into_iter().map(|d| d.id.0).collect();
        assert_eq!(ids, vec!["near".to_string(), "far".to_string()]);
    }
}
