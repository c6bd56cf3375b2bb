//! Prometheus metrics definitions for Kumo indoor units.

use std::{sync::atomic::AtomicU64, time::Duration};

use kumo_core::{
    DeviceFault, RebootAction, commands::OperatingMode, response::IndoorUnitStatus,
};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// Labels for device identification (used on most metrics).
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DeviceLabels {
    pub serial: String,
    pub address: String,
}

impl DeviceLabels {
    pub fn new(serial: &str, address: &str) -> Self {
        Self {
            serial: serial.to_string(),
            address: address.to_string(),
        }
    }
}

/// Labels for the mode info metric.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ModeLabels {
    pub serial: String,
    pub address: String,
    pub mode: String,
}

/// Labels for fault counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FaultLabels {
    pub serial: String,
    pub address: String,
    pub fault: String,
}

type FloatGauge = Gauge<f64, AtomicU64>;

/// Container for all Kumo device metrics.
pub struct DeviceMetrics {
    // Indoor unit readings
    room_temperature_celsius: Family<DeviceLabels, FloatGauge>,
    heat_setpoint_celsius: Family<DeviceLabels, FloatGauge>,
    cool_setpoint_celsius: Family<DeviceLabels, FloatGauge>,
    standby: Family<DeviceLabels, Gauge>,
    filter_dirty: Family<DeviceLabels, Gauge>,
    defrost: Family<DeviceLabels, Gauge>,
    mode: Family<ModeLabels, Gauge>,

    // Adapter recovery
    faults: Family<FaultLabels, Counter>,
    reboots: Family<DeviceLabels, Counter>,

    // Exporter metrics
    scrape_success: Family<DeviceLabels, Gauge>,
    scrape_duration_seconds: FloatGauge,
    devices_configured: Gauge,
}

impl DeviceMetrics {
    /// Create new metrics and register them with the provided registry.
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            room_temperature_celsius: Family::default(),
            heat_setpoint_celsius: Family::default(),
            cool_setpoint_celsius: Family::default(),
            standby: Family::default(),
            filter_dirty: Family::default(),
            defrost: Family::default(),
            mode: Family::default(),
            faults: Family::default(),
            reboots: Family::default(),
            scrape_success: Family::default(),
            scrape_duration_seconds: Gauge::default(),
            devices_configured: Gauge::default(),
        };

        registry.register(
            "kumo_room_temperature_celsius",
            "Room temperature reported by the indoor unit",
            metrics.room_temperature_celsius.clone(),
        );

        registry.register(
            "kumo_heat_setpoint_celsius",
            "Heating set point",
            metrics.heat_setpoint_celsius.clone(),
        );

        registry.register(
            "kumo_cool_setpoint_celsius",
            "Cooling set point",
            metrics.cool_setpoint_celsius.clone(),
        );

        registry.register(
            "kumo_standby",
            "Unit idle in its current mode (1 = standby, 0 = active)",
            metrics.standby.clone(),
        );

        registry.register(
            "kumo_filter_dirty",
            "Filter needs cleaning (1 = dirty, 0 = clean)",
            metrics.filter_dirty.clone(),
        );

        registry.register(
            "kumo_defrost",
            "Outdoor unit defrosting (1 = defrosting, 0 = not defrosting)",
            metrics.defrost.clone(),
        );

        registry.register(
            "kumo_mode",
            "Operating mode (1 for the current mode, 0 otherwise)",
            metrics.mode.clone(),
        );

        registry.register(
            "kumo_device_faults",
            "Adapter fault markers seen in responses",
            metrics.faults.clone(),
        );

        registry.register(
            "kumo_adapter_reboots",
            "Adapter reboots issued after a fault",
            metrics.reboots.clone(),
        );

        registry.register(
            "kumo_scrape_success",
            "Whether the last scrape was successful (1 = success, 0 = failure)",
            metrics.scrape_success.clone(),
        );

        registry.register(
            "kumo_scrape_duration_seconds",
            "Duration of the last scrape cycle in seconds",
            metrics.scrape_duration_seconds.clone(),
        );

        registry.register(
            "kumo_devices_configured",
            "Number of devices configured for polling",
            metrics.devices_configured.clone(),
        );

        metrics
    }

    /// Record an indoor unit status reading
    pub fn set_status(&self, labels: &DeviceLabels, status: &IndoorUnitStatus) {
        if let Some(temp) = status.room_temp {
            self.room_temperature_celsius.get_or_create(labels).set(temp);
        }
        if let Some(sp) = status.sp_heat {
            self.heat_setpoint_celsius.get_or_create(labels).set(sp);
        }
        if let Some(sp) = status.sp_cool {
            self.cool_setpoint_celsius.get_or_create(labels).set(sp);
        }
        if let Some(standby) = status.standby {
            self.standby.get_or_create(labels).set(i64::from(standby));
        }
        if let Some(dirty) = status.filter_dirty {
            self.filter_dirty.get_or_create(labels).set(i64::from(dirty));
        }
        if let Some(defrost) = status.defrost {
            self.defrost.get_or_create(labels).set(i64::from(defrost));
        }
        if let Some(current) = status.operating_mode() {
            for mode in OperatingMode::all() {
                self.mode
                    .get_or_create(&ModeLabels {
                        serial: labels.serial.clone(),
                        address: labels.address.clone(),
                        mode: mode.as_str().to_string(),
                    })
                    .set(i64::from(*mode == current));
            }
        }
    }

    /// Count a fault and the reboot it triggered
    pub fn record_fault(&self, labels: &DeviceLabels, fault: DeviceFault, reboot: &RebootAction) {
        self.faults
            .get_or_create(&FaultLabels {
                serial: labels.serial.clone(),
                address: labels.address.clone(),
                fault: fault.to_string(),
            })
            .inc();
        if matches!(reboot, RebootAction::Issued) {
            self.reboots.get_or_create(labels).inc();
        }
    }

    /// Set scrape success for a device
    pub fn set_scrape_success(&self, labels: &DeviceLabels, success: bool) {
        self.scrape_success
            .get_or_create(labels)
            .set(i64::from(success));
    }

    /// Set scrape duration
    pub fn set_scrape_duration(&self, duration: Duration) {
        self.scrape_duration_seconds.set(duration.as_secs_f64());
    }

    /// Set number of configured devices
    pub fn set_devices_configured(&self, count: usize) {
        self.devices_configured.set(count as i64);
    }
}
