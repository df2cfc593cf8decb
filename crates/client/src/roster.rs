use dispatch_protocol::{DriverEntry, DriverStatus};
use tracing::info;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Driver {
    pub employee_id: String,
    pub driver_name: String,
    pub vehicle: String,
    pub status: DriverStatus,
    /// Room the driver was dispatched to, if any
    pub room_name: Option<String>,
}

impl From<&DriverEntry> for Driver {
    fn from(entry: &DriverEntry) -> Self {
        Self {
            employee_id: entry.employee_id.clone(),
            driver_name: entry.driver_name.clone(),
            vehicle: entry.vehicle.clone(),
            status: entry.status,
            room_name: None,
        }
    }
}

/// Local driver list shown to agents and drivers. Status changes only through
/// [`DriverRoster::toggle`]; call state never touches it.
#[derive(Debug, Clone, Default)]
pub struct DriverRoster {
    drivers: Vec<Driver>,
}

impl DriverRoster {
    pub fn new(drivers: Vec<Driver>) -> Self {
        Self { drivers }
    }

    pub fn from_config(entries: &[DriverEntry]) -> Self {
        Self::new(entries.iter().map(Driver::from).collect())
    }

    pub fn drivers(&self) -> &[Driver] {
        &self.drivers
    }

    pub fn find(&self, employee_id: &str) -> Option<&Driver> {
        self.drivers.iter().find(|d| d.employee_id == employee_id)
    }

    fn find_mut(&mut self, employee_id: &str) -> Result<&mut Driver> {
        self.drivers
            .iter_mut()
            .find(|d| d.employee_id == employee_id)
            .ok_or_else(|| CoreError::UnknownDriver(employee_id.to_string()))
    }

    /// Flip Available/Busy. Returns the new status.
    pub fn toggle(&mut self, employee_id: &str) -> Result<DriverStatus> {
        let driver = self.find_mut(employee_id)?;
        driver.status = driver.status.toggled();
        info!(employee_id, status = ?driver.status, "Driver status toggled");
        Ok(driver.status)
    }

    pub fn set_room(&mut self, employee_id: &str, room: Option<String>) -> Result<()> {
        self.find_mut(employee_id)?.room_name = room;
        Ok(())
    }

    pub fn available(&self) -> impl Iterator<Item = &Driver> {
        self.drivers
            .iter()
            .filter(|d| d.status == DriverStatus::Available)
    }
}
