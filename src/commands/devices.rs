//! `flashkit devices`

use flashkit::devices::DeviceEnumerator;
use flashkit::log_info;

const MODULE: &str = "commands::devices";

pub fn list(enumerator: &dyn DeviceEnumerator) -> Result<(), String> {
    let devices = enumerator.list_devices().map_err(|e| e.to_string())?;
    log_info!(
        MODULE,
        "Found {} devices via {}",
        devices.len(),
        enumerator.platform()
    );

    if devices.is_empty() {
        println!("No devices found");
        return Ok(());
    }

    println!("{:<15} {:<10} {:<28} STATE", "ID", "SIZE", "LABEL");
    for device in &devices {
        let system = if device.is_system { " [system]" } else { "" };
        println!("{}{}", device, system);
    }
    Ok(())
}
