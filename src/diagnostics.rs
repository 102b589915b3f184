use anyhow::{Context, Result};
use tokio_serial::{SerialPortBuilderExt, SerialPortInfo, SerialPortType};

/// Serial ports known to the OS, sorted by name.
pub fn list_serial_ports() -> Result<Vec<SerialPortInfo>> {
    let mut ports = tokio_serial::available_ports().context("enumerating serial ports")?;
    ports.sort_by(|a, b| a.port_name.cmp(&b.port_name));
    Ok(ports)
}

fn describe(info: &SerialPortInfo) -> String {
    match &info.port_type {
        SerialPortType::UsbPort(usb) => format!(
            "{} (USB {:04x}:{:04x} {})",
            info.port_name,
            usb.vid,
            usb.pid,
            usb.product.as_deref().unwrap_or("unknown product")
        ),
        SerialPortType::PciPort => format!("{} (PCI)", info.port_name),
        SerialPortType::BluetoothPort => format!("{} (Bluetooth)", info.port_name),
        SerialPortType::Unknown => info.port_name.clone(),
    }
}

/// Open the port and close it again, so a missing or busy device is reported
/// before recording starts. The port is opened non-blocking and never waits
/// for carrier.
pub fn probe_serial_port(port: &str, baud_rate: u32) -> Result<()> {
    tokio_serial::new(port, baud_rate)
        .open_native_async()
        .with_context(|| format!("opening serial port {}", port))?;
    Ok(())
}

/// Log the available ports and whether `port` can be opened.
pub fn report_serial_ports(port: &str, baud_rate: u32) -> bool {
    match list_serial_ports() {
        Ok(ports) if ports.is_empty() => tracing::info!("no serial ports found"),
        Ok(ports) => {
            tracing::info!("available ports:");
            for p in &ports {
                tracing::info!("  {}", describe(p));
            }
        }
        Err(e) => tracing::warn!("{:#}", e),
    }

    match probe_serial_port(port, baud_rate) {
        Ok(()) => {
            tracing::info!("serial port {} opened successfully", port);
            true
        }
        Err(e) => {
            tracing::warn!("failed to open serial port: {:#}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_port_types() {
        let pci = SerialPortInfo { port_name: "/dev/ttyS0".to_string(), port_type: SerialPortType::PciPort };
        assert_eq!(describe(&pci), "/dev/ttyS0 (PCI)");

        let unknown = SerialPortInfo { port_name: "/dev/ttyACM0".to_string(), port_type: SerialPortType::Unknown };
        assert_eq!(describe(&unknown), "/dev/ttyACM0");
    }

    #[test]
    fn test_list_serial_ports_is_sorted() {
        // whatever the host has, enumeration must not fail hard
        if let Ok(ports) = list_serial_ports() {
            assert!(ports.windows(2).all(|w| w[0].port_name <= w[1].port_name));
        }
    }

    #[tokio::test]
    async fn test_probe_missing_port() {
        let err = probe_serial_port("/dev/no-such-oximeter", 9600).unwrap_err();
        assert!(format!("{:#}", err).contains("/dev/no-such-oximeter"));
        assert!(!report_serial_ports("/dev/no-such-oximeter", 9600));
    }
}
