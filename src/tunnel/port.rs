use std::time::Duration;

use serialport::{SerialPort, SerialPortType};

use super::{Result, TunnelError};

/// Read timeout; the server loop wakes at least this often
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct PortInfo {
    pub port_name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

/// Serial ports a tunnel board may be attached to
pub fn list_ports() -> Result<Vec<PortInfo>> {
    let ports = serialport::available_ports()?;
    let mut found = Vec::new();

    for port in ports {
        let info = match port.port_type {
            SerialPortType::UsbPort(usb_info) => PortInfo {
                port_name: port.port_name,
                vid: Some(usb_info.vid),
                pid: Some(usb_info.pid),
                manufacturer: usb_info.manufacturer,
                product: usb_info.product,
            },
            _ => PortInfo {
                port_name: port.port_name,
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
            },
        };
        found.push(info);
    }

    Ok(found)
}

/// Open `port_name` for tunnelling
pub fn open_port(port_name: &str, baud_rate: u32) -> Result<Box<dyn SerialPort>> {
    let known = serialport::available_ports()?
        .iter()
        .any(|p| p.port_name == port_name);
    if !known {
        log::warn!("{} not listed by the system, trying anyway", port_name);
    }

    let port = serialport::new(port_name, baud_rate)
        .timeout(READ_TIMEOUT)
        .open()
        .map_err(|e| match e.kind() {
            serialport::ErrorKind::NoDevice => TunnelError::PortNotFound(port_name.to_string()),
            _ => TunnelError::ConnectionFailed(e.to_string()),
        })?;

    log::info!("Opened {} at {} baud", port_name, baud_rate);
    Ok(port)
}
